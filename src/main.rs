//! portfwd CLI - forward local ports into a process you can only reach over stdio
//!
//! Runs a command (ssh, kubectl exec, docker exec, ...) that starts
//! `portfwd-agent` on the far side, then exposes that side's ports locally.

use anyhow::{Context, Result};
use clap::Parser;
use portfwd_client::{ForwardSpec, ForwarderConfig, PeerCommand, PortForwarder};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LONG_VERSION: &str = concat!(
    env!("PORTFWD_GIT_TAG"),
    "\ncommit: ",
    env!("PORTFWD_GIT_HASH"),
    "\nbuilt: ",
    env!("PORTFWD_BUILD_TIME"),
);

/// portfwd - Forward local ports through a peer process's stdin/stdout
#[derive(Parser, Debug)]
#[command(name = "portfwd")]
#[command(version, long_version = LONG_VERSION)]
#[command(long_about = r#"
Spawn COMMAND as the peer and forward local TCP ports to ports or Unix
sockets on its side. COMMAND must end up running portfwd-agent with its
stdin/stdout connected to ours.

EXAMPLES:
  # Forward local 15432 to postgres on a dev box
  portfwd -L 15432:5432 -- ssh devbox portfwd-agent

  # Forward a Unix socket inside a container to an ephemeral local port
  portfwd -L unix:/run/app.sock -- docker exec -i app portfwd-agent

  # Only forward what is asked for
  portfwd --no-auto-forward -L 8080 -- kubectl exec -i pod/web -- portfwd-agent
"#)]
struct Cli {
    /// Forward to set up: [LOCAL:]REMOTE, REMOTE being PORT, tcp:PORT or unix:PATH
    #[arg(short = 'L', long = "forward", value_name = "SPEC")]
    forwards: Vec<ForwardSpec>,

    /// Working directory for COMMAND
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Ignore ports the peer announces as listening
    #[arg(long)]
    no_auto_forward: bool,

    /// Readiness probes before giving up on the peer
    #[arg(long, default_value_t = 100)]
    ready_attempts: u32,

    /// Pause between readiness probes, in milliseconds
    #[arg(long, default_value_t = 20)]
    ready_interval_ms: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Peer command and its arguments
    #[arg(last = true, required = true, value_name = "COMMAND")]
    command: Vec<String>,
}

/// Setup logging on stderr; stdout is left for the port report
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
        .with(filter)
        .init();
}

fn peer_command(cli: &Cli) -> Result<PeerCommand> {
    let (program, args) = cli
        .command
        .split_first()
        .context("No peer command given")?;

    let mut command = PeerCommand::new(program.as_str()).args(args.iter().cloned());
    if let Some(cwd) = &cli.cwd {
        command = command.cwd(cwd.clone());
    }
    Ok(command)
}

async fn add_forwards(forwarder: &PortForwarder, specs: &[ForwardSpec]) -> Result<()> {
    for spec in specs {
        let local_port = forwarder
            .add_port(spec.target.clone(), spec.local_port)
            .await
            .with_context(|| format!("Failed to forward {}", spec))?;
        println!("127.0.0.1:{} -> {}", local_port, spec.target);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let config = ForwarderConfig::builder()
        .ready_attempts(cli.ready_attempts)
        .ready_interval(Duration::from_millis(cli.ready_interval_ms))
        .auto_forward(!cli.no_auto_forward)
        .build()
        .map_err(anyhow::Error::msg)
        .context("Invalid configuration")?;

    let command = peer_command(&cli)?;
    info!(program = %cli.command[0], "Starting peer");

    let forwarder = PortForwarder::builder()
        .config(config)
        .spawn(command)
        .await
        .context("Failed to start session with peer")?;

    if let Err(e) = add_forwards(&forwarder, &cli.forwards).await {
        forwarder.destroy().await;
        return Err(e);
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = forwarder.closed() => {
            error!("Peer session ended");
        }
    }

    forwarder.destroy().await;
    info!("portfwd stopped");
    Ok(())
}
