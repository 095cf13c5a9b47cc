//! portfwd agent CLI
//!
//! Launched by the client (usually through ssh or a container exec) and
//! spoken to over stdin/stdout. stdout carries the session, so logs go to
//! stderr or a file.

use anyhow::{Context, Result};
use clap::Parser;
use portfwd_agent::{Agent, AgentConfig};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Remote end of a portfwd session, speaking over stdin/stdout
#[derive(Parser, Debug)]
#[command(name = "portfwd-agent")]
#[command(version)]
struct Args {
    /// Write logs to this file instead of stderr
    #[arg(long, env = "PORTFWD_AGENT_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error) or an EnvFilter directive
    #[arg(long, default_value = "info", env = "PORTFWD_AGENT_LOG_LEVEL")]
    log_level: String,

    /// How often to scan for newly listening ports, in milliseconds
    #[arg(long, default_value_t = 1000)]
    scan_interval_ms: u64,

    /// Do not announce listening ports to the client
    #[arg(long)]
    no_port_detection: bool,
}

/// Setup logging; never to stdout, which carries the session
fn setup_logging(log_level: &str, log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?;

            tracing_subscriber::registry()
                .with(
                    fmt::layer()
                        .with_writer(Mutex::new(file))
                        .with_ansi(false)
                        .with_target(true),
                )
                .with(filter)
                .init();

            eprintln!("Collecting agent logs at file: {}", path.display());
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
                .with(filter)
                .init();
        }
    }

    Ok(())
}

#[cfg(unix)]
async fn sigterm() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(_) => std::future::pending::<()>().await,
    }
}

#[cfg(not(unix))]
async fn sigterm() {
    std::future::pending::<()>().await
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level, args.log_file.as_deref())?;

    info!("portfwd agent starting");

    let config = AgentConfig {
        port_detection: !args.no_port_detection,
        scan_interval: Duration::from_millis(args.scan_interval_ms.max(10)),
        ..AgentConfig::default()
    };
    let agent = Agent::new(config);
    let stdio = tokio::io::join(tokio::io::stdin(), tokio::io::stdout());

    let code = tokio::select! {
        result = agent.serve(stdio) => match result {
            Ok(()) => 0,
            Err(e) => {
                error!("Agent error: {:#}", e);
                1
            }
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            0
        }
        _ = sigterm() => {
            info!("Received SIGTERM, shutting down");
            0
        }
    };

    info!("Agent stopped");
    // The blocking stdin reader would otherwise hold the runtime open
    std::process::exit(code);
}
