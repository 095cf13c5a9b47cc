//! Detects listening TCP ports and announces them to the client

use portfwd_mux::Control;
use portfwd_proto::PortNotification;
use std::collections::BTreeSet;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::AgentError;

/// Socket state `TCP_LISTEN` as printed in `/proc/net/tcp`
const TCP_LISTEN: &str = "0A";

/// Ports in LISTEN state from a `/proc/net/tcp` or `/proc/net/tcp6` table
///
/// The first line is the column header. Each row's second column is the
/// local address (`0100007F:1F90`, port in hex) and the fourth the state.
pub fn parse_listening(table: &str) -> Vec<u16> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 || fields[3] != TCP_LISTEN {
                return None;
            }
            let (_, port) = fields[1].rsplit_once(':')?;
            u16::from_str_radix(port, 16).ok().filter(|port| *port != 0)
        })
        .collect()
}

/// Periodic scanner of the kernel socket tables
#[derive(Debug)]
pub struct PortDetector {
    paths: Vec<PathBuf>,
    interval: Duration,
    known: BTreeSet<u16>,
}

impl PortDetector {
    pub fn new(interval: Duration) -> Self {
        Self {
            paths: vec![
                PathBuf::from("/proc/net/tcp"),
                PathBuf::from("/proc/net/tcp6"),
            ],
            interval,
            known: BTreeSet::new(),
        }
    }

    pub fn with_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.paths = paths;
        self
    }

    /// All ports currently listening
    ///
    /// Missing tables are skipped; fails only if none could be read.
    pub async fn scan(&self) -> io::Result<BTreeSet<u16>> {
        let mut ports = BTreeSet::new();
        let mut last_error = None;
        let mut read_any = false;

        for path in &self.paths {
            match tokio::fs::read_to_string(path).await {
                Ok(table) => {
                    read_any = true;
                    ports.extend(parse_listening(&table));
                }
                Err(e) => {
                    debug!(path = %path.display(), "Cannot read socket table: {}", e);
                    last_error = Some(e);
                }
            }
        }

        match (read_any, last_error) {
            (false, Some(e)) => Err(e),
            _ => Ok(ports),
        }
    }

    /// Ports listening now that were not listening at the previous poll
    ///
    /// The first poll reports every listening port. A port that stops
    /// listening is reported again when it comes back.
    pub async fn poll_new(&mut self) -> io::Result<Vec<u16>> {
        let current = self.scan().await?;
        let fresh = current.difference(&self.known).copied().collect();
        self.known = current;
        Ok(fresh)
    }

    /// Scan until the session closes, announcing each new port
    pub async fn run(mut self, control: Control) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut initial = true;

        loop {
            tokio::select! {
                _ = control.closed() => break,
                _ = ticker.tick() => {}
            }

            let fresh = match self.poll_new().await {
                Ok(fresh) => fresh,
                Err(e) => {
                    error!("Failed to detect ports: {}", e);
                    continue;
                }
            };

            if initial {
                info!(count = fresh.len(), "Initial port scan complete");
                initial = false;
            }

            for port in fresh {
                info!(port, "Detected listening port");
                if let Err(e) = notify(&control, port).await {
                    warn!(port, "Failed to notify client: {}", e);
                }
            }
        }

        debug!("Port detector stopped");
    }
}

/// Announce `port` on a fresh stream: `{"port":N}` followed by FIN
pub async fn notify(control: &Control, port: u16) -> Result<(), AgentError> {
    let mut stream = control.open_stream().await?;

    let mut message = PortNotification::new(port).to_bytes()?;
    message.push(b'\n');

    stream.write_all(&message).await?;
    stream.shutdown().await?;
    Ok(())
}
