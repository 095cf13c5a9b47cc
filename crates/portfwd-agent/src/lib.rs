//! portfwd agent - the remote end of a port forwarding session
//!
//! Runs a yamux server session over a duplex channel (stdin/stdout when
//! launched by the client). Every stream the client opens starts with a JSON
//! control message naming a TCP port or Unix socket; the agent dials it,
//! answers `OK` and relays bytes until both sides finish. Newly listening
//! TCP ports on this host are announced back to the client.

pub mod detector;
pub mod forwarder;

pub use detector::{parse_listening, PortDetector};
pub use forwarder::{forward_stream, read_control_message};

use portfwd_mux::config::duration_millis;
use portfwd_mux::{Control, MuxError, Session};
use portfwd_proto::{ForwardTarget, TargetParseError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, Instrument};

/// Agent errors
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session error: {0}")]
    Session(#[from] MuxError),

    #[error("Client did not answer pings after {attempts} attempts")]
    SessionNotReady { attempts: u32 },

    #[error("Invalid control message: {0}")]
    ControlMessage(#[from] serde_json::Error),

    #[error("Invalid forward target: {0}")]
    InvalidTarget(#[from] TargetParseError),

    #[error("Control message exceeds {0} bytes")]
    ControlMessageTooLarge(usize),

    #[error("Stream ended before a complete control message")]
    ControlMessageIncomplete,

    #[error("Failed to connect to {target}: {source}")]
    Connect {
        target: ForwardTarget,
        source: std::io::Error,
    },

    #[error("Unsupported target on this platform: {0}")]
    UnsupportedTarget(ForwardTarget),
}

/// Agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub mux: portfwd_mux::Config,

    /// Pings sent to the client before giving up
    pub ready_attempts: u32,

    #[serde(with = "duration_millis")]
    pub ready_interval: Duration,

    /// Announce newly listening TCP ports to the client
    pub port_detection: bool,

    #[serde(with = "duration_millis")]
    pub scan_interval: Duration,

    /// Socket tables scanned for listening ports
    pub proc_net_paths: Vec<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            mux: portfwd_mux::Config::default(),
            ready_attempts: 100,
            ready_interval: Duration::from_millis(20),
            port_detection: true,
            scan_interval: Duration::from_secs(1),
            proc_net_paths: vec![
                PathBuf::from("/proc/net/tcp"),
                PathBuf::from("/proc/net/tcp6"),
            ],
        }
    }
}

/// The remote peer of a port forwarding session
pub struct Agent {
    config: AgentConfig,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    /// Serve one session over `io` until the client goes away
    pub async fn serve<T>(&self, io: T) -> Result<(), AgentError>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut session = Session::server(io, self.config.mux.clone());
        let control = session.control();
        let mut incoming = session
            .take_incoming()
            .ok_or(AgentError::Session(MuxError::SessionClosed))?;

        if let Err(e) = self.wait_ready(&control).await {
            let _ = control.close().await;
            return Err(e);
        }
        info!(session = control.id(), "Client session ready");

        let detector = if self.config.port_detection {
            let detector = PortDetector::new(self.config.scan_interval)
                .with_paths(self.config.proc_net_paths.clone());
            Some(tokio::spawn(detector.run(control.clone())))
        } else {
            None
        };

        while let Some(stream) = incoming.accept().await {
            let stream_id = stream.id();
            debug!(stream_id, "Stream accepted");
            tokio::spawn(
                async move {
                    if let Err(e) = forward_stream(stream).await {
                        error!("Forwarding failed: {}", e);
                    }
                }
                .instrument(tracing::info_span!("stream", stream_id)),
            );
        }

        if let Some(detector) = detector {
            detector.abort();
        }
        info!("Client session ended");
        Ok(())
    }

    async fn wait_ready(&self, control: &Control) -> Result<(), AgentError> {
        let attempts = self.config.ready_attempts;
        for attempt in 1..=attempts {
            tokio::time::sleep(self.config.ready_interval).await;

            let probe = tokio::time::timeout(self.config.ready_interval * 5, control.ping()).await;
            match probe {
                Ok(Ok(_)) => {
                    debug!(attempt, "Pinged the client");
                    return Ok(());
                }
                Ok(Err(_)) if control.is_closed() => {
                    return Err(AgentError::SessionNotReady { attempts: attempt })
                }
                _ => {}
            }
        }
        Err(AgentError::SessionNotReady { attempts })
    }
}
