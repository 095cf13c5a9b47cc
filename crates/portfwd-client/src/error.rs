//! Error types

use portfwd_mux::MuxError;
use portfwd_proto::{ForwardTarget, TargetParseError};
use thiserror::Error;

/// Errors surfaced by [`PortForwarder`](crate::PortForwarder) operations
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("Session not ready after {attempts} attempts")]
    SessionNotReady { attempts: u32 },

    #[error("Local port {port} is already in use")]
    AddressInUse { port: u16 },

    #[error("Failed to bind local port {port}: {source}")]
    Bind {
        port: u16,
        source: std::io::Error,
    },

    #[error("Failed to close listener for {target}: {reason}")]
    ListenerClose {
        target: ForwardTarget,
        reason: String,
    },

    #[error("Invalid forward target: {0}")]
    InvalidTarget(#[from] TargetParseError),

    #[error("Port forwarder has been destroyed")]
    Destroyed,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Session error: {0}")]
    Session(#[from] MuxError),
}

/// Failures of the byte channel underneath the session
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("Peer process has no {0} pipe")]
    MissingPipe(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure of a single bridged connection; logged, never surfaced
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Failed to open stream: {0}")]
    Open(#[source] MuxError),

    #[error("Failed to encode control message: {0}")]
    Encode(#[source] TargetParseError),

    #[error("Failed to send control message: {0}")]
    Control(#[source] std::io::Error),

    #[error("Peer closed the stream before acknowledging")]
    NotAcknowledged,

    #[error("Unexpected acknowledgement {0:?}")]
    UnexpectedAck([u8; 2]),

    #[error("Relay error: {0}")]
    Relay(#[source] std::io::Error),
}
