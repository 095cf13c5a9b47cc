//! Multiplexer errors

use portfwd_proto::{CodecError, StreamId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Session closed")]
    SessionClosed,

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Remote end is going away")]
    RemoteGoAway,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Duplicate stream declared: {0}")]
    DuplicateStream(StreamId),

    #[error("Receive window exceeded on stream {0}")]
    WindowExceeded(StreamId),

    #[error("No available stream IDs")]
    StreamIdsExhausted,

    #[error("Timeout")]
    Timeout,
}

impl MuxError {
    /// Errors caused by the peer violating the protocol
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            MuxError::Codec(_)
                | MuxError::ProtocolError(_)
                | MuxError::DuplicateStream(_)
                | MuxError::WindowExceeded(_)
        )
    }
}
