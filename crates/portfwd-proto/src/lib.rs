//! Tunnel Protocol Definitions
//!
//! This crate defines the JSON payloads exchanged on logical streams and the
//! yamux frame format that every logical stream is multiplexed with.
//!
//! Two payloads travel on top of the multiplexed session:
//! - the control message, sent by the client as the first bytes of every
//!   stream it opens (`{"type":"tcp","port":8080}`), answered by [`ACK`];
//! - the auto-forward notification, sent by the peer on a stream of its own
//!   (`{"port":8080}`) and terminated by end-of-stream.

pub mod codec;
pub mod frame;
pub mod messages;

pub use codec::{CodecError, FrameCodec};
pub use frame::{Flags, Frame, FrameType, GoAwayCode, Header, StreamId};
pub use messages::{ForwardTarget, PortNotification, TargetParseError};

/// yamux protocol version carried in every frame header
pub const PROTOCOL_VERSION: u8 = 0;

/// Stream ID reserved for session-level frames (ping, go away)
pub const SESSION_STREAM_ID: StreamId = 0;

/// Initial per-stream window, in both directions (256KB)
pub const INITIAL_STREAM_WINDOW: u32 = 256 * 1024;

/// Maximum data frame payload accepted from the peer (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Acknowledgement written by the peer once it reached the forward target
pub const ACK: &[u8] = b"OK";
