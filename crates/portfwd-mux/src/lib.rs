//! Stream multiplexing over a single duplex byte channel
//!
//! Implements the yamux wire protocol (as spoken by `hashicorp/yamux`) on top
//! of any `AsyncRead + AsyncWrite` transport, typically a child process's
//! stdio pipes.
//!
//! # Architecture
//!
//! ```text
//!   Control (cloneable) ──open/ping/close──┐
//!   Stream (AsyncRead + AsyncWrite) ───────┤
//!                                          ▼
//!                              outbound channel ──► writer task ──► transport
//!                                                                      │
//!   Incoming::accept() ◄── reader task ◄───────────────────────────────┘
//! ```
//!
//! The reader task owns the read half and dispatches frames to per-stream
//! state; the writer task owns the write half and serializes every frame.
//! Per-stream flow control keeps the amount of queued data bounded by the
//! peer's receive window.

pub mod config;
pub mod error;
pub mod session;
pub mod stream;

pub use config::Config;
pub use error::MuxError;
pub use session::{Control, Incoming, Mode, Session};
pub use stream::Stream;

pub use portfwd_proto::StreamId;
