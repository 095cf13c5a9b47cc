//! Port forwarding over a multiplexed stdio session
//!
//! A [`PortForwarder`] owns one yamux session to a peer process (usually
//! spawned by us, talking over its stdin/stdout). For every forward it binds
//! a loopback TCP listener; each accepted connection gets its own stream,
//! announced with a small JSON control message and gated on the peer's `OK`
//! before bytes are relayed. Ports the peer reports as newly listening are
//! forwarded automatically.
//!
//! ```no_run
//! use portfwd_client::{ForwardTarget, PeerCommand, PortForwarder};
//!
//! # async fn run() -> Result<(), portfwd_client::ForwardError> {
//! let forwarder = PortForwarder::builder()
//!     .spawn(PeerCommand::new("ssh").args(["devbox", "portfwd-agent"]))
//!     .await?;
//!
//! let local_port = forwarder.add_port(ForwardTarget::tcp(5432), None).await?;
//! println!("postgres on 127.0.0.1:{}", local_port);
//!
//! forwarder.destroy().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod forwarder;
pub mod transport;

mod bridge;
mod incoming;
mod session;

pub use config::{ForwardSpec, ForwarderConfig, ForwarderConfigBuilder, SessionConfig};
pub use error::{BridgeError, ForwardError, TransportError};
pub use forwarder::{ForwardInfo, ForwarderBuilder, PortForwarder};
pub use transport::{PeerCommand, PeerProcess, StdioPipe};

pub use portfwd_mux::Control;
pub use portfwd_proto::{ForwardTarget, PortNotification, TargetParseError};
