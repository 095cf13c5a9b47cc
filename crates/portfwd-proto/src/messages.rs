//! Protocol message types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Remote-side destination of a forward
///
/// Serializes to the control message sent as the first bytes of every stream
/// the client opens: `{"type":"tcp","port":8080}` or
/// `{"type":"unix","path":"/run/app.sock"}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ForwardTarget {
    /// TCP port on the peer's loopback interface
    Tcp { port: u16 },
    /// Unix domain socket path on the peer
    Unix { path: String },
}

/// Errors produced while parsing or validating a forward target
#[derive(Debug, Error)]
pub enum TargetParseError {
    #[error("Invalid port '{0}'")]
    InvalidPort(String),

    #[error("Remote port must not be 0")]
    ZeroPort,

    #[error("Unix socket path must not be empty")]
    EmptyPath,

    #[error("Invalid control message: {0}")]
    Json(#[from] serde_json::Error),
}

impl ForwardTarget {
    pub fn tcp(port: u16) -> Self {
        ForwardTarget::Tcp { port }
    }

    pub fn unix(path: impl Into<String>) -> Self {
        ForwardTarget::Unix { path: path.into() }
    }

    /// Remote TCP port, if this is a TCP target
    pub fn remote_port(&self) -> Option<u16> {
        match self {
            ForwardTarget::Tcp { port } => Some(*port),
            ForwardTarget::Unix { .. } => None,
        }
    }

    pub fn validate(&self) -> Result<(), TargetParseError> {
        match self {
            ForwardTarget::Tcp { port: 0 } => Err(TargetParseError::ZeroPort),
            ForwardTarget::Unix { path } if path.is_empty() => Err(TargetParseError::EmptyPath),
            _ => Ok(()),
        }
    }

    /// Encode as the control message written on a freshly opened stream
    pub fn to_control_bytes(&self) -> Result<Vec<u8>, TargetParseError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a complete control message
    pub fn from_control_bytes(bytes: &[u8]) -> Result<Self, TargetParseError> {
        let target: ForwardTarget = serde_json::from_slice(bytes)?;
        target.validate()?;
        Ok(target)
    }
}

impl fmt::Display for ForwardTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardTarget::Tcp { port } => write!(f, "tcp:{}", port),
            ForwardTarget::Unix { path } => write!(f, "unix:{}", path),
        }
    }
}

/// Parses `8080`, `tcp:8080` or `unix:/path/to.sock`
impl FromStr for ForwardTarget {
    type Err = TargetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("unix:") {
            let target = ForwardTarget::unix(path);
            target.validate()?;
            return Ok(target);
        }

        let port_str = s.strip_prefix("tcp:").unwrap_or(s);
        let port: u16 = port_str
            .parse()
            .map_err(|_| TargetParseError::InvalidPort(port_str.to_string()))?;

        let target = ForwardTarget::tcp(port);
        target.validate()?;
        Ok(target)
    }
}

/// Notification sent by the peer when it detects a newly listening port
///
/// Wire format: `{"port":8080}`. Additional fields are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortNotification {
    pub port: u16,
}

impl PortNotification {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Interpret a buffered incoming stream payload
    ///
    /// Returns `Err` when the payload is not JSON at all and `Ok(None)` when it
    /// is JSON but not a usable notification (no numeric `port`, zero, or out of
    /// the u16 range).
    pub fn decode(bytes: &[u8]) -> Result<Option<Self>, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_slice(bytes)?;

        let port = value
            .get("port")
            .and_then(whole_number)
            .and_then(|port| u16::try_from(port).ok())
            .filter(|port| *port != 0);

        Ok(port.map(Self::new))
    }
}

/// A JSON number with an exact non-negative integer value (`8080` or `8080.0`)
fn whole_number(value: &serde_json::Value) -> Option<u64> {
    if let Some(n) = value.as_u64() {
        return Some(n);
    }
    let f = value.as_f64()?;
    (f >= 0.0 && f.fract() == 0.0 && f <= u64::MAX as f64).then(|| f as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_control_message_format() {
        let bytes = ForwardTarget::tcp(8080).to_control_bytes().unwrap();
        assert_eq!(bytes, br#"{"type":"tcp","port":8080}"#);
    }

    #[test]
    fn test_unix_control_message_format() {
        let bytes = ForwardTarget::unix("/tmp/app.sock")
            .to_control_bytes()
            .unwrap();
        assert_eq!(bytes, br#"{"type":"unix","path":"/tmp/app.sock"}"#);
    }

    #[test]
    fn test_control_message_decode_accepts_trailing_newline() {
        let target = ForwardTarget::from_control_bytes(b"{\"type\":\"tcp\",\"port\":22}\n").unwrap();
        assert_eq!(target, ForwardTarget::tcp(22));
    }

    #[test]
    fn test_control_message_decode_rejects_unknown_type() {
        assert!(ForwardTarget::from_control_bytes(br#"{"type":"udp","port":53}"#).is_err());
        assert!(ForwardTarget::from_control_bytes(br#"{"type":"unix","path":""}"#).is_err());
    }

    #[test]
    fn test_parse_targets() {
        assert_eq!(
            "8080".parse::<ForwardTarget>().unwrap(),
            ForwardTarget::tcp(8080)
        );
        assert_eq!(
            "tcp:443".parse::<ForwardTarget>().unwrap(),
            ForwardTarget::tcp(443)
        );
        assert_eq!(
            "unix:/run/docker.sock".parse::<ForwardTarget>().unwrap(),
            ForwardTarget::unix("/run/docker.sock")
        );

        assert!("0".parse::<ForwardTarget>().is_err());
        assert!("70000".parse::<ForwardTarget>().is_err());
        assert!("unix:".parse::<ForwardTarget>().is_err());
        assert!("web".parse::<ForwardTarget>().is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(ForwardTarget::tcp(5432).to_string(), "tcp:5432");
        assert_eq!(ForwardTarget::unix("/a.sock").to_string(), "unix:/a.sock");
    }

    #[test]
    fn test_notification_decode() {
        assert_eq!(
            PortNotification::decode(br#"{"port":9001}"#).unwrap(),
            Some(PortNotification::new(9001))
        );
        assert_eq!(
            PortNotification::decode(b"{\"port\":3000,\"pid\":12}\n").unwrap(),
            Some(PortNotification::new(3000))
        );
        assert_eq!(
            PortNotification::decode(br#"{"port":8080.0}"#).unwrap(),
            Some(PortNotification::new(8080))
        );
    }

    #[test]
    fn test_notification_decode_ignores_other_shapes() {
        assert_eq!(PortNotification::decode(br#"{"hello":"world"}"#).unwrap(), None);
        assert_eq!(PortNotification::decode(br#"{"port":"80"}"#).unwrap(), None);
        assert_eq!(PortNotification::decode(br#"{"port":0}"#).unwrap(), None);
        assert_eq!(PortNotification::decode(br#"{"port":80.5}"#).unwrap(), None);
        assert_eq!(PortNotification::decode(br#"{"port":-22}"#).unwrap(), None);
        assert_eq!(PortNotification::decode(br#"{"port":70000}"#).unwrap(), None);
        assert_eq!(PortNotification::decode(br#"[1,2,3]"#).unwrap(), None);
        assert!(PortNotification::decode(b"not json").is_err());
    }
}
