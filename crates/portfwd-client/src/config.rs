//! Forwarder configuration

use portfwd_mux::config::duration_millis;
use portfwd_proto::{ForwardTarget, TargetParseError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;

/// Readiness handshake policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Probes attempted before giving up with `SessionNotReady`
    pub ready_attempts: u32,

    /// Pause between failed probes
    #[serde(with = "duration_millis")]
    pub ready_interval: Duration,

    /// How long a single ping may take to be answered
    #[serde(with = "duration_millis")]
    pub ready_probe_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ready_attempts: 100,
            ready_interval: Duration::from_millis(20),
            ready_probe_timeout: Duration::from_millis(50),
        }
    }
}

/// Port forwarder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwarderConfig {
    pub session: SessionConfig,
    pub mux: portfwd_mux::Config,
    /// Address local listeners bind to
    pub bind_host: IpAddr,
    /// Forward ports announced by the peer
    pub auto_forward: bool,
    /// Largest peer-initiated message buffered before it is discarded
    pub max_notification_size: usize,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            mux: portfwd_mux::Config::default(),
            bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            auto_forward: true,
            max_notification_size: 64 * 1024,
        }
    }
}

impl ForwarderConfig {
    pub fn builder() -> ForwarderConfigBuilder {
        ForwarderConfigBuilder::default()
    }
}

/// Builder for ForwarderConfig
#[derive(Default)]
pub struct ForwarderConfigBuilder {
    config: ForwarderConfig,
}

impl ForwarderConfigBuilder {
    pub fn ready_attempts(mut self, attempts: u32) -> Self {
        self.config.session.ready_attempts = attempts;
        self
    }

    pub fn ready_interval(mut self, interval: Duration) -> Self {
        self.config.session.ready_interval = interval;
        self
    }

    pub fn ready_probe_timeout(mut self, timeout: Duration) -> Self {
        self.config.session.ready_probe_timeout = timeout;
        self
    }

    pub fn mux(mut self, mux: portfwd_mux::Config) -> Self {
        self.config.mux = mux;
        self
    }

    pub fn bind_host(mut self, host: IpAddr) -> Self {
        self.config.bind_host = host;
        self
    }

    pub fn auto_forward(mut self, enabled: bool) -> Self {
        self.config.auto_forward = enabled;
        self
    }

    pub fn max_notification_size(mut self, size: usize) -> Self {
        self.config.max_notification_size = size;
        self
    }

    pub fn build(self) -> Result<ForwarderConfig, String> {
        if self.config.session.ready_attempts == 0 {
            return Err("ready_attempts must be at least 1".to_string());
        }
        if self.config.max_notification_size == 0 {
            return Err("max_notification_size must be positive".to_string());
        }
        Ok(self.config)
    }
}

/// A forward as written on the command line: `[LOCAL:]REMOTE`
///
/// `REMOTE` is anything [`ForwardTarget`] parses (`8080`, `tcp:8080`,
/// `unix:/run/app.sock`), e.g. `15432:5432` or `8000:unix:/run/app.sock`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSpec {
    pub local_port: Option<u16>,
    pub target: ForwardTarget,
}

impl FromStr for ForwardSpec {
    type Err = TargetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some((local, remote)) = s.split_once(':') {
            if let Ok(local_port) = local.parse::<u16>() {
                return Ok(Self {
                    local_port: Some(local_port),
                    target: remote.parse()?,
                });
            }
        }

        Ok(Self {
            local_port: None,
            target: s.parse()?,
        })
    }
}

impl fmt::Display for ForwardSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.local_port {
            Some(port) => write!(f, "{}:{}", port, self.target),
            None => write!(f, "{}", self.target),
        }
    }
}
