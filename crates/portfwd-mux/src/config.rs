//! Session configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Multiplexed session configuration
///
/// Defaults are tuned for stdio pipes, which can see long stalls under
/// backpressure: generous write timeout, keep-alive every 30 seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Periodically ping the peer and tear the session down if it stops answering
    pub enable_keep_alive: bool,

    #[serde(with = "duration_millis")]
    pub keep_alive_interval: Duration,

    /// Maximum time a single frame write to the transport may take
    #[serde(with = "duration_millis")]
    pub connection_write_timeout: Duration,

    /// Receive window granted to the peer for each stream
    pub max_stream_window: u32,

    /// Inbound streams queued before new ones are reset
    pub accept_backlog: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enable_keep_alive: true,
            keep_alive_interval: Duration::from_secs(30),
            connection_write_timeout: Duration::from_secs(60),
            max_stream_window: portfwd_proto::INITIAL_STREAM_WINDOW,
            accept_backlog: 256,
        }
    }
}

impl Config {
    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.enable_keep_alive = true;
        self.keep_alive_interval = interval;
        self
    }

    pub fn without_keep_alive(mut self) -> Self {
        self.enable_keep_alive = false;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.connection_write_timeout = timeout;
        self
    }

    /// Windows below the protocol's initial window are raised to it
    pub fn with_max_stream_window(mut self, window: u32) -> Self {
        self.max_stream_window = window.max(portfwd_proto::INITIAL_STREAM_WINDOW);
        self
    }

    pub fn with_accept_backlog(mut self, backlog: usize) -> Self {
        self.accept_backlog = backlog.max(1);
        self
    }

    pub(crate) fn stream_window(&self) -> u32 {
        self.max_stream_window
            .max(portfwd_proto::INITIAL_STREAM_WINDOW)
    }
}

/// Serialize a `Duration` as integer milliseconds
pub mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_stdio_tuning() {
        let config = Config::default();
        assert!(config.enable_keep_alive);
        assert_eq!(config.keep_alive_interval, Duration::from_secs(30));
        assert_eq!(config.connection_write_timeout, Duration::from_secs(60));
        assert_eq!(config.max_stream_window, 256 * 1024);
    }

    #[test]
    fn test_window_never_below_initial() {
        let config = Config::default().with_max_stream_window(1024);
        assert_eq!(config.max_stream_window, portfwd_proto::INITIAL_STREAM_WINDOW);
    }

    #[test]
    fn test_serde_durations_in_millis() {
        let config = Config::default().with_keep_alive(Duration::from_millis(1500));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["keep_alive_interval"], 1500);

        let back: Config = serde_json::from_value(json).unwrap();
        assert_eq!(back.keep_alive_interval, Duration::from_millis(1500));
    }
}
