//! Protocol timings.
//!
//! The defaults are the values both endpoints must agree on for normal
//! operation. Overrides are mainly useful for tests and experiments.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read timings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid timings file: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    /// Tick loop frequency in Hz
    pub tick_rate: u32,
    pub ping_interval_ms: u64,
    pub typing_expiry_ms: u64,
    /// Silence after which a peer is presumed gone
    pub liveness_timeout_secs: u64,
    pub handshake_attempts: u32,
    pub handshake_timeout_ms: u64,
    /// Hold on inbound processing after the first presence request
    pub bootstrap_pause_ms: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            tick_rate: 60,
            ping_interval_ms: 400,
            typing_expiry_ms: 3000,
            liveness_timeout_secs: 10,
            handshake_attempts: 8,
            handshake_timeout_ms: 1000,
            bootstrap_pause_ms: 100,
        }
    }
}

impl Timings {
    /// Reads a JSON file; missing fields keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn tick_duration(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(self.tick_rate.max(1)))
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn typing_expiry(&self) -> Duration {
        Duration::from_millis(self.typing_expiry_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn bootstrap_pause(&self) -> Duration {
        Duration::from_millis(self.bootstrap_pause_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timings() {
        let timings = Timings::default();
        assert_eq!(timings.tick_duration(), Duration::from_nanos(16_666_666));
        assert_eq!(timings.ping_interval(), Duration::from_millis(400));
        assert_eq!(timings.typing_expiry(), Duration::from_secs(3));
        assert_eq!(timings.liveness_timeout(), Duration::from_secs(10));
        assert_eq!(timings.handshake_attempts, 8);
        assert_eq!(timings.handshake_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let timings: Timings =
            serde_json::from_str(r#"{ "tick_rate": 30, "liveness_timeout_secs": 2 }"#).unwrap();
        assert_eq!(timings.tick_rate, 30);
        assert_eq!(timings.liveness_timeout_secs, 2);
        assert_eq!(timings.ping_interval_ms, 400);
    }

    #[test]
    fn test_zero_tick_rate_does_not_divide_by_zero() {
        let timings = Timings {
            tick_rate: 0,
            ..Timings::default()
        };
        assert_eq!(timings.tick_duration(), Duration::from_secs(1));
    }

    #[test]
    fn test_load_missing_file() {
        let result = Timings::load("/definitely/not/here.json");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
