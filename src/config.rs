use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Timing and retry settings for a controller and its coordinator.
///
/// Every field has a default, so a config file only needs the values it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// How long a connection may sit idle before it is closed
    pub disconnect_delay_secs: u64,
    /// How long to wait for the notification answering a command
    pub response_timeout_secs: u64,
    pub command_attempts: u32,
    pub connect_attempts: u32,
    /// Pause between attempts after a bus error
    pub backoff_ms: u64,
    /// Minimum time between two polls of the device
    pub poll_interval_secs: u64,
    /// How long to wait for a first advertisement at startup
    pub startup_timeout_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            disconnect_delay_secs: 120,
            response_timeout_secs: 5,
            command_attempts: 3,
            connect_attempts: 3,
            backoff_ms: 250,
            poll_interval_secs: 30,
            startup_timeout_secs: 30,
        }
    }
}

impl ControllerConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn disconnect_delay(&self) -> Duration {
        Duration::from_secs(self.disconnect_delay_secs)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn command_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.command_attempts, Duration::from_millis(self.backoff_ms))
    }

    pub fn connect_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.connect_attempts, Duration::from_millis(self.backoff_ms))
    }
}

#[test]
fn test_partial_config_uses_defaults() {
    let config: ControllerConfig =
        serde_json::from_str(r#"{ "disconnect_delay_secs": 10, "command_attempts": 1 }"#).unwrap();
    assert_eq!(config.disconnect_delay(), Duration::from_secs(10));
    assert_eq!(config.command_retry().attempts, 1);
    assert_eq!(config.response_timeout(), Duration::from_secs(5));
    assert_eq!(config.poll_interval(), Duration::from_secs(30));
    assert_eq!(config.connect_retry().backoff, Duration::from_millis(250));
}
