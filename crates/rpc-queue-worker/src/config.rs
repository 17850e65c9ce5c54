use crate::WorkerError;
use rpc_queue_core::{ConnectionSettings, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub broker: ConnectionSettings,
    /// `false` disables connect retry, a number sets the interval in seconds
    pub retry_interval_secs: RetryPolicy,
    pub log_level: String,
    pub graceful_shutdown_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            broker: ConnectionSettings::default(),
            retry_interval_secs: RetryPolicy::default(),
            log_level: "info".to_string(),
            graceful_shutdown_timeout_secs: 30,
        }
    }
}

impl WorkerConfig {
    pub fn from_file(path: &str) -> Result<Self, WorkerError> {
        let contents = std::fs::read_to_string(path)?;
        let config: WorkerConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    pub fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.broker.url(), "amqp://localhost:5672/");
        assert_eq!(config.retry_interval_secs, RetryPolicy::from_secs(5));
        assert_eq!(config.graceful_shutdown_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_from_yaml() {
        let yaml = "\
broker:
  host: rabbit.internal
  tls: true
retry_interval_secs: false
log_level: debug
";
        let config: WorkerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.broker.url(), "amqps://rabbit.internal:5671/");
        assert_eq!(config.retry_interval_secs, RetryPolicy::Disabled);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.graceful_shutdown_timeout_secs, 30);
    }
}
