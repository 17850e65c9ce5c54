use crate::{DEFAULT_PORT, DEFAULT_TLS_PORT};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::PathBuf;
use std::time::Duration;

/// Where and how to reach the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub host: String,
    /// Defaults to 5672, or 5671 when `tls` is set
    pub port: Option<u16>,
    pub tls: bool,
    /// PEM bundle used to verify the broker certificate
    pub ca_cert: Option<PathBuf>,
    pub connect_timeout_secs: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings {
            host: "localhost".to_string(),
            port: None,
            tls: false,
            ca_cert: None,
            connect_timeout_secs: 10,
        }
    }
}

impl ConnectionSettings {
    pub fn new(host: impl Into<String>) -> Self {
        ConnectionSettings {
            host: host.into(),
            ..Default::default()
        }
    }

    pub fn port(&self) -> u16 {
        match self.port {
            Some(port) => port,
            None if self.tls => DEFAULT_TLS_PORT,
            None => DEFAULT_PORT,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port())
    }

    pub fn url(&self) -> String {
        let scheme = if self.tls { "amqps" } else { "amqp" };
        format!("{}://{}:{}/", scheme, self.host, self.port())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// What to do when a connection attempt fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Fail immediately
    Disabled,
    /// Wait a fixed interval and try again, indefinitely
    Fixed(Duration),
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Fixed(Duration::from_secs(5))
    }
}

impl RetryPolicy {
    pub fn from_secs(secs: u64) -> Self {
        RetryPolicy::Fixed(Duration::from_secs(secs))
    }

    pub fn interval(&self) -> Option<Duration> {
        match self {
            RetryPolicy::Disabled => None,
            RetryPolicy::Fixed(interval) => Some(*interval),
        }
    }
}

/// In config files retry is either `false` or a number of seconds
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RetryRepr {
    Enabled(bool),
    Seconds(u64),
}

impl Serialize for RetryPolicy {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RetryPolicy::Disabled => RetryRepr::Enabled(false).serialize(serializer),
            RetryPolicy::Fixed(interval) => {
                RetryRepr::Seconds(interval.as_secs()).serialize(serializer)
            }
        }
    }
}

impl<'de> Deserialize<'de> for RetryPolicy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match RetryRepr::deserialize(deserializer)? {
            RetryRepr::Enabled(false) => RetryPolicy::Disabled,
            RetryRepr::Enabled(true) => RetryPolicy::default(),
            RetryRepr::Seconds(secs) => RetryPolicy::from_secs(secs),
        })
    }
}
