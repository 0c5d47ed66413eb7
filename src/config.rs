use crate::broker::MAX_TOPIC_LEN;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_GPSD_HOST: &str = "127.0.0.1";
const DEFAULT_GPSD_PORT: u16 = 2947;
// Local broker gateway relaying framed records into the message broker
const DEFAULT_BROKER_ADDRESS: &str = "127.0.0.1:29092";
const DEFAULT_TOPIC: &str = "gps";
const DEFAULT_SCHEMA_PATH: &str = "/opt/isoblue2/kafka_gps_log/gps.avsc";
const DEFAULT_FLUSH_TIMEOUT_SECS: u64 = 30;
const DEFAULT_SEND_QUEUE_CAPACITY: usize = 1024;
const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_RECONNECT_BACKOFF_MS: u64 = 200;
const DEFAULT_BUS_ADDRESS: &str = "127.0.0.1:29536";
const DEFAULT_BUS_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpsdConfig {
    pub host: String,
    pub port: u16,
}

impl Default for GpsdConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_GPSD_HOST.to_string(),
            port: DEFAULT_GPSD_PORT,
        }
    }
}

impl GpsdConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker gateway speaking the framed protocol in [`crate::broker`].
    pub address: String,
    pub topic: String,
    /// `None` waits for the shutdown flush indefinitely.
    pub flush_timeout_secs: Option<u64>,
    pub send_queue_capacity: usize,
    pub reconnect_attempts: u32,
    pub reconnect_backoff_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_BROKER_ADDRESS.to_string(),
            topic: DEFAULT_TOPIC.to_string(),
            flush_timeout_secs: Some(DEFAULT_FLUSH_TIMEOUT_SECS),
            send_queue_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            reconnect_backoff_ms: DEFAULT_RECONNECT_BACKOFF_MS,
        }
    }
}

impl BrokerConfig {
    pub fn flush_timeout(&self) -> Option<Duration> {
        self.flush_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Gateway relaying bus frames as text lines.
    pub address: String,
    pub timeout_secs: u64,
    /// Restart monitoring after an expiry instead of exiting.
    pub keep_alive: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_BUS_ADDRESS.to_string(),
            timeout_secs: DEFAULT_BUS_TIMEOUT_SECS,
            keep_alive: false,
        }
    }
}

impl BusConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Process configuration, loaded once at startup and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gpsd: GpsdConfig,
    pub broker: BrokerConfig,
    pub schema_path: PathBuf,
    pub bus: BusConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gpsd: GpsdConfig::default(),
            broker: BrokerConfig::default(),
            schema_path: PathBuf::from(DEFAULT_SCHEMA_PATH),
            bus: BusConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let topic = &self.broker.topic;
        if topic.is_empty() || topic.len() > MAX_TOPIC_LEN {
            return Err(ConfigError::Invalid {
                field: "broker.topic",
                reason: format!("length must be 1..={} bytes, got {}", MAX_TOPIC_LEN, topic.len()),
            });
        }
        if self.broker.address.is_empty() {
            return Err(ConfigError::Invalid {
                field: "broker.address",
                reason: "must not be empty".to_string(),
            });
        }
        if self.broker.send_queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "broker.send_queue_capacity",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.bus.timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "bus.timeout_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_gives_defaults() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.broker.topic, "gps");
        assert_eq!(config.gpsd.address(), "127.0.0.1:2947");
        assert_eq!(config.broker.flush_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_default_broker_is_local_gateway() {
        let broker = BrokerConfig::default();
        assert_eq!(broker.address, "127.0.0.1:29092");
        assert!(broker.address.parse::<std::net::SocketAddr>().unwrap().ip().is_loopback());
    }

    #[test]
    fn test_partial_override() {
        let config = Config::from_json(
            r#"{"broker": {"topic": "tractor-gps", "flush_timeout_secs": null}, "bus": {"timeout_secs": 2}}"#,
        )
        .unwrap();
        assert_eq!(config.broker.topic, "tractor-gps");
        assert_eq!(config.broker.address, DEFAULT_BROKER_ADDRESS);
        assert_eq!(config.broker.flush_timeout(), None);
        assert_eq!(config.bus.timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_rejects_empty_topic() {
        let err = Config::from_json(r#"{"broker": {"topic": ""}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "broker.topic", .. }));
    }

    #[test]
    fn test_rejects_zero_bus_timeout() {
        let err = Config::from_json(r#"{"bus": {"timeout_secs": 0}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "bus.timeout_secs", .. }));
    }
}
