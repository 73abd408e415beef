//! Broker connection configuration
//!
//! The harness hands the driver a small YAML document describing the broker
//! endpoint. Unknown fields are ignored so that one config file can be shared
//! across several driver implementations.

use crate::error::DriverError;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Connection parameters for the broker, immutable once loaded.
///
/// Every session the driver opens shares one read-only copy of this value;
/// there is no mutable connection-properties object reused across sessions.
#[derive(Debug, Clone, Deserialize)]
pub struct DriverConfig {
    /// Broker endpoint as `host:port`
    pub host: String,
    /// Namespace on the broker ("message VPN" on some products)
    #[serde(default = "default_virtual_host", alias = "vpn")]
    pub virtual_host: String,
    /// Username for the broker
    #[serde(default)]
    pub username: String,
    /// Password for the broker
    #[serde(default)]
    pub password: String,
    /// Whether benchmark topics are durable. Fixed for the process lifetime;
    /// durability is not selectable per topic.
    #[serde(default)]
    pub durable: bool,
    /// Session establishment timeout in milliseconds
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    /// Per-request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_virtual_host() -> String {
    "default".to_string()
}

fn default_connection_timeout_ms() -> u64 {
    30_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            host: "localhost:55555".to_string(),
            virtual_host: default_virtual_host(),
            username: String::new(),
            password: String::new(),
            durable: false,
            connection_timeout_ms: default_connection_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl DriverConfig {
    /// Parse a configuration document from a YAML string
    pub fn from_yaml_str(yaml: &str) -> Result<Self, DriverError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| DriverError::config(format!("invalid driver configuration: {}", e)))
    }

    /// Load a configuration document from a YAML file
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, DriverError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            DriverError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&contents)
    }

    /// Session establishment timeout
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Per-request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Builder for DriverConfig
#[derive(Debug, Default)]
pub struct DriverConfigBuilder {
    config: DriverConfig,
}

impl DriverConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host<S: Into<String>>(mut self, host: S) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn virtual_host<S: Into<String>>(mut self, virtual_host: S) -> Self {
        self.config.virtual_host = virtual_host.into();
        self
    }

    pub fn credentials<U: Into<String>, P: Into<String>>(mut self, username: U, password: P) -> Self {
        self.config.username = username.into();
        self.config.password = password.into();
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.config.durable = durable;
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn build(self) -> DriverConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_yaml() {
        let config = DriverConfig::from_yaml_str("host: broker-1:55555\n").unwrap();
        assert_eq!(config.host, "broker-1:55555");
        assert_eq!(config.virtual_host, "default");
        assert!(!config.durable);
        assert_eq!(config.connection_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_parse_full_yaml_with_unknown_fields() {
        let yaml = r#"
host: broker-1:55555
vpn: bench-vpn
username: user
password: secret
durable: true
someFutureKnob: 42
anotherIgnoredField: "yes"
"#;
        let config = DriverConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.virtual_host, "bench-vpn");
        assert_eq!(config.username, "user");
        assert!(config.durable);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(DriverConfig::from_yaml_str("host: [not, a, string").is_err());
    }

    #[test]
    fn test_builder() {
        let config = DriverConfigBuilder::new()
            .host("broker-2:55555")
            .virtual_host("bench")
            .credentials("u", "p")
            .durable(true)
            .request_timeout(Duration::from_secs(5))
            .build();

        assert_eq!(config.host, "broker-2:55555");
        assert_eq!(config.virtual_host, "bench");
        assert!(config.durable);
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
    }
}
