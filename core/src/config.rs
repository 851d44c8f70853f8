//! Configuration types for the VeloxMQ transport layer

use std::collections::HashMap;
use std::time::Duration;

/// Connector parameter keys understood by [`ConnectorConfig`]
pub mod params {
    pub const HOST: &str = "host";
    pub const PORT: &str = "port";
    pub const SSL_ENABLED: &str = "ssl-enabled";
    pub const BATCH_DELAY: &str = "batch-delay";
    pub const DIRECT_DELIVER: &str = "direct-deliver";
}

/// Transport-wide configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TransportConfig {
    /// Whether small writes may be coalesced into batches
    pub batching_enabled: bool,
    /// Batch buffer capacity in bytes
    pub batch_size: usize,
    /// Whether inbound data should be delivered on the transport thread
    pub direct_deliver: bool,
    /// Connection establishment timeout
    pub connect_timeout: Duration,
    /// Bound on synchronous flush waits
    pub flush_timeout: Duration,
    /// Bound on each shutdown step (TLS teardown, channel close)
    pub shutdown_timeout: Duration,
    /// Queued-byte threshold above which the connection reports not-ready
    pub write_high_watermark: usize,
    /// Queued-byte threshold below which the connection reports ready again
    pub write_low_watermark: usize,
    /// Period of the external batch maintenance timer
    pub batch_delay: Duration,
    /// Size of the read buffer used by the channel worker
    pub read_buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            batching_enabled: true,
            batch_size: 8192,
            direct_deliver: true,
            connect_timeout: Duration::from_secs(30),
            flush_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(10),
            write_high_watermark: 64 * 1024,
            write_low_watermark: 32 * 1024,
            batch_delay: Duration::from_millis(50),
            read_buffer_size: 8192,
        }
    }
}

/// Descriptor of an outbound connection target
///
/// Carries an opaque string parameter map so callers can rebuild an
/// equivalent connection (reconnect, failover) from a live one via
/// `Connection::connector_config`. Unknown keys are preserved untouched.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ConnectorConfig {
    parameters: HashMap<String, String>,
}

impl ConnectorConfig {
    /// Create a descriptor for `host:port`
    pub fn new<H: Into<String>>(host: H, port: u16) -> Self {
        let mut parameters = HashMap::new();
        parameters.insert(params::HOST.to_string(), host.into());
        parameters.insert(params::PORT.to_string(), port.to_string());
        Self { parameters }
    }

    /// Build a descriptor from a raw parameter map
    pub fn from_parameters(parameters: HashMap<String, String>) -> Self {
        Self { parameters }
    }

    /// Set a parameter, returning the updated descriptor
    pub fn with_parameter<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Enable or disable TLS for this target
    pub fn with_ssl_enabled(self, enabled: bool) -> Self {
        self.with_parameter(params::SSL_ENABLED, enabled.to_string())
    }

    /// The raw parameter map
    pub fn parameters(&self) -> &HashMap<String, String> {
        &self.parameters
    }

    /// Consume the descriptor, yielding the raw parameter map
    pub fn into_parameters(self) -> HashMap<String, String> {
        self.parameters
    }

    pub fn host(&self) -> &str {
        self.parameters
            .get(params::HOST)
            .map(String::as_str)
            .unwrap_or("localhost")
    }

    pub fn port(&self) -> u16 {
        self.parameters
            .get(params::PORT)
            .and_then(|value| value.parse().ok())
            .unwrap_or(9092)
    }

    /// Target as a `host:port` address string
    pub fn address(&self) -> String {
        format!("{}:{}", self.host(), self.port())
    }

    pub fn ssl_enabled(&self) -> bool {
        self.flag(params::SSL_ENABLED, false)
    }

    pub fn direct_deliver(&self) -> bool {
        self.flag(params::DIRECT_DELIVER, true)
    }

    /// Batch maintenance period override, if present
    pub fn batch_delay(&self) -> Option<Duration> {
        self.parameters
            .get(params::BATCH_DELAY)
            .and_then(|value| value.parse().ok())
            .map(Duration::from_millis)
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        self.parameters
            .get(key)
            .and_then(|value| value.parse().ok())
            .unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_defaults() {
        let config = TransportConfig::default();
        assert!(config.batching_enabled);
        assert_eq!(config.batch_size, 8192);
        assert_eq!(config.flush_timeout, Duration::from_secs(10));
        assert!(config.write_low_watermark < config.write_high_watermark);
    }

    #[test]
    fn test_connector_config_address() {
        let config = ConnectorConfig::new("broker.example.com", 9292);
        assert_eq!(config.host(), "broker.example.com");
        assert_eq!(config.port(), 9292);
        assert_eq!(config.address(), "broker.example.com:9292");
        assert!(!config.ssl_enabled());
    }

    #[test]
    fn test_connector_config_parameter_round_trip() {
        let config = ConnectorConfig::new("localhost", 4000)
            .with_ssl_enabled(true)
            .with_parameter(params::BATCH_DELAY, "20")
            .with_parameter("custom-key", "kept");

        let rebuilt = ConnectorConfig::from_parameters(config.parameters().clone());
        assert_eq!(rebuilt, config);
        assert!(rebuilt.ssl_enabled());
        assert_eq!(rebuilt.batch_delay(), Some(Duration::from_millis(20)));
        assert_eq!(
            rebuilt.parameters().get("custom-key").map(String::as_str),
            Some("kept")
        );
    }

    #[test]
    fn test_connector_config_defaults_for_missing_keys() {
        let config = ConnectorConfig::from_parameters(HashMap::new());
        assert_eq!(config.host(), "localhost");
        assert_eq!(config.port(), 9092);
        assert!(config.direct_deliver());
        assert_eq!(config.batch_delay(), None);
    }
}
