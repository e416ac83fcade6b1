use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use voicemesh_common::{ClusterError, EngineKind};

/// Main configuration for the gateway node, read once at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener configuration
    pub network: NetworkConfig,
    /// Rate limiting tunables
    pub limits: LimitsConfig,
    /// Registry liveness tunables
    pub registry: RegistryConfig,
    /// WebSocket status broadcast
    pub broadcast: BroadcastConfig,
    /// Request forwarding to workers
    pub forward: ForwardConfig,
    /// Prometheus exporter
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub host: String,
    pub port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Requests per minute across all clients
    pub global_rpm: u32,
    /// Requests per minute per client IP
    pub ip_rpm: u32,
    /// Optional per-endpoint limits, keyed by request path
    pub endpoint_rpm: HashMap<String, u32>,
    /// Maximum in-flight API requests
    pub concurrent_limit: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            global_rpm: 1000,
            ip_rpm: 100,
            endpoint_rpm: HashMap::new(),
            concurrent_limit: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Liveness sweep cadence in seconds
    pub heartbeat_interval_s: u64,
    /// Seconds without a heartbeat before a node is marked offline
    pub dead_threshold_s: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_s: 10,
            dead_threshold_s: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// System status push cadence in seconds
    pub interval_s: f64,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self { interval_s: 2.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardConfig {
    /// Engine used when a request does not name one
    pub default_engine: EngineKind,
    /// Per-call deadline for synthesize forwards, seconds
    pub request_timeout_s: u64,
    /// Per-call deadline for voice extraction forwards, seconds
    pub extract_timeout_s: u64,
    /// Overall deadline for a batch synthesize request, seconds
    pub batch_timeout_s: u64,
    /// Per-call deadline for worker commands, seconds
    pub command_timeout_s: u64,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            default_engine: EngineKind::Xtts,
            request_timeout_s: 60,
            extract_timeout_s: 120,
            batch_timeout_s: 300,
            command_timeout_s: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "127.0.0.1:9091".parse().expect("static addr"),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file (extension omitted), layered with
    /// `VOICEMESH__`-prefixed environment variables.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("VOICEMESH").separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Apply the conventional environment overrides.
    pub fn apply_environment_overrides(&mut self) {
        if let Ok(host) = std::env::var("VOICE_HOST") {
            self.network.host = host;
        }
        if let Ok(port) = std::env::var("VOICE_PORT") {
            if let Ok(port) = port.parse() {
                self.network.port = port;
            }
        }
    }

    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.network.port == 0 {
            return Err(ClusterError::Config("network.port must be non-zero".into()));
        }
        if self.limits.global_rpm == 0 || self.limits.ip_rpm == 0 {
            return Err(ClusterError::Config(
                "rate limits must be greater than zero".into(),
            ));
        }
        if self.limits.concurrent_limit == 0 {
            return Err(ClusterError::Config(
                "limits.concurrent_limit must be greater than zero".into(),
            ));
        }
        if self.registry.heartbeat_interval_s == 0 {
            return Err(ClusterError::Config(
                "registry.heartbeat_interval_s must be greater than zero".into(),
            ));
        }
        if self.registry.dead_threshold_s < self.registry.heartbeat_interval_s {
            return Err(ClusterError::Config(
                "registry.dead_threshold_s must be at least the heartbeat interval".into(),
            ));
        }
        if self.broadcast.interval_s <= 0.0 {
            return Err(ClusterError::Config(
                "broadcast.interval_s must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.limits.global_rpm, 1000);
        assert_eq!(config.limits.ip_rpm, 100);
        assert_eq!(config.forward.default_engine, EngineKind::Xtts);
    }

    #[test]
    fn validation_rejects_zero_port() {
        let mut config = GatewayConfig::default();
        config.network.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_short_dead_threshold() {
        let mut config = GatewayConfig::default();
        config.registry.dead_threshold_s = 5;
        config.registry.heartbeat_interval_s = 10;
        assert!(config.validate().is_err());
    }
}
