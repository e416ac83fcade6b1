use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use voicemesh_common::{ClusterError, EngineKind};

/// Main configuration for a worker process, read once at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Run mode: `worker` (default) or `standalone` (embedded gateway)
    pub mode: Option<String>,
    /// Identity and listener
    pub node: NodeConfig,
    /// Gateway membership
    pub gateway: GatewayConfig,
    /// Engine adapter settings
    pub engine: EngineConfig,
    /// Graceful stop budget
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub engine: EngineKind,
    pub host: String,
    pub port: u16,
    /// Opaque 8-hex id; generated when absent
    pub node_id: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            engine: EngineKind::Xtts,
            host: "0.0.0.0".to_string(),
            port: 8001,
            node_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Gateway base URL; registration and heartbeats are skipped when unset
    pub url: Option<String>,
    pub heartbeat_interval_s: u64,
    pub request_timeout_s: u64,
    /// Port the embedded gateway listens on in standalone mode
    pub standalone_port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: None,
            heartbeat_interval_s: 10,
            request_timeout_s: 10,
            standalone_port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Model directory for local engines; adapters fall back to bundled
    /// defaults when unset
    pub model_path: Option<PathBuf>,
    pub device: String,
    pub voices_dir: PathBuf,
    /// Upstream inference service for the GPT-SoVITS bridge
    pub sovits_api_url: String,
    /// Load the model immediately on boot instead of waiting for an
    /// activate command
    pub auto_load: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_path: None,
            device: "cuda".to_string(),
            voices_dir: PathBuf::from("./voices"),
            sovits_api_url: "http://127.0.0.1:9880".to_string(),
            auto_load: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub timeout_s: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { timeout_s: 30 }
    }
}

impl WorkerConfig {
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
        if let Ok(engine) = std::env::var("VOICE_ENGINE") {
            if let Ok(engine) = engine.parse() {
                self.node.engine = engine;
            }
        }
        if let Ok(host) = std::env::var("VOICE_HOST") {
            self.node.host = host;
        }
        if let Ok(port) = std::env::var("VOICE_PORT") {
            if let Ok(port) = port.parse() {
                self.node.port = port;
            }
        }
        if let Ok(dir) = std::env::var("VOICES_DIR") {
            self.engine.voices_dir = PathBuf::from(dir);
        }
        if let Ok(path) = std::env::var("MODEL_PATH") {
            self.engine.model_path = Some(PathBuf::from(path));
        }
        if let Ok(device) = std::env::var("DEVICE") {
            self.engine.device = device;
        }
        if let Ok(url) = std::env::var("GATEWAY_URL") {
            self.gateway.url = Some(url);
        }
        if let Ok(mode) = std::env::var("VOICEMESH_MODE") {
            self.mode = Some(mode);
        }
    }

    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.node.port == 0 {
            return Err(ClusterError::Config("node.port must be non-zero".into()));
        }
        if self.gateway.heartbeat_interval_s == 0 {
            return Err(ClusterError::Config(
                "gateway.heartbeat_interval_s must be greater than zero".into(),
            ));
        }
        if self.shutdown.timeout_s == 0 {
            return Err(ClusterError::Config(
                "shutdown.timeout_s must be greater than zero".into(),
            ));
        }
        if let Some(id) = &self.node.node_id {
            if id.is_empty() {
                return Err(ClusterError::Config("node.node_id must not be empty".into()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = WorkerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.node.engine, EngineKind::Xtts);
        assert_eq!(config.gateway.heartbeat_interval_s, 10);
        assert!(!config.engine.auto_load);
    }

    #[test]
    fn environment_overrides_apply() {
        std::env::set_var("VOICE_ENGINE", "gpt-sovits");
        std::env::set_var("VOICE_PORT", "8003");
        std::env::set_var("GATEWAY_URL", "http://gw:8080");

        let mut config = WorkerConfig::default();
        config.apply_environment_overrides();
        assert_eq!(config.node.engine, EngineKind::GptSovits);
        assert_eq!(config.node.port, 8003);
        assert_eq!(config.gateway.url.as_deref(), Some("http://gw:8080"));

        std::env::remove_var("VOICE_ENGINE");
        std::env::remove_var("VOICE_PORT");
        std::env::remove_var("GATEWAY_URL");
    }

    #[test]
    fn zero_port_rejected() {
        let mut config = WorkerConfig::default();
        config.node.port = 0;
        assert!(config.validate().is_err());
    }
}
