use thiserror::Error;

use crate::types::EngineKind;

/// Errors surfaced by the cluster control plane. Each kind carries a stable
/// string code that ends up in client-visible JSON bodies.
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Node {0} not found")]
    NodeNotFound(String),

    #[error("No available node for engine {0}")]
    NoAvailableNode(EngineKind),

    #[error("Voice {0} not found")]
    VoiceNotFound(String),

    #[error("{0}")]
    RateLimitExceeded(String),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("Request timeout")]
    RequestTimeout,

    #[error("Engine error: {0}")]
    EngineError(String),

    #[error("Engine {0} model not loaded")]
    ModelNotLoaded(EngineKind),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport failure talking to a worker or an engine upstream
    #[error("Upstream error: {0}")]
    Upstream(String),
}

impl ClusterError {
    /// Stable machine-readable code for client error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ClusterError::NodeNotFound(_) => "NODE_NOT_FOUND",
            ClusterError::NoAvailableNode(_) => "NO_AVAILABLE_NODE",
            ClusterError::VoiceNotFound(_) => "VOICE_NOT_FOUND",
            ClusterError::RateLimitExceeded(_) => "RATE_LIMIT_EXCEEDED",
            ClusterError::InvalidRequest(_) => "INVALID_REQUEST",
            ClusterError::RequestTimeout => "REQUEST_TIMEOUT",
            ClusterError::EngineError(_) => "ENGINE_ERROR",
            ClusterError::ModelNotLoaded(_) => "MODEL_NOT_LOADED",
            ClusterError::Config(_) => "CONFIG_ERROR",
            ClusterError::Upstream(_) => "UPSTREAM_ERROR",
        }
    }
}

impl From<reqwest::Error> for ClusterError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClusterError::RequestTimeout
        } else {
            ClusterError::Upstream(err.to_string())
        }
    }
}

/// Result type alias using ClusterError
pub type Result<T> = std::result::Result<T, ClusterError>;
