use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ClusterError;
use crate::types::{short_id, EngineKind, NodeRecord};

pub const MAX_TEXT_LEN: usize = 5000;
pub const SPEED_RANGE: (f32, f32) = (0.5, 2.0);
pub const PITCH_RANGE: (f32, f32) = (0.5, 2.0);

fn default_language() -> String {
    "zh".to_string()
}

fn default_rate() -> f32 {
    1.0
}

/// Synthesis request accepted by the gateway and forwarded verbatim to the
/// selected worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesizeRequest {
    pub text: String,
    pub voice_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<EngineKind>,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_rate")]
    pub speed: f32,
    #[serde(default = "default_rate")]
    pub pitch: f32,
}

impl SynthesizeRequest {
    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.text.is_empty() || self.text.chars().count() > MAX_TEXT_LEN {
            return Err(ClusterError::InvalidRequest(format!(
                "text length must be between 1 and {MAX_TEXT_LEN} characters"
            )));
        }
        if self.voice_id.is_empty() {
            return Err(ClusterError::InvalidRequest(
                "voice_id must not be empty".to_string(),
            ));
        }
        if !(SPEED_RANGE.0..=SPEED_RANGE.1).contains(&self.speed) {
            return Err(ClusterError::InvalidRequest(format!(
                "speed must be between {} and {}",
                SPEED_RANGE.0, SPEED_RANGE.1
            )));
        }
        if !(PITCH_RANGE.0..=PITCH_RANGE.1).contains(&self.pitch) {
            return Err(ClusterError::InvalidRequest(format!(
                "pitch must be between {} and {}",
                PITCH_RANGE.0, PITCH_RANGE.1
            )));
        }
        Ok(())
    }
}

/// Structured failure body returned in place of audio when a request cannot
/// be served: `{success: false, message, code}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureBody {
    pub success: bool,
    pub message: String,
    pub code: String,
}

impl FailureBody {
    pub fn from_error(err: &ClusterError) -> Self {
        Self {
            success: false,
            message: err.to_string(),
            code: err.code().to_string(),
        }
    }

    pub fn new(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            code: code.into(),
        }
    }
}

/// Worker response for a voice extraction, passed through by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractVoiceResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<EngineKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSynthesizeRequest {
    pub texts: Vec<String>,
    pub voice_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<EngineKind>,
    #[serde(default = "default_language")]
    pub language: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItemResult {
    pub index: usize,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSynthesizeResponse {
    pub success: bool,
    pub message: String,
    pub results: Vec<BatchItemResult>,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Voice side-file metadata persisted next to the embedding blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceInfo {
    pub voice_id: String,
    pub name: String,
    pub engine: EngineKind,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnouncementSeverity {
    Info,
    Warning,
    Error,
    Maintenance,
}

/// Operator-facing notice shown on dashboards. Process-lifetime only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Announcement {
    #[serde(default = "short_id")]
    pub id: String,
    pub severity: AnnouncementSeverity,
    pub title: String,
    pub message: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Announcement {
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => Utc::now() > expires_at,
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health endpoint body shared by gateway and workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthState,
    pub version: String,
    pub uptime_seconds: f64,
    pub components: serde_json::Value,
}

/// Per-engine membership counts.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EngineStats {
    pub total: usize,
    pub online: usize,
    pub ready: usize,
}

/// Registry-wide membership counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total: usize,
    pub online: usize,
    pub ready: usize,
    pub engines: BTreeMap<EngineKind, EngineStats>,
}

/// Full system snapshot pushed over the WebSocket and served at
/// `/api/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatus {
    pub online_nodes: usize,
    pub total_nodes: usize,
    pub total_requests: u64,
    pub current_concurrent: u64,
    pub avg_response_time_ms: f64,
    pub engines: BTreeMap<EngineKind, EngineStats>,
    pub announcements: Vec<Announcement>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub success: bool,
    pub node_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeListResponse {
    pub nodes: Vec<NodeRecord>,
}
