use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ClusterError;

/// Generate an opaque 8-hex short identifier (node ids, voice ids,
/// announcement ids all share this form).
pub fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// TTS engine family a worker is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EngineKind {
    #[serde(rename = "xtts")]
    Xtts,
    #[serde(rename = "openvoice")]
    OpenVoice,
    #[serde(rename = "gpt-sovits")]
    GptSovits,
}

impl EngineKind {
    pub const ALL: [EngineKind; 3] = [EngineKind::Xtts, EngineKind::OpenVoice, EngineKind::GptSovits];

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Xtts => "xtts",
            EngineKind::OpenVoice => "openvoice",
            EngineKind::GptSovits => "gpt-sovits",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineKind {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "xtts" => Ok(EngineKind::Xtts),
            "openvoice" => Ok(EngineKind::OpenVoice),
            "gpt-sovits" | "gpt_sovits" | "sovits" => Ok(EngineKind::GptSovits),
            other => Err(ClusterError::InvalidRequest(format!(
                "unknown engine: {other}"
            ))),
        }
    }
}

/// Worker lifecycle state. The worker is the source of truth for its own
/// state; the gateway registry records transitions as reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    #[default]
    Standby,
    Loading,
    Ready,
    Busy,
    Error,
    Offline,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Standby => "standby",
            WorkerState::Loading => "loading",
            WorkerState::Ready => "ready",
            WorkerState::Busy => "busy",
            WorkerState::Error => "error",
            WorkerState::Offline => "offline",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerState {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "standby" => Ok(WorkerState::Standby),
            "loading" => Ok(WorkerState::Loading),
            "ready" => Ok(WorkerState::Ready),
            "busy" => Ok(WorkerState::Busy),
            "error" => Ok(WorkerState::Error),
            "offline" => Ok(WorkerState::Offline),
            other => Err(ClusterError::InvalidRequest(format!(
                "unknown worker state: {other}"
            ))),
        }
    }
}

fn now() -> DateTime<Utc> {
    Utc::now()
}

/// A worker's entry in the gateway registry. Also the registration payload
/// a worker posts on boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Opaque 8-hex identifier, client-supplied or generated
    #[serde(default = "short_id")]
    pub node_id: String,
    /// Engine family served by this worker
    pub engine: EngineKind,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub state: WorkerState,
    #[serde(default)]
    pub model_loaded: bool,
    #[serde(default = "now")]
    pub registered_at: DateTime<Utc>,
    #[serde(default = "now")]
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub cpu_percent: f32,
    #[serde(default)]
    pub memory_percent: f32,
    #[serde(default)]
    pub gpu_percent: f32,
    #[serde(default)]
    pub gpu_memory_percent: f32,
    #[serde(default)]
    pub request_count: u64,
    #[serde(default)]
    pub error_count: u64,
    #[serde(default)]
    pub avg_response_ms: f64,
    #[serde(default)]
    pub current_concurrent: u32,
}

impl NodeRecord {
    /// `host:port` form used when forwarding requests to the worker.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// A worker is selectable iff it is ready and holds a loaded model.
    pub fn is_available(&self) -> bool {
        self.state == WorkerState::Ready && self.model_loaded
    }
}

/// Heartbeat payload: live gauges, counters, and the reported lifecycle
/// state. Transient; the registry copies fields onto the node record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsReport {
    pub state: WorkerState,
    #[serde(default)]
    pub model_loaded: bool,
    #[serde(default)]
    pub cpu_percent: f32,
    #[serde(default)]
    pub memory_percent: f32,
    #[serde(default)]
    pub gpu_percent: f32,
    #[serde(default)]
    pub gpu_memory_percent: f32,
    #[serde(default)]
    pub current_concurrent: u32,
    #[serde(default)]
    pub request_count: u64,
    #[serde(default)]
    pub error_count: u64,
    #[serde(default)]
    pub avg_response_ms: f64,
}

/// Lifecycle command sent to a worker's `/command` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeCommand {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

/// Parsed form of [`NodeCommand::command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Activate,
    Standby,
    Stop,
}

impl CommandKind {
    /// Case-insensitive; accepts the legacy `load_model`/`unload_model`
    /// aliases.
    pub fn parse(command: &str) -> Option<CommandKind> {
        match command.to_ascii_lowercase().as_str() {
            "activate" | "load_model" => Some(CommandKind::Activate),
            "standby" | "unload_model" => Some(CommandKind::Standby),
            "stop" => Some(CommandKind::Stop),
            _ => None,
        }
    }
}
