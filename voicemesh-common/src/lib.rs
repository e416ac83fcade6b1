//! Voicemesh Common
//!
//! Shared wire types for the voicemesh TTS serving cluster: node records and
//! lifecycle states, heartbeat metrics, synthesis request/response payloads,
//! announcements, the WebSocket event envelope, and the typed error family
//! used by both the gateway and the workers.

pub mod api;
pub mod error;
pub mod events;
pub mod types;

// Re-export commonly used types
pub use api::{
    AckResponse, Announcement, AnnouncementSeverity, BatchItemResult, BatchSynthesizeRequest,
    BatchSynthesizeResponse, EngineStats, ExtractVoiceResponse, FailureBody, HealthReport,
    HealthState, NodeListResponse, RegisterResponse, RegistryStats, SynthesizeRequest,
    SystemStatus, VoiceInfo,
};
pub use error::{ClusterError, Result};
pub use events::{epoch_seconds, EventType, WsEvent};
pub use types::{short_id, CommandKind, EngineKind, MetricsReport, NodeCommand, NodeRecord, WorkerState};
