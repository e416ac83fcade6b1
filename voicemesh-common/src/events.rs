use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Current time as fractional epoch seconds, the timestamp form used by the
/// WebSocket event envelope.
pub fn epoch_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Event kinds pushed over the status WebSocket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // Node events
    NodeOnline,
    NodeOffline,
    NodeStatusChanged,
    NodeMetrics,

    // System events
    SystemStatus,
    Announcement,

    // Request events
    RequestStart,
    RequestComplete,
    RequestError,

    // Connection liveness
    Ping,
    Pong,
}

/// Wire envelope for every WebSocket push: `{type, data, timestamp}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub data: serde_json::Value,
    pub timestamp: f64,
}

impl WsEvent {
    pub fn new(event_type: EventType, data: serde_json::Value) -> Self {
        Self {
            event_type,
            data,
            timestamp: epoch_seconds(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}
