//! Voicemesh Worker Library
//!
//! Runtime for one TTS inference worker: the lifecycle state machine, the
//! engine adapter bound at boot, the local voice store, the gateway
//! membership client, and the worker's HTTP surface.

pub mod api;
pub mod config;
pub mod engine;
pub mod gateway;
pub mod runtime;
pub mod system;
pub mod voices;

// Re-export commonly used types
pub use api::{build_router, WorkerApi};
pub use config::WorkerConfig;
pub use engine::Engine;
pub use gateway::{spawn_heartbeat_loop, GatewayClient};
pub use runtime::WorkerRuntime;
pub use voices::VoiceStore;
