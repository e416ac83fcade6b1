//! Voicemesh Gateway Library
//!
//! Control plane for the TTS serving fleet: worker registry with
//! heartbeat-driven liveness, multi-tier rate limiting, request forwarding,
//! and the WebSocket status fan-out.

pub mod announcements;
pub mod broadcast;
pub mod config;
pub mod http;
pub mod limiter;
pub mod registry;

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// Re-export commonly used types
pub use announcements::AnnouncementBoard;
pub use broadcast::{ConnectionManager, StatusBroadcaster};
pub use config::GatewayConfig;
pub use http::AppState;
pub use limiter::RateLimiter;
pub use registry::{RegistryEvent, SelectionStrategy, ServiceRegistry};

/// A fully wired gateway: shared state, the axum router, and the spawned
/// background tasks (sweeper, snapshot broadcaster, event pump).
pub struct Gateway {
    pub state: AppState,
    pub router: axum::Router,
    pub tasks: Vec<JoinHandle<()>>,
}

/// Assemble the gateway components and spawn their background tasks, all
/// bound to the given shutdown token.
pub fn build(config: GatewayConfig, shutdown: CancellationToken) -> Gateway {
    let config = Arc::new(config);
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let registry = Arc::new(ServiceRegistry::new(
        config.registry.heartbeat_interval_s,
        config.registry.dead_threshold_s,
        config.forward.command_timeout_s,
        events_tx,
    ));
    let limiter = Arc::new(RateLimiter::new(
        config.limits.global_rpm,
        config.limits.ip_rpm,
        config.limits.endpoint_rpm.clone(),
        config.limits.concurrent_limit,
    ));
    let connections = Arc::new(ConnectionManager::new());
    let announcements = Arc::new(AnnouncementBoard::new());
    let broadcaster = Arc::new(StatusBroadcaster::new(
        Arc::clone(&connections),
        Arc::clone(&registry),
        Arc::clone(&announcements),
        config.broadcast.interval_s,
    ));

    let tasks = vec![
        registry.spawn_sweeper(shutdown.clone()),
        broadcaster.spawn_snapshot_loop(shutdown.clone()),
        broadcaster.spawn_event_pump(events_rx, shutdown),
    ];

    let state = AppState {
        config,
        registry,
        limiter,
        connections,
        broadcaster,
        announcements,
        http: reqwest::Client::new(),
        started_at: Instant::now(),
    };
    let router = http::build_router(state.clone());

    Gateway {
        state,
        router,
        tasks,
    }
}
