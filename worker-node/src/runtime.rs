use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use voicemesh_common::{MetricsReport, NodeRecord, WorkerState};

use crate::engine::Engine;
use crate::system;

/// Lifecycle state machine and bookkeeping for one worker process. The
/// worker is the source of truth for its own state; the gateway learns of
/// transitions through heartbeats.
pub struct WorkerRuntime {
    node_id: String,
    host: String,
    port: u16,
    engine: Engine,
    state: RwLock<WorkerState>,
    model_loaded: AtomicBool,
    started_at: Instant,
    registered_at: chrono::DateTime<chrono::Utc>,
    request_count: AtomicU64,
    error_count: AtomicU64,
    total_response_ms: AtomicU64,
    current_concurrent: AtomicU32,
}

/// Tracks one in-flight request; the concurrency gauge drops on every exit
/// path when the guard is released.
pub struct InflightGuard {
    runtime: Arc<WorkerRuntime>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        let _ = self
            .runtime
            .current_concurrent
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(1))
            });
    }
}

impl WorkerRuntime {
    pub fn new(node_id: String, host: String, port: u16, engine: Engine) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            host,
            port,
            engine,
            state: RwLock::new(WorkerState::Standby),
            model_loaded: AtomicBool::new(false),
            started_at: Instant::now(),
            registered_at: chrono::Utc::now(),
            request_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            total_response_ms: AtomicU64::new(0),
            current_concurrent: AtomicU32::new(0),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn model_loaded(&self) -> bool {
        self.model_loaded.load(Ordering::Acquire)
    }

    pub async fn state(&self) -> WorkerState {
        *self.state.read().await
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    async fn transition(&self, new: WorkerState) {
        let mut state = self.state.write().await;
        if *state != new {
            info!(node_id = %self.node_id, old = %*state, new = %new, "Worker state changed");
            *state = new;
        }
    }

    /// Load the model: standby -> loading -> ready, or error on failure.
    /// Activating an already-loaded worker only reasserts ready.
    pub async fn activate(&self) -> bool {
        if self.model_loaded() {
            self.transition(WorkerState::Ready).await;
            return true;
        }

        self.transition(WorkerState::Loading).await;
        match self.engine.load().await {
            Ok(()) => {
                self.model_loaded.store(true, Ordering::Release);
                self.transition(WorkerState::Ready).await;
                info!(node_id = %self.node_id, "Worker activated");
                true
            }
            Err(e) => {
                error!(node_id = %self.node_id, error = %e, "Failed to activate worker");
                self.transition(WorkerState::Error).await;
                false
            }
        }
    }

    /// Unload the model and return to standby.
    pub async fn standby(&self) -> bool {
        if !self.model_loaded() {
            return true;
        }
        match self.engine.unload().await {
            Ok(()) => {
                self.model_loaded.store(false, Ordering::Release);
                self.transition(WorkerState::Standby).await;
                info!(node_id = %self.node_id, "Worker on standby");
                true
            }
            Err(e) => {
                error!(node_id = %self.node_id, error = %e, "Failed to unload model");
                false
            }
        }
    }

    pub fn track_request(self: &Arc<Self>) -> InflightGuard {
        self.current_concurrent.fetch_add(1, Ordering::AcqRel);
        InflightGuard {
            runtime: Arc::clone(self),
        }
    }

    pub fn record_success(&self, elapsed_ms: u64) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.total_response_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn avg_response_ms(&self) -> f64 {
        let count = self.request_count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        self.total_response_ms.load(Ordering::Relaxed) as f64 / count as f64
    }

    /// Registration payload / `/info` snapshot.
    pub async fn record(&self) -> NodeRecord {
        let gauges = system::gather();
        NodeRecord {
            node_id: self.node_id.clone(),
            engine: self.engine.kind(),
            host: self.host.clone(),
            port: self.port,
            state: self.state().await,
            model_loaded: self.model_loaded(),
            registered_at: self.registered_at,
            last_heartbeat: chrono::Utc::now(),
            cpu_percent: gauges.cpu_percent,
            memory_percent: gauges.memory_percent,
            gpu_percent: gauges.gpu_percent,
            gpu_memory_percent: gauges.gpu_memory_percent,
            request_count: self.request_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            avg_response_ms: self.avg_response_ms(),
            current_concurrent: self.current_concurrent.load(Ordering::Relaxed),
        }
    }

    /// Heartbeat payload. Never touches the engine, so the metrics surface
    /// stays responsive during inference.
    pub async fn metrics_report(&self) -> MetricsReport {
        let gauges = system::gather();
        MetricsReport {
            state: self.state().await,
            model_loaded: self.model_loaded(),
            cpu_percent: gauges.cpu_percent,
            memory_percent: gauges.memory_percent,
            gpu_percent: gauges.gpu_percent,
            gpu_memory_percent: gauges.gpu_memory_percent,
            current_concurrent: self.current_concurrent.load(Ordering::Relaxed),
            request_count: self.request_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            avg_response_ms: self.avg_response_ms(),
        }
    }

    /// Graceful stop: wait for in-flight requests to drain (bounded by half
    /// the stop budget), unload the engine, and go offline.
    pub async fn shutdown(&self, timeout: Duration) {
        let drain_deadline = Instant::now() + timeout / 2;
        while self.current_concurrent.load(Ordering::Acquire) > 0
            && Instant::now() < drain_deadline
        {
            info!(
                node_id = %self.node_id,
                in_flight = self.current_concurrent.load(Ordering::Acquire),
                "Waiting for in-flight requests to drain"
            );
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        let remaining = self.current_concurrent.load(Ordering::Acquire);
        if remaining > 0 {
            warn!(node_id = %self.node_id, in_flight = remaining, "Stopping with requests still in progress");
        }

        if self.model_loaded() {
            if let Err(e) = self.engine.unload().await {
                warn!(node_id = %self.node_id, error = %e, "Engine unload failed during shutdown");
            }
            self.model_loaded.store(false, Ordering::Release);
        }
        self.transition(WorkerState::Offline).await;
        info!(node_id = %self.node_id, "Worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::voices::VoiceStore;
    use voicemesh_common::EngineKind;

    fn runtime_with(engine_config: EngineConfig) -> (Arc<WorkerRuntime>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = VoiceStore::new(dir.path());
        let engine = Engine::from_config(EngineKind::Xtts, &engine_config, store);
        (
            WorkerRuntime::new("abcd1234".into(), "127.0.0.1".into(), 8001, engine),
            dir,
        )
    }

    #[tokio::test]
    async fn activate_reaches_ready() {
        let (runtime, _dir) = runtime_with(EngineConfig::default());
        assert_eq!(runtime.state().await, WorkerState::Standby);
        assert!(!runtime.model_loaded());

        assert!(runtime.activate().await);
        assert_eq!(runtime.state().await, WorkerState::Ready);
        assert!(runtime.model_loaded());

        // Idempotent.
        assert!(runtime.activate().await);
        assert_eq!(runtime.state().await, WorkerState::Ready);
    }

    #[tokio::test]
    async fn failed_activation_lands_in_error() {
        let config = EngineConfig {
            model_path: Some(std::path::PathBuf::from("/definitely/not/a/model")),
            ..EngineConfig::default()
        };
        let (runtime, _dir) = runtime_with(config);
        assert!(!runtime.activate().await);
        assert_eq!(runtime.state().await, WorkerState::Error);
        assert!(!runtime.model_loaded());
    }

    #[tokio::test]
    async fn standby_unloads() {
        let (runtime, _dir) = runtime_with(EngineConfig::default());
        runtime.activate().await;
        assert!(runtime.standby().await);
        assert_eq!(runtime.state().await, WorkerState::Standby);
        assert!(!runtime.model_loaded());

        // Standby without a loaded model is a no-op.
        assert!(runtime.standby().await);
    }

    #[tokio::test]
    async fn inflight_guard_balances_counter() {
        let (runtime, _dir) = runtime_with(EngineConfig::default());
        {
            let _a = runtime.track_request();
            let _b = runtime.track_request();
            assert_eq!(runtime.metrics_report().await.current_concurrent, 2);
        }
        assert_eq!(runtime.metrics_report().await.current_concurrent, 0);
    }

    #[tokio::test]
    async fn response_accounting() {
        let (runtime, _dir) = runtime_with(EngineConfig::default());
        assert_eq!(runtime.avg_response_ms(), 0.0);
        runtime.record_success(100);
        runtime.record_success(300);
        runtime.record_error();
        assert_eq!(runtime.avg_response_ms(), 200.0);

        let report = runtime.metrics_report().await;
        assert_eq!(report.request_count, 2);
        assert_eq!(report.error_count, 1);
    }

    #[tokio::test]
    async fn shutdown_goes_offline() {
        let (runtime, _dir) = runtime_with(EngineConfig::default());
        runtime.activate().await;
        runtime.shutdown(Duration::from_secs(1)).await;
        assert_eq!(runtime.state().await, WorkerState::Offline);
        assert!(!runtime.model_loaded());
    }
}
