use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use voicemesh_common::{
    Announcement, ClusterError, EngineKind, EngineStats, MetricsReport, NodeCommand, NodeRecord,
    RegistryStats, SystemStatus, WorkerState,
};

/// Membership change emitted by the registry and fanned out to WebSocket
/// clients by the broadcaster.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    NodeOnline(NodeRecord),
    NodeOffline { node_id: String },
    StatusChanged {
        node_id: String,
        old: WorkerState,
        new: WorkerState,
    },
}

/// Load-balancing discipline for [`ServiceRegistry::select`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    RoundRobin,
    LeastLoad,
    Random,
}

#[derive(Default)]
struct RegistryInner {
    nodes: HashMap<String, NodeRecord>,
    /// Insertion-ordered node ids per engine; a node id lives in exactly
    /// one bucket.
    engine_index: HashMap<EngineKind, Vec<String>>,
    /// Per-engine round-robin cursors, advanced after each selection.
    rr_counters: HashMap<EngineKind, usize>,
}

/// In-memory service registry: worker membership, heartbeat bookkeeping,
/// engine-indexed lookup, and load-balanced selection. Authoritative for
/// the lifetime of the gateway process only.
pub struct ServiceRegistry {
    inner: RwLock<RegistryInner>,
    dead_threshold: chrono::Duration,
    sweep_interval: Duration,
    events: mpsc::UnboundedSender<RegistryEvent>,
    http: reqwest::Client,
    command_timeout: Duration,
}

impl ServiceRegistry {
    pub fn new(
        heartbeat_interval_s: u64,
        dead_threshold_s: u64,
        command_timeout_s: u64,
        events: mpsc::UnboundedSender<RegistryEvent>,
    ) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            dead_threshold: chrono::Duration::seconds(dead_threshold_s as i64),
            sweep_interval: Duration::from_secs(heartbeat_interval_s),
            events,
            http: reqwest::Client::new(),
            command_timeout: Duration::from_secs(command_timeout_s),
        }
    }

    fn emit(&self, event: RegistryEvent) {
        // Receiver lives in the broadcaster; a closed channel only means
        // shutdown is underway.
        let _ = self.events.send(event);
    }

    /// Upsert a node by id. Emits `node_online` exactly when the id is new
    /// or a previously-offline record comes back non-offline; re-register
    /// of a live node is idempotent and silent.
    pub async fn register(&self, mut record: NodeRecord) -> String {
        let node_id = record.node_id.clone();
        let now = Utc::now();
        let mut event = None;

        {
            let mut inner = self.inner.write().await;
            record.last_heartbeat = now;

            match inner.nodes.get(&node_id) {
                Some(existing) => {
                    record.registered_at = existing.registered_at;
                    let came_back =
                        existing.state == WorkerState::Offline && record.state != WorkerState::Offline;
                    let old_engine = existing.engine;
                    if old_engine != record.engine {
                        if let Some(bucket) = inner.engine_index.get_mut(&old_engine) {
                            bucket.retain(|id| id != &node_id);
                        }
                    }
                    if came_back {
                        event = Some(RegistryEvent::NodeOnline(record.clone()));
                    }
                    debug!(node_id = %node_id, "Node re-registered");
                }
                None => {
                    record.registered_at = now;
                    event = Some(RegistryEvent::NodeOnline(record.clone()));
                    counter!("gateway_nodes_registered_total", 1);
                    info!(
                        node_id = %node_id,
                        engine = %record.engine,
                        address = %record.address(),
                        "Node registered"
                    );
                }
            }

            let bucket = inner.engine_index.entry(record.engine).or_default();
            if !bucket.iter().any(|id| id == &node_id) {
                bucket.push(node_id.clone());
            }
            inner.nodes.insert(node_id.clone(), record);
            gauge!("gateway_total_nodes", inner.nodes.len() as f64);
        }

        if let Some(event) = event {
            self.emit(event);
        }
        node_id
    }

    /// Remove a node and its engine-index entry. Emits `node_offline` iff a
    /// record was removed; re-unregister is a no-op.
    pub async fn unregister(&self, node_id: &str) -> bool {
        let removed = {
            let mut inner = self.inner.write().await;
            match inner.nodes.remove(node_id) {
                Some(record) => {
                    if let Some(bucket) = inner.engine_index.get_mut(&record.engine) {
                        bucket.retain(|id| id != node_id);
                    }
                    gauge!("gateway_total_nodes", inner.nodes.len() as f64);
                    info!(node_id = %node_id, "Node unregistered");
                    true
                }
                None => false,
            }
        };

        if removed {
            self.emit(RegistryEvent::NodeOffline {
                node_id: node_id.to_string(),
            });
        }
        removed
    }

    /// Refresh a node's heartbeat and fold in its reported metrics. Returns
    /// false for unknown ids (the beat is dropped, not an error).
    pub async fn heartbeat(&self, node_id: &str, report: Option<MetricsReport>) -> bool {
        let mut event = None;

        let known = {
            let mut inner = self.inner.write().await;
            match inner.nodes.get_mut(node_id) {
                Some(node) => {
                    node.last_heartbeat = Utc::now();
                    if let Some(report) = report {
                        node.cpu_percent = report.cpu_percent;
                        node.memory_percent = report.memory_percent;
                        node.gpu_percent = report.gpu_percent;
                        node.gpu_memory_percent = report.gpu_memory_percent;
                        node.current_concurrent = report.current_concurrent;
                        node.request_count = report.request_count;
                        node.error_count = report.error_count;
                        node.avg_response_ms = report.avg_response_ms;
                        node.model_loaded = report.model_loaded;

                        if report.state != node.state {
                            let old = node.state;
                            node.state = report.state;
                            event = Some(RegistryEvent::StatusChanged {
                                node_id: node_id.to_string(),
                                old,
                                new: report.state,
                            });
                        }
                    }
                    counter!("gateway_heartbeats_total", 1);
                    true
                }
                None => {
                    counter!("gateway_heartbeats_unknown_total", 1);
                    warn!(node_id = %node_id, "Heartbeat from unknown node");
                    false
                }
            }
        };

        if let Some(event) = event {
            self.emit(event);
        }
        known
    }

    /// Record a state transition reported out-of-band (not via metrics).
    pub async fn update_status(&self, node_id: &str, state: WorkerState) -> bool {
        let mut event = None;

        let known = {
            let mut inner = self.inner.write().await;
            match inner.nodes.get_mut(node_id) {
                Some(node) => {
                    node.last_heartbeat = Utc::now();
                    if node.state != state {
                        let old = node.state;
                        node.state = state;
                        info!(node_id = %node_id, old = %old, new = %state, "Node status changed");
                        event = Some(RegistryEvent::StatusChanged {
                            node_id: node_id.to_string(),
                            old,
                            new: state,
                        });
                    }
                    true
                }
                None => false,
            }
        };

        if let Some(event) = event {
            self.emit(event);
        }
        known
    }

    pub async fn get_node(&self, node_id: &str) -> Result<NodeRecord, ClusterError> {
        let inner = self.inner.read().await;
        inner
            .nodes
            .get(node_id)
            .cloned()
            .ok_or_else(|| ClusterError::NodeNotFound(node_id.to_string()))
    }

    /// List nodes, insertion-ordered within each engine bucket.
    pub async fn get_nodes(
        &self,
        engine: Option<EngineKind>,
        state: Option<WorkerState>,
        available_only: bool,
    ) -> Vec<NodeRecord> {
        let inner = self.inner.read().await;
        let engines: Vec<EngineKind> = match engine {
            Some(e) => vec![e],
            None => EngineKind::ALL.to_vec(),
        };

        let mut nodes = Vec::new();
        for e in engines {
            let Some(bucket) = inner.engine_index.get(&e) else {
                continue;
            };
            for id in bucket {
                let Some(node) = inner.nodes.get(id) else {
                    continue;
                };
                if let Some(wanted) = state {
                    if node.state != wanted {
                        continue;
                    }
                }
                if available_only && !node.is_available() {
                    continue;
                }
                nodes.push(node.clone());
            }
        }
        nodes
    }

    /// Pick an available worker for the engine. Round-robin advances a
    /// per-engine cursor under the registry lock, so two concurrent callers
    /// never double-read the same index.
    pub async fn select(
        &self,
        engine: EngineKind,
        strategy: SelectionStrategy,
    ) -> Result<NodeRecord, ClusterError> {
        let mut inner = self.inner.write().await;

        let available: Vec<String> = inner
            .engine_index
            .get(&engine)
            .map(|bucket| {
                bucket
                    .iter()
                    .filter(|id| {
                        inner
                            .nodes
                            .get(*id)
                            .map(|n| n.is_available())
                            .unwrap_or(false)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if available.is_empty() {
            return Err(ClusterError::NoAvailableNode(engine));
        }

        let chosen = match strategy {
            SelectionStrategy::RoundRobin => {
                let counter = inner.rr_counters.entry(engine).or_insert(0);
                let index = *counter % available.len();
                *counter = (*counter + 1) % available.len();
                available[index].clone()
            }
            SelectionStrategy::LeastLoad => {
                // Ties break toward insertion order.
                let mut best = available[0].clone();
                let mut best_load = u32::MAX;
                for id in &available {
                    let load = inner.nodes[id].current_concurrent;
                    if load < best_load {
                        best_load = load;
                        best = id.clone();
                    }
                }
                best
            }
            SelectionStrategy::Random => {
                let index = rand::thread_rng().gen_range(0..available.len());
                available[index].clone()
            }
        };

        Ok(inner.nodes[&chosen].clone())
    }

    /// Membership counts, overall and per engine. Every engine appears in
    /// the breakdown even when it has no workers.
    pub async fn stats(&self) -> RegistryStats {
        let inner = self.inner.read().await;
        let total = inner.nodes.len();
        let online = inner
            .nodes
            .values()
            .filter(|n| n.state != WorkerState::Offline)
            .count();
        let ready = inner.nodes.values().filter(|n| n.is_available()).count();

        let mut engines = BTreeMap::new();
        for engine in EngineKind::ALL {
            let mut stats = EngineStats::default();
            if let Some(bucket) = inner.engine_index.get(&engine) {
                for id in bucket {
                    let Some(node) = inner.nodes.get(id) else {
                        continue;
                    };
                    stats.total += 1;
                    if node.state != WorkerState::Offline {
                        stats.online += 1;
                    }
                    if node.is_available() {
                        stats.ready += 1;
                    }
                }
            }
            engines.insert(engine, stats);
        }

        RegistryStats {
            total,
            online,
            ready,
            engines,
        }
    }

    /// Full snapshot for `/api/status` and the WebSocket push.
    pub async fn system_status(&self, announcements: Vec<Announcement>) -> SystemStatus {
        let stats = self.stats().await;
        let inner = self.inner.read().await;

        let total_requests: u64 = inner.nodes.values().map(|n| n.request_count).sum();
        let current_concurrent: u64 = inner
            .nodes
            .values()
            .map(|n| n.current_concurrent as u64)
            .sum();

        let active: Vec<&NodeRecord> = inner
            .nodes
            .values()
            .filter(|n| n.request_count > 0)
            .collect();
        let avg_response_time_ms = if active.is_empty() {
            0.0
        } else {
            active.iter().map(|n| n.avg_response_ms).sum::<f64>() / active.len() as f64
        };

        SystemStatus {
            online_nodes: stats.online,
            total_nodes: stats.total,
            total_requests,
            current_concurrent,
            avg_response_time_ms,
            engines: stats.engines,
            announcements,
        }
    }

    /// Fire-and-forget lifecycle command proxy. The registry never mutates
    /// its own state here; the worker's next heartbeat reports the outcome.
    pub async fn send_command(
        &self,
        node_id: &str,
        command: &NodeCommand,
    ) -> Result<bool, ClusterError> {
        let address = {
            let inner = self.inner.read().await;
            inner
                .nodes
                .get(node_id)
                .map(|n| n.address())
                .ok_or_else(|| ClusterError::NodeNotFound(node_id.to_string()))?
        };

        let url = format!("http://{address}/command");
        match self
            .http
            .post(&url)
            .json(command)
            .timeout(self.command_timeout)
            .send()
            .await
        {
            Ok(response) => Ok(response.status().is_success()),
            Err(e) => {
                warn!(node_id = %node_id, error = %e, "Failed to send command to node");
                Ok(false)
            }
        }
    }

    /// One liveness pass at the given instant: any non-offline record whose
    /// last heartbeat is older than the dead threshold is marked offline.
    /// Records are never removed here; operators expect to see dead nodes.
    async fn sweep_at(&self, now: DateTime<Utc>) {
        let mut stale = Vec::new();

        {
            let mut inner = self.inner.write().await;
            for node in inner.nodes.values_mut() {
                if node.state != WorkerState::Offline
                    && now - node.last_heartbeat > self.dead_threshold
                {
                    warn!(
                        node_id = %node.node_id,
                        last_heartbeat = %node.last_heartbeat,
                        "Node marked offline (missed heartbeats)"
                    );
                    node.state = WorkerState::Offline;
                    stale.push(node.node_id.clone());
                    counter!("gateway_nodes_marked_offline_total", 1);
                }
            }
        }

        for node_id in stale {
            self.emit(RegistryEvent::NodeOffline { node_id });
        }
    }

    /// Spawn the liveness sweeper. Runs until the shutdown token fires.
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(registry.sweep_interval);
            interval.tick().await; // consume the immediate first tick
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Liveness sweeper stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        registry.sweep_at(Utc::now()).await;
                    }
                }
            }
        })
    }

    #[cfg(test)]
    async fn rewind_heartbeat(&self, node_id: &str, seconds: i64) {
        let mut inner = self.inner.write().await;
        if let Some(node) = inner.nodes.get_mut(node_id) {
            node.last_heartbeat = Utc::now() - chrono::Duration::seconds(seconds);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, engine: EngineKind, ready: bool) -> NodeRecord {
        serde_json::from_value(serde_json::json!({
            "node_id": id,
            "engine": engine,
            "host": "127.0.0.1",
            "port": 8001,
            "state": if ready { "ready" } else { "standby" },
            "model_loaded": ready
        }))
        .expect("valid record")
    }

    fn registry() -> (Arc<ServiceRegistry>, mpsc::UnboundedReceiver<RegistryEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ServiceRegistry::new(1, 3, 5, tx)), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<RegistryEvent>) -> Vec<RegistryEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn register_twice_then_unregister_is_one_event_pair() {
        let (registry, mut rx) = registry();
        registry.register(record("abc12345", EngineKind::Xtts, true)).await;
        registry.register(record("abc12345", EngineKind::Xtts, true)).await;
        assert!(registry.unregister("abc12345").await);
        assert!(!registry.unregister("abc12345").await);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], RegistryEvent::NodeOnline(_)));
        assert!(matches!(events[1], RegistryEvent::NodeOffline { .. }));
        assert!(registry.get_nodes(None, None, false).await.is_empty());
    }

    #[tokio::test]
    async fn engine_index_matches_records() {
        let (registry, _rx) = registry();
        registry.register(record("aaaa0001", EngineKind::Xtts, true)).await;
        registry.register(record("aaaa0002", EngineKind::OpenVoice, true)).await;
        registry.register(record("aaaa0003", EngineKind::Xtts, false)).await;

        let xtts = registry.get_nodes(Some(EngineKind::Xtts), None, false).await;
        assert_eq!(
            xtts.iter().map(|n| n.node_id.as_str()).collect::<Vec<_>>(),
            vec!["aaaa0001", "aaaa0003"]
        );

        // Re-register under a different engine moves the record to the new
        // bucket without leaving a stale entry behind.
        registry.register(record("aaaa0003", EngineKind::OpenVoice, false)).await;
        let xtts = registry.get_nodes(Some(EngineKind::Xtts), None, false).await;
        assert_eq!(xtts.len(), 1);
        let openvoice = registry
            .get_nodes(Some(EngineKind::OpenVoice), None, false)
            .await;
        assert_eq!(openvoice.len(), 2);
    }

    #[tokio::test]
    async fn heartbeat_unknown_node_is_dropped() {
        let (registry, mut rx) = registry();
        assert!(!registry.heartbeat("deadbeef", None).await);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn heartbeat_state_change_emits_event() {
        let (registry, mut rx) = registry();
        registry.register(record("abc12345", EngineKind::Xtts, false)).await;
        drain(&mut rx);

        let report = MetricsReport {
            state: WorkerState::Ready,
            model_loaded: true,
            cpu_percent: 12.5,
            memory_percent: 40.0,
            gpu_percent: 0.0,
            gpu_memory_percent: 0.0,
            current_concurrent: 2,
            request_count: 7,
            error_count: 1,
            avg_response_ms: 120.0,
        };
        assert!(registry.heartbeat("abc12345", Some(report)).await);

        let node = registry.get_node("abc12345").await.unwrap();
        assert_eq!(node.state, WorkerState::Ready);
        assert!(node.model_loaded);
        assert!(node.is_available());
        assert_eq!(node.request_count, 7);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            RegistryEvent::StatusChanged { old: WorkerState::Standby, new: WorkerState::Ready, .. }
        ));
    }

    #[tokio::test]
    async fn round_robin_alternates() {
        let (registry, _rx) = registry();
        registry.register(record("aaaa000a", EngineKind::Xtts, true)).await;
        registry.register(record("aaaa000b", EngineKind::Xtts, true)).await;

        let mut picks = Vec::new();
        for _ in 0..10 {
            let node = registry
                .select(EngineKind::Xtts, SelectionStrategy::RoundRobin)
                .await
                .unwrap();
            picks.push(node.node_id);
        }
        for (i, pick) in picks.iter().enumerate() {
            let expected = if i % 2 == 0 { "aaaa000a" } else { "aaaa000b" };
            assert_eq!(pick, expected);
        }
    }

    #[tokio::test]
    async fn least_load_breaks_ties_by_insertion_order() {
        let (registry, _rx) = registry();
        registry.register(record("aaaa000a", EngineKind::Xtts, true)).await;
        registry.register(record("aaaa000b", EngineKind::Xtts, true)).await;

        let node = registry
            .select(EngineKind::Xtts, SelectionStrategy::LeastLoad)
            .await
            .unwrap();
        assert_eq!(node.node_id, "aaaa000a");

        let report = MetricsReport {
            state: WorkerState::Ready,
            model_loaded: true,
            cpu_percent: 0.0,
            memory_percent: 0.0,
            gpu_percent: 0.0,
            gpu_memory_percent: 0.0,
            current_concurrent: 5,
            request_count: 0,
            error_count: 0,
            avg_response_ms: 0.0,
        };
        registry.heartbeat("aaaa000a", Some(report)).await;

        let node = registry
            .select(EngineKind::Xtts, SelectionStrategy::LeastLoad)
            .await
            .unwrap();
        assert_eq!(node.node_id, "aaaa000b");
    }

    #[tokio::test]
    async fn select_without_available_nodes_fails() {
        let (registry, _rx) = registry();
        registry.register(record("aaaa000a", EngineKind::Xtts, false)).await;
        let err = registry
            .select(EngineKind::Xtts, SelectionStrategy::RoundRobin)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::NoAvailableNode(EngineKind::Xtts)));
    }

    #[tokio::test]
    async fn update_status_records_transition_once() {
        let (registry, mut rx) = registry();
        registry.register(record("abc12345", EngineKind::Xtts, false)).await;
        drain(&mut rx);

        assert!(registry.update_status("abc12345", WorkerState::Loading).await);
        assert!(registry.update_status("abc12345", WorkerState::Loading).await);
        assert!(!registry.update_status("deadbeef", WorkerState::Ready).await);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            RegistryEvent::StatusChanged { new: WorkerState::Loading, .. }
        ));
    }

    #[tokio::test]
    async fn stats_counts_membership() {
        let (registry, _rx) = registry();
        registry.register(record("abc12345", EngineKind::Xtts, true)).await;

        let stats = registry.stats().await;
        assert_eq!((stats.total, stats.online, stats.ready), (1, 1, 1));
        let xtts = &stats.engines[&EngineKind::Xtts];
        assert_eq!((xtts.total, xtts.online, xtts.ready), (1, 1, 1));
        let sovits = &stats.engines[&EngineKind::GptSovits];
        assert_eq!((sovits.total, sovits.online, sovits.ready), (0, 0, 0));
    }

    #[tokio::test]
    async fn sweeper_marks_stale_nodes_offline() {
        let (registry, mut rx) = registry();
        registry.register(record("abc12345", EngineKind::Xtts, true)).await;
        drain(&mut rx);

        // Fresh record survives a sweep.
        registry.sweep_at(Utc::now()).await;
        assert_eq!(
            registry.get_node("abc12345").await.unwrap().state,
            WorkerState::Ready
        );

        registry.rewind_heartbeat("abc12345", 4).await;
        registry.sweep_at(Utc::now()).await;
        let node = registry.get_node("abc12345").await.unwrap();
        assert_eq!(node.state, WorkerState::Offline);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], RegistryEvent::NodeOffline { .. }));

        // A second sweep is a no-op; the record stays visible.
        registry.sweep_at(Utc::now()).await;
        assert!(drain(&mut rx).is_empty());
        assert_eq!(registry.stats().await.total, 1);
    }

    #[tokio::test]
    async fn offline_node_coming_back_emits_online() {
        let (registry, mut rx) = registry();
        registry.register(record("abc12345", EngineKind::Xtts, true)).await;
        registry.rewind_heartbeat("abc12345", 10).await;
        registry.sweep_at(Utc::now()).await;
        drain(&mut rx);

        registry.register(record("abc12345", EngineKind::Xtts, true)).await;
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], RegistryEvent::NodeOnline(_)));
    }
}
