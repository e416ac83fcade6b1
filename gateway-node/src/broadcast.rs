use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use metrics::gauge;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use voicemesh_common::{EventType, NodeRecord, WorkerState, WsEvent};

use crate::announcements::AnnouncementBoard;
use crate::registry::{RegistryEvent, ServiceRegistry};

/// Idle timeout on a WebSocket receive before the server sends a ping.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Open dashboard connections. Each connection owns an unbounded channel
/// drained by its writer task, so per-connection send order is preserved
/// and a slow peer never blocks the others.
#[derive(Default)]
pub struct ConnectionManager {
    connections: Mutex<HashMap<u64, mpsc::UnboundedSender<Message>>>,
    next_id: AtomicU64,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, sender: mpsc::UnboundedSender<Message>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let count = {
            let mut connections = self.connections.lock().expect("connection lock poisoned");
            connections.insert(id, sender);
            connections.len()
        };
        gauge!("gateway_ws_connections", count as f64);
        info!(active = count, "WebSocket connected");
        id
    }

    pub fn remove(&self, id: u64) {
        let count = {
            let mut connections = self.connections.lock().expect("connection lock poisoned");
            connections.remove(&id);
            connections.len()
        };
        gauge!("gateway_ws_connections", count as f64);
        info!(active = count, "WebSocket disconnected");
    }

    pub fn count(&self) -> usize {
        self.connections
            .lock()
            .expect("connection lock poisoned")
            .len()
    }

    /// Fan an event out to every connection. Sends go through each
    /// connection's channel outside the lock; dead channels are dropped.
    pub fn broadcast(&self, event: &WsEvent) {
        let targets: Vec<(u64, mpsc::UnboundedSender<Message>)> = {
            let connections = self.connections.lock().expect("connection lock poisoned");
            connections
                .iter()
                .map(|(id, tx)| (*id, tx.clone()))
                .collect()
        };
        if targets.is_empty() {
            return;
        }

        let message = Message::Text(event.to_json());
        let mut dead = Vec::new();
        for (id, tx) in targets {
            if tx.send(message.clone()).is_err() {
                dead.push(id);
            }
        }
        if !dead.is_empty() {
            let mut connections = self.connections.lock().expect("connection lock poisoned");
            for id in dead {
                connections.remove(&id);
            }
        }
    }
}

/// Pushes cluster state to dashboards: a periodic `system_status` snapshot
/// plus typed events pumped from the registry.
pub struct StatusBroadcaster {
    manager: Arc<ConnectionManager>,
    registry: Arc<ServiceRegistry>,
    announcements: Arc<AnnouncementBoard>,
    interval: Duration,
}

impl StatusBroadcaster {
    pub fn new(
        manager: Arc<ConnectionManager>,
        registry: Arc<ServiceRegistry>,
        announcements: Arc<AnnouncementBoard>,
        interval_s: f64,
    ) -> Self {
        Self {
            manager,
            registry,
            announcements,
            interval: Duration::from_secs_f64(interval_s),
        }
    }

    pub async fn system_status_event(&self) -> WsEvent {
        let status = self
            .registry
            .system_status(self.announcements.active())
            .await;
        WsEvent::new(
            EventType::SystemStatus,
            serde_json::to_value(status).unwrap_or_default(),
        )
    }

    pub fn notify_node_online(&self, record: &NodeRecord) {
        let data = serde_json::to_value(record).unwrap_or_default();
        self.manager.broadcast(&WsEvent::new(EventType::NodeOnline, data));
    }

    pub fn notify_node_offline(&self, node_id: &str) {
        self.manager.broadcast(&WsEvent::new(
            EventType::NodeOffline,
            serde_json::json!({ "node_id": node_id }),
        ));
    }

    pub fn notify_node_status_changed(&self, node_id: &str, old: WorkerState, new: WorkerState) {
        self.manager.broadcast(&WsEvent::new(
            EventType::NodeStatusChanged,
            serde_json::json!({
                "node_id": node_id,
                "old_status": old,
                "new_status": new,
            }),
        ));
    }

    pub fn notify_announcement(&self, announcement: &voicemesh_common::Announcement) {
        let data = serde_json::to_value(announcement).unwrap_or_default();
        self.manager
            .broadcast(&WsEvent::new(EventType::Announcement, data));
    }

    /// Periodic snapshot push. Skips the status computation entirely while
    /// no dashboard is connected.
    pub fn spawn_snapshot_loop(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let broadcaster = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(broadcaster.interval);
            interval.tick().await; // consume the immediate first tick
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Status broadcaster stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        if broadcaster.manager.count() == 0 {
                            continue;
                        }
                        let event = broadcaster.system_status_event().await;
                        broadcaster.manager.broadcast(&event);
                    }
                }
            }
        })
    }

    /// Pump registry membership events onto the WebSocket fan-out.
    pub fn spawn_event_pump(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<RegistryEvent>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let broadcaster = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Registry event pump stopped");
                        break;
                    }
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        match event {
                            RegistryEvent::NodeOnline(record) => {
                                broadcaster.notify_node_online(&record);
                            }
                            RegistryEvent::NodeOffline { node_id } => {
                                broadcaster.notify_node_offline(&node_id);
                            }
                            RegistryEvent::StatusChanged { node_id, old, new } => {
                                broadcaster.notify_node_status_changed(&node_id, old, new);
                            }
                        }
                    }
                }
            }
        })
    }
}

/// Per-connection handler for `/ws`. Sends an initial snapshot, then serves
/// the receive loop: idle pings, `ping`/`pong`, on-demand `get_status`.
/// Socket errors tear the connection down without propagating.
pub async fn handle_socket(
    socket: WebSocket,
    manager: Arc<ConnectionManager>,
    broadcaster: Arc<StatusBroadcaster>,
) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let connection_id = manager.add(tx.clone());

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    let initial = broadcaster.system_status_event().await;
    let _ = tx.send(Message::Text(initial.to_json()));

    loop {
        match tokio::time::timeout(IDLE_TIMEOUT, stream.next()).await {
            // Idle: probe the client with an application-level ping.
            Err(_) => {
                if tx
                    .send(Message::Text(r#"{"type":"ping"}"#.to_string()))
                    .is_err()
                {
                    break;
                }
            }
            Ok(None) | Ok(Some(Err(_))) => break,
            Ok(Some(Ok(Message::Close(_)))) => break,
            Ok(Some(Ok(Message::Text(text)))) => {
                match serde_json::from_str::<serde_json::Value>(&text) {
                    Ok(value) => match value.get("type").and_then(|t| t.as_str()) {
                        Some("ping") => {
                            if tx
                                .send(Message::Text(r#"{"type":"pong"}"#.to_string()))
                                .is_err()
                            {
                                break;
                            }
                        }
                        Some("get_status") => {
                            let event = broadcaster.system_status_event().await;
                            if tx.send(Message::Text(event.to_json())).is_err() {
                                break;
                            }
                        }
                        _ => {}
                    },
                    Err(_) => {
                        debug!("Invalid JSON received from WebSocket client");
                    }
                }
            }
            // Binary and transport-level ping/pong frames are ignored.
            Ok(Some(Ok(_))) => {}
        }
    }

    manager.remove(connection_id);
    writer.abort();
}
