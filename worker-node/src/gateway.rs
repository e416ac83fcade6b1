use anyhow::{Context, Result};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use voicemesh_common::{AckResponse, MetricsReport, NodeRecord, RegisterResponse};

use crate::runtime::WorkerRuntime;

/// Client for the gateway's node-management surface: registration,
/// heartbeats, and the parting unregister.
pub struct GatewayClient {
    base_url: String,
    http: Client,
    request_timeout: Duration,
}

impl GatewayClient {
    pub fn new(base_url: &str, request_timeout_s: u64) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: Client::new(),
            request_timeout: Duration::from_secs(request_timeout_s),
        }
    }

    pub async fn register(&self, record: &NodeRecord) -> Result<()> {
        let url = format!("{}/api/nodes/register", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(record)
            .timeout(self.request_timeout)
            .send()
            .await
            .context("Failed to send registration request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Registration failed with status {status}: {body}");
        }

        let body: RegisterResponse = response
            .json()
            .await
            .context("Failed to parse registration response")?;
        info!(
            node_id = %body.node_id,
            gateway = %self.base_url,
            "Registered with gateway"
        );
        Ok(())
    }

    /// Send one heartbeat. `Ok(false)` means the gateway no longer knows
    /// this node (e.g. it restarted) and a re-register is needed.
    pub async fn heartbeat(&self, node_id: &str, report: &MetricsReport) -> Result<bool> {
        let url = format!("{}/api/nodes/{}/heartbeat", self.base_url, node_id);
        let response = self
            .http
            .post(&url)
            .json(report)
            .timeout(self.request_timeout)
            .send()
            .await
            .context("Failed to send heartbeat")?;

        if !response.status().is_success() {
            let status = response.status();
            anyhow::bail!("Heartbeat failed with status {status}");
        }

        let ack: AckResponse = response
            .json()
            .await
            .context("Failed to parse heartbeat response")?;
        debug!(node_id = %node_id, accepted = ack.success, "Heartbeat sent");
        Ok(ack.success)
    }

    pub async fn unregister(&self, node_id: &str) -> Result<()> {
        let url = format!("{}/api/nodes/{}", self.base_url, node_id);
        let response = self
            .http
            .delete(&url)
            .timeout(self.request_timeout)
            .send()
            .await
            .context("Failed to send unregister request")?;
        if !response.status().is_success() {
            anyhow::bail!("Unregister failed with status {}", response.status());
        }
        info!(node_id = %node_id, "Unregistered from gateway");
        Ok(())
    }
}

/// Periodic membership loop: registers on the first tick (and again
/// whenever the gateway loses the record), then heartbeats with live
/// metrics. Failed posts are logged and retried next tick; the gateway
/// sweeper owns staleness.
pub fn spawn_heartbeat_loop(
    client: Arc<GatewayClient>,
    runtime: Arc<WorkerRuntime>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let mut registered = false;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Heartbeat loop stopped");
                    break;
                }
                _ = ticker.tick() => {
                    if !registered {
                        match client.register(&runtime.record().await).await {
                            Ok(()) => registered = true,
                            Err(e) => {
                                warn!(error = %e, "Gateway registration failed, will retry");
                                continue;
                            }
                        }
                    }

                    let report = runtime.metrics_report().await;
                    match client.heartbeat(runtime.node_id(), &report).await {
                        Ok(true) => {}
                        Ok(false) => {
                            warn!("Gateway dropped our registration, re-registering");
                            registered = false;
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to send heartbeat");
                        }
                    }
                }
            }
        }
    })
}
