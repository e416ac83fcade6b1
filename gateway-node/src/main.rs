use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use gateway_node::{build, GatewayConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gateway_node=info,tower_http=warn".into()),
        )
        .with_target(false)
        .init();

    info!(
        "Starting Voicemesh Gateway v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = load_config();
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))?;

    initialize_metrics();
    if config.metrics.enabled {
        start_metrics_exporter(config.metrics.listen_addr)?;
    }

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let bind_addr = format!("{}:{}", config.network.host, config.network.port);
    let gateway = build(config, shutdown.clone());

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {bind_addr}"))?;
    info!(listen_addr = %bind_addr, "Gateway API server listening");

    axum::serve(
        listener,
        gateway
            .router
            .into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.clone().cancelled_owned())
    .await
    .context("API server error")?;

    shutdown.cancel();
    for task in gateway.tasks {
        let _ = task.await;
    }
    info!("Gateway stopped");
    Ok(())
}

/// Load configuration from `VOICEMESH_CONFIG` or the conventional paths,
/// falling back to defaults, then layer environment overrides on top.
fn load_config() -> GatewayConfig {
    let config_name =
        std::env::var("VOICEMESH_CONFIG").unwrap_or_else(|_| "config/default".to_string());
    let candidates = [config_name.clone(), format!("gateway-node/{config_name}")];

    let mut config = None;
    for candidate in &candidates {
        match GatewayConfig::from_file(candidate) {
            Ok(loaded) => {
                info!(path = %candidate, "Configuration loaded");
                config = Some(loaded);
                break;
            }
            Err(e) => {
                debug!(path = %candidate, error = %e, "Config file not usable");
            }
        }
    }

    let mut config = config.unwrap_or_else(|| {
        warn!("No configuration file found, using defaults");
        GatewayConfig::default()
    });
    config.apply_environment_overrides();
    config
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT, shutting down"),
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("Received Ctrl-C, shutting down");
        }
        shutdown.cancel();
    });
}

fn initialize_metrics() {
    describe_counter!(
        "gateway_nodes_registered_total",
        "Total number of workers registered"
    );
    describe_counter!(
        "gateway_heartbeats_total",
        "Total number of heartbeats received"
    );
    describe_counter!(
        "gateway_heartbeats_unknown_total",
        "Heartbeats received from unknown workers"
    );
    describe_counter!(
        "gateway_nodes_marked_offline_total",
        "Workers marked offline by the liveness sweeper"
    );
    describe_counter!(
        "gateway_rate_limited_total",
        "Requests rejected by the rate limiter"
    );
    describe_counter!(
        "gateway_synthesize_requests_total",
        "Synthesis requests forwarded to workers"
    );
    describe_counter!(
        "gateway_synthesize_errors_total",
        "Synthesis forwards that failed"
    );
    describe_gauge!("gateway_total_nodes", "Current registry size");
    describe_gauge!(
        "gateway_ws_connections",
        "Currently connected status WebSocket clients"
    );
}

fn start_metrics_exporter(addr: SocketAddr) -> Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;
    info!(metrics_addr = %addr, "Prometheus metrics exporter started");
    Ok(())
}
