use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use voicemesh_common::short_id;
use worker_node::{
    api::{build_router, WorkerApi},
    config::WorkerConfig,
    engine::Engine,
    gateway::{spawn_heartbeat_loop, GatewayClient},
    runtime::WorkerRuntime,
    voices::VoiceStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "worker_node=info,gateway_node=info,tower_http=warn".into()),
        )
        .with_target(false)
        .init();

    let mut config = load_config();
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))?;

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    // Standalone mode embeds a gateway in-process, the single-machine
    // driver for development and testing.
    if config.mode.as_deref() == Some("standalone") {
        let port = config.gateway.standalone_port;
        start_embedded_gateway(port, shutdown.clone()).await?;
        config.gateway.url = Some(format!("http://127.0.0.1:{port}"));
    }

    let node_id = config.node.node_id.clone().unwrap_or_else(short_id);
    info!(
        node_id = %node_id,
        engine = %config.node.engine,
        "Starting Voicemesh Worker v{}",
        env!("CARGO_PKG_VERSION")
    );

    let store = VoiceStore::new(config.engine.voices_dir.clone());
    store
        .ensure_root()
        .await
        .context("Failed to create voices directory")?;

    let engine = Engine::from_config(config.node.engine, &config.engine, store);
    let runtime = WorkerRuntime::new(
        node_id,
        config.node.host.clone(),
        config.node.port,
        engine,
    );

    if config.engine.auto_load && !runtime.activate().await {
        warn!("Automatic model load failed; worker starts in error state");
    }

    let gateway_client = config.gateway.url.as_deref().map(|url| {
        Arc::new(GatewayClient::new(url, config.gateway.request_timeout_s))
    });
    let heartbeat_task = gateway_client.as_ref().map(|client| {
        spawn_heartbeat_loop(
            Arc::clone(client),
            Arc::clone(&runtime),
            Duration::from_secs(config.gateway.heartbeat_interval_s),
            shutdown.clone(),
        )
    });

    let api = WorkerApi {
        runtime: Arc::clone(&runtime),
        shutdown: shutdown.clone(),
    };
    let bind_addr = format!("{}:{}", config.node.host, config.node.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {bind_addr}"))?;
    info!(listen_addr = %bind_addr, "Worker API server listening");

    axum::serve(listener, build_router(api))
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await
        .context("Worker API server error")?;

    // Graceful stop: drain, unload, unregister, exit clean.
    shutdown.cancel();
    if let Some(task) = heartbeat_task {
        let _ = task.await;
    }
    runtime
        .shutdown(Duration::from_secs(config.shutdown.timeout_s))
        .await;
    if let Some(client) = gateway_client {
        if let Err(e) = client.unregister(runtime.node_id()).await {
            warn!(error = %e, "Unregister from gateway failed");
        }
    }
    Ok(())
}

/// Load configuration from `VOICEMESH_CONFIG` or the conventional paths,
/// falling back to defaults, then layer environment overrides on top.
fn load_config() -> WorkerConfig {
    let config_name =
        std::env::var("VOICEMESH_CONFIG").unwrap_or_else(|_| "config/default".to_string());
    let candidates = [config_name.clone(), format!("worker-node/{config_name}")];

    let mut config = None;
    for candidate in &candidates {
        match WorkerConfig::from_file(candidate) {
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
        WorkerConfig::default()
    });
    config.apply_environment_overrides();
    config
}

async fn start_embedded_gateway(port: u16, shutdown: CancellationToken) -> Result<()> {
    use std::net::SocketAddr;

    let mut gateway_config = gateway_node::GatewayConfig::default();
    gateway_config.network.host = "127.0.0.1".to_string();
    gateway_config.network.port = port;

    let gateway = gateway_node::build(gateway_config, shutdown.clone());
    let bind_addr = format!("127.0.0.1:{port}");
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind embedded gateway to {bind_addr}"))?;
    info!(listen_addr = %bind_addr, "Embedded gateway listening");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(
            listener,
            gateway
                .router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        {
            warn!(error = %e, "Embedded gateway server error");
        }
    });
    Ok(())
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
