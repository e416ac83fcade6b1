use axum::{
    extract::{Multipart, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use metrics::counter;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use voicemesh_common::{
    short_id, ClusterError, CommandKind, ExtractVoiceResponse, HealthReport, HealthState,
    NodeCommand, SynthesizeRequest, WorkerState,
};

use crate::runtime::WorkerRuntime;

/// State for the worker's local HTTP surface.
#[derive(Clone)]
pub struct WorkerApi {
    pub runtime: Arc<WorkerRuntime>,
    pub shutdown: CancellationToken,
}

pub fn build_router(api: WorkerApi) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/info", get(info_snapshot))
        .route("/metrics", get(metrics_snapshot))
        .route("/command", post(command))
        .route("/synthesize", post(synthesize))
        .route("/extract_voice", post(extract_voice))
        .with_state(api)
}

/// Map worker-side failures onto the statuses the gateway expects: missing
/// voices 404, unusable engine 503, timeouts 504, the rest 500.
fn error_response(err: ClusterError) -> Response {
    let status = match &err {
        ClusterError::VoiceNotFound(_) => StatusCode::NOT_FOUND,
        ClusterError::ModelNotLoaded(_)
        | ClusterError::EngineError(_)
        | ClusterError::Upstream(_) => StatusCode::SERVICE_UNAVAILABLE,
        ClusterError::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
        ClusterError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(json!({ "error": err.to_string(), "code": err.code() })),
    )
        .into_response()
}

async fn health(State(api): State<WorkerApi>) -> Json<HealthReport> {
    let state = api.runtime.state().await;
    let status = if state == WorkerState::Ready {
        HealthState::Healthy
    } else {
        HealthState::Degraded
    };
    Json(HealthReport {
        status,
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: api.runtime.uptime_seconds(),
        components: json!({
            "model": {
                "status": if api.runtime.model_loaded() { "loaded" } else { "not_loaded" },
                "engine": api.runtime.engine().kind(),
            }
        }),
    })
}

async fn info_snapshot(State(api): State<WorkerApi>) -> Response {
    Json(api.runtime.record().await).into_response()
}

async fn metrics_snapshot(State(api): State<WorkerApi>) -> Response {
    Json(api.runtime.metrics_report().await).into_response()
}

async fn command(State(api): State<WorkerApi>, Json(command): Json<NodeCommand>) -> Response {
    match CommandKind::parse(&command.command) {
        Some(CommandKind::Activate) => {
            let success = api.runtime.activate().await;
            Json(json!({ "success": success, "status": api.runtime.state().await })).into_response()
        }
        Some(CommandKind::Standby) => {
            let success = api.runtime.standby().await;
            Json(json!({ "success": success, "status": api.runtime.state().await })).into_response()
        }
        Some(CommandKind::Stop) => {
            info!("Stop command received, initiating graceful shutdown");
            api.shutdown.cancel();
            Json(json!({ "success": true, "status": api.runtime.state().await })).into_response()
        }
        None => {
            warn!(command = %command.command, "Unknown command received");
            Json(json!({
                "success": false,
                "error": format!("Unknown command: {}", command.command),
            }))
            .into_response()
        }
    }
}

async fn synthesize(
    State(api): State<WorkerApi>,
    Json(request): Json<SynthesizeRequest>,
) -> Response {
    if !api.runtime.model_loaded() {
        return error_response(ClusterError::ModelNotLoaded(api.runtime.engine().kind()));
    }

    let _guard = api.runtime.track_request();
    let started = Instant::now();
    counter!("worker_synthesize_requests_total", 1);

    match api.runtime.engine().synthesize(&request).await {
        Ok(audio) => {
            let elapsed_ms = started.elapsed().as_millis() as u64;
            api.runtime.record_success(elapsed_ms);
            (
                [
                    (header::CONTENT_TYPE.as_str(), "audio/wav".to_string()),
                    ("x-node-id", api.runtime.node_id().to_string()),
                    ("x-response-time", format!("{elapsed_ms}ms")),
                ],
                audio,
            )
                .into_response()
        }
        Err(e) => {
            api.runtime.record_error();
            counter!("worker_synthesize_errors_total", 1);
            error!(error = %e, "Synthesize failed");
            error_response(e)
        }
    }
}

async fn extract_voice(State(api): State<WorkerApi>, mut multipart: Multipart) -> Response {
    if !api.runtime.model_loaded() {
        return error_response(ClusterError::ModelNotLoaded(api.runtime.engine().kind()));
    }

    let _guard = api.runtime.track_request();
    let started = Instant::now();

    let mut audio: Option<Vec<u8>> = None;
    let mut voice_id = String::new();
    let mut voice_name = String::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                return error_response(ClusterError::InvalidRequest(format!(
                    "malformed multipart body: {e}"
                )))
            }
        };
        match field.name() {
            Some("audio") => match field.bytes().await {
                Ok(bytes) => audio = Some(bytes.to_vec()),
                Err(e) => {
                    return error_response(ClusterError::InvalidRequest(format!(
                        "failed to read audio field: {e}"
                    )))
                }
            },
            Some("voice_id") => voice_id = field.text().await.unwrap_or_default(),
            Some("voice_name") => voice_name = field.text().await.unwrap_or_default(),
            _ => {}
        }
    }

    let Some(audio) = audio else {
        return error_response(ClusterError::InvalidRequest("missing audio file".to_string()));
    };
    if voice_id.is_empty() {
        voice_id = short_id();
    }

    match api
        .runtime
        .engine()
        .extract_voice(audio, voice_id, voice_name)
        .await
    {
        Ok(info) => {
            api.runtime.record_success(started.elapsed().as_millis() as u64);
            Json(ExtractVoiceResponse {
                success: true,
                message: None,
                voice_id: Some(info.voice_id),
                voice_name: Some(info.name),
                engine: Some(info.engine),
            })
            .into_response()
        }
        Err(e) => {
            api.runtime.record_error();
            error!(error = %e, "Voice extraction failed");
            error_response(e)
        }
    }
}
