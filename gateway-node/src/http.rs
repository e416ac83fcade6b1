use axum::{
    extract::{ConnectInfo, Multipart, Path, Query, State, WebSocketUpgrade},
    http::{header, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use metrics::counter;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, instrument, warn};

use voicemesh_common::{
    AckResponse, Announcement, BatchItemResult, BatchSynthesizeRequest, BatchSynthesizeResponse,
    ClusterError, EngineKind, FailureBody, HealthReport, HealthState, MetricsReport,
    NodeCommand, NodeListResponse, NodeRecord, RegisterResponse, SynthesizeRequest, WorkerState,
};

use crate::announcements::AnnouncementBoard;
use crate::broadcast::{handle_socket, ConnectionManager, StatusBroadcaster};
use crate::config::GatewayConfig;
use crate::limiter::RateLimiter;
use crate::registry::{SelectionStrategy, ServiceRegistry};

/// Shared gateway state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub registry: Arc<ServiceRegistry>,
    pub limiter: Arc<RateLimiter>,
    pub connections: Arc<ConnectionManager>,
    pub broadcaster: Arc<StatusBroadcaster>,
    pub announcements: Arc<AnnouncementBoard>,
    pub http: reqwest::Client,
    pub started_at: Instant,
}

/// Boundary adapter mapping [`ClusterError`] kinds onto HTTP statuses with
/// an `{"error", "code"}` body.
pub struct ApiError(pub ClusterError);

impl From<ClusterError> for ApiError {
    fn from(err: ClusterError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ClusterError::NodeNotFound(_) | ClusterError::VoiceNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            ClusterError::RateLimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            ClusterError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ClusterError::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ClusterError::NoAvailableNode(_) | ClusterError::ModelNotLoaded(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ClusterError::EngineError(_) | ClusterError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ClusterError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({ "error": self.0.to_string(), "code": self.0.code() });
        (status, Json(body)).into_response()
    }
}

/// Build the gateway router with limiter gating and tracing layers.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/health", get(health))
        .route("/api/status", get(system_status))
        .route("/api/nodes/register", post(register_node))
        .route("/api/nodes", get(list_nodes))
        .route("/api/nodes/:node_id", get(get_node).delete(unregister_node))
        .route("/api/nodes/:node_id/heartbeat", post(node_heartbeat))
        .route("/api/nodes/:node_id/command", post(send_node_command))
        .route("/api/synthesize", post(synthesize))
        .route("/api/extract_voice", post(extract_voice))
        .route("/api/batch_synthesize", post(batch_synthesize))
        .route(
            "/api/announcements",
            get(list_announcements).post(create_announcement),
        )
        .route("/api/announcements/:id", delete(delete_announcement))
        .route("/ws", get(ws_status))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Best-effort client address: proxy header first, then the socket peer.
fn client_ip<B>(request: &Request<B>) -> String {
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Limiter gate for the API surface. Dashboard, static, and health paths
/// bypass it; everything else must clear the window tiers and claim a
/// concurrency permit for the duration of the request.
async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    if !path.starts_with("/api/") || path == "/api/health" {
        return next.run(request).await;
    }

    let ip = client_ip(&request);
    if let Err(err) = state.limiter.check(&ip, &path) {
        return rate_limited(err);
    }
    if let Err(err) = state.limiter.acquire_concurrent() {
        return rate_limited(err);
    }

    let response = next.run(request).await;
    state.limiter.release_concurrent();
    response
}

fn rate_limited(err: ClusterError) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({ "error": err.to_string(), "code": err.code() })),
    )
        .into_response()
}

async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    let stats = state.registry.stats().await;
    let status = if stats.ready > 0 {
        HealthState::Healthy
    } else if stats.online > 0 {
        HealthState::Degraded
    } else {
        HealthState::Unhealthy
    };

    Json(HealthReport {
        status,
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs_f64(),
        components: json!({
            "registry": {
                "total_nodes": stats.total,
                "online_nodes": stats.online,
                "ready_nodes": stats.ready,
            },
            "limiter": state.limiter.stats(),
        }),
    })
}

async fn system_status(State(state): State<AppState>) -> Response {
    let status = state
        .registry
        .system_status(state.announcements.active())
        .await;
    Json(status).into_response()
}

#[instrument(skip(state, record), fields(node_id = %record.node_id))]
async fn register_node(
    State(state): State<AppState>,
    Json(record): Json<NodeRecord>,
) -> Json<RegisterResponse> {
    let node_id = state.registry.register(record).await;
    Json(RegisterResponse {
        success: true,
        node_id,
    })
}

async fn unregister_node(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Json<AckResponse> {
    let success = state.registry.unregister(&node_id).await;
    Json(AckResponse { success })
}

async fn node_heartbeat(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    Json(report): Json<MetricsReport>,
) -> Json<AckResponse> {
    let success = state.registry.heartbeat(&node_id, Some(report)).await;
    Json(AckResponse { success })
}

#[derive(Debug, Deserialize)]
struct ListNodesQuery {
    engine: Option<String>,
    status: Option<String>,
}

async fn list_nodes(
    State(state): State<AppState>,
    Query(query): Query<ListNodesQuery>,
) -> Result<Json<NodeListResponse>, ApiError> {
    let engine = query
        .engine
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(str::parse::<EngineKind>)
        .transpose()?;
    let status = query
        .status
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(str::parse::<WorkerState>)
        .transpose()?;

    let nodes = state.registry.get_nodes(engine, status, false).await;
    Ok(Json(NodeListResponse { nodes }))
}

async fn get_node(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Result<Json<NodeRecord>, ApiError> {
    Ok(Json(state.registry.get_node(&node_id).await?))
}

async fn send_node_command(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    Json(command): Json<NodeCommand>,
) -> Result<Json<AckResponse>, ApiError> {
    let success = state.registry.send_command(&node_id, &command).await?;
    Ok(Json(AckResponse { success }))
}

/// Forward one synthesis request to a round-robin-selected worker and relay
/// the audio. `NoAvailableNode` keeps its legacy `200 {success:false}`
/// shape for API compatibility.
#[instrument(skip(state, request))]
async fn synthesize(
    State(state): State<AppState>,
    Json(request): Json<SynthesizeRequest>,
) -> Response {
    if let Err(err) = request.validate() {
        return ApiError(err).into_response();
    }

    let engine = request.engine.unwrap_or(state.config.forward.default_engine);
    let node = match state.registry.select(engine, SelectionStrategy::RoundRobin).await {
        Ok(node) => node,
        Err(err) => {
            return (StatusCode::OK, Json(FailureBody::from_error(&err))).into_response();
        }
    };

    counter!("gateway_synthesize_requests_total", 1);
    let url = format!("http://{}/synthesize", node.address());
    let result = state
        .http
        .post(&url)
        .json(&request)
        .timeout(Duration::from_secs(state.config.forward.request_timeout_s))
        .send()
        .await;

    match result {
        Ok(response) if response.status().is_success() => {
            let bytes = match response.bytes().await {
                Ok(bytes) => bytes,
                Err(e) => return forward_failure(e.into(), &node.node_id),
            };
            (
                [
                    (header::CONTENT_TYPE.as_str(), "audio/wav".to_string()),
                    ("x-node-id", node.node_id.clone()),
                    ("x-engine", engine.to_string()),
                ],
                bytes,
            )
                .into_response()
        }
        Ok(response) => {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            warn!(node_id = %node.node_id, status = %status, "Worker synthesize failed");
            counter!("gateway_synthesize_errors_total", 1);
            (
                StatusCode::BAD_GATEWAY,
                Json(FailureBody::new(
                    format!("Node error: {detail}"),
                    "ENGINE_ERROR",
                )),
            )
                .into_response()
        }
        Err(e) => forward_failure(e.into(), &node.node_id),
    }
}

fn forward_failure(err: ClusterError, node_id: &str) -> Response {
    error!(node_id = %node_id, error = %err, "Forwarding to worker failed");
    counter!("gateway_synthesize_errors_total", 1);
    let status = match err {
        ClusterError::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    };
    (status, Json(FailureBody::from_error(&err))).into_response()
}

/// Relay a multipart voice-extraction upload to a selected worker and pass
/// its JSON verdict back.
async fn extract_voice(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    let mut audio: Option<(Vec<u8>, String, Option<String>)> = None;
    let mut voice_id = String::new();
    let mut voice_name = String::new();
    let mut engine: Option<EngineKind> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                return ApiError(ClusterError::InvalidRequest(format!(
                    "malformed multipart body: {e}"
                )))
                .into_response()
            }
        };
        match field.name() {
            Some("audio") => {
                let file_name = field
                    .file_name()
                    .unwrap_or("reference.wav")
                    .to_string();
                let content_type = field.content_type().map(str::to_string);
                match field.bytes().await {
                    Ok(bytes) => audio = Some((bytes.to_vec(), file_name, content_type)),
                    Err(e) => {
                        return ApiError(ClusterError::InvalidRequest(format!(
                            "failed to read audio field: {e}"
                        )))
                        .into_response()
                    }
                }
            }
            Some("voice_id") => {
                voice_id = field.text().await.unwrap_or_default();
            }
            Some("voice_name") => {
                voice_name = field.text().await.unwrap_or_default();
            }
            Some("engine") => {
                let raw = field.text().await.unwrap_or_default();
                if !raw.is_empty() {
                    match raw.parse() {
                        Ok(parsed) => engine = Some(parsed),
                        Err(err) => return ApiError(err).into_response(),
                    }
                }
            }
            _ => {}
        }
    }

    let Some((audio_bytes, file_name, content_type)) = audio else {
        return ApiError(ClusterError::InvalidRequest(
            "missing audio file".to_string(),
        ))
        .into_response();
    };

    let engine = engine.unwrap_or(state.config.forward.default_engine);
    let node = match state.registry.select(engine, SelectionStrategy::RoundRobin).await {
        Ok(node) => node,
        Err(err) => {
            return (StatusCode::OK, Json(FailureBody::from_error(&err))).into_response();
        }
    };

    let mut part = reqwest::multipart::Part::bytes(audio_bytes).file_name(file_name);
    if let Some(content_type) = content_type {
        if let Ok(with_mime) = part.mime_str(&content_type) {
            part = with_mime;
        } else {
            return ApiError(ClusterError::InvalidRequest(
                "invalid audio content type".to_string(),
            ))
            .into_response();
        }
    }
    let form = reqwest::multipart::Form::new()
        .part("audio", part)
        .text("voice_id", voice_id)
        .text("voice_name", voice_name);

    let url = format!("http://{}/extract_voice", node.address());
    let result = state
        .http
        .post(&url)
        .multipart(form)
        .timeout(Duration::from_secs(state.config.forward.extract_timeout_s))
        .send()
        .await;

    match result {
        Ok(response) if response.status().is_success() => {
            match response.json::<serde_json::Value>().await {
                Ok(body) => Json(body).into_response(),
                Err(e) => forward_failure(e.into(), &node.node_id),
            }
        }
        Ok(response) => {
            let detail = response.text().await.unwrap_or_default();
            (
                StatusCode::BAD_GATEWAY,
                Json(FailureBody::new(
                    format!("Node error: {detail}"),
                    "ENGINE_ERROR",
                )),
            )
                .into_response()
        }
        Err(e) => forward_failure(e.into(), &node.node_id),
    }
}

/// Sequentially synthesize a batch, selecting a worker per item. Partial
/// failure is reported in the aggregate, never raised.
async fn batch_synthesize(
    State(state): State<AppState>,
    Json(request): Json<BatchSynthesizeRequest>,
) -> Json<BatchSynthesizeResponse> {
    let engine = request.engine.unwrap_or(state.config.forward.default_engine);
    let deadline =
        Instant::now() + Duration::from_secs(state.config.forward.batch_timeout_s);
    let item_timeout = Duration::from_secs(state.config.forward.request_timeout_s);

    let total = request.texts.len();
    let mut results = Vec::with_capacity(total);
    let mut succeeded = 0;
    let mut failed = 0;

    for (index, text) in request.texts.iter().enumerate() {
        if Instant::now() >= deadline {
            results.push(BatchItemResult {
                index,
                success: false,
                size: None,
                error: Some("batch timeout exceeded".to_string()),
            });
            failed += 1;
            continue;
        }

        let outcome = batch_item(&state, engine, text, &request, item_timeout).await;
        match outcome {
            Ok(size) => {
                results.push(BatchItemResult {
                    index,
                    success: true,
                    size: Some(size),
                    error: None,
                });
                succeeded += 1;
            }
            Err(err) => {
                results.push(BatchItemResult {
                    index,
                    success: false,
                    size: None,
                    error: Some(err.to_string()),
                });
                failed += 1;
            }
        }
    }

    Json(BatchSynthesizeResponse {
        success: failed == 0,
        message: format!("Batch completed: {succeeded}/{total}"),
        results,
        total,
        succeeded,
        failed,
    })
}

async fn batch_item(
    state: &AppState,
    engine: EngineKind,
    text: &str,
    request: &BatchSynthesizeRequest,
    timeout: Duration,
) -> Result<usize, ClusterError> {
    let node = state
        .registry
        .select(engine, SelectionStrategy::RoundRobin)
        .await?;

    let body = SynthesizeRequest {
        text: text.to_string(),
        voice_id: request.voice_id.clone(),
        engine: Some(engine),
        language: request.language.clone(),
        speed: 1.0,
        pitch: 1.0,
    };
    body.validate()?;

    let url = format!("http://{}/synthesize", node.address());
    let response = state
        .http
        .post(&url)
        .json(&body)
        .timeout(timeout)
        .send()
        .await?;

    if !response.status().is_success() {
        let detail = response.text().await.unwrap_or_default();
        return Err(ClusterError::EngineError(detail));
    }
    Ok(response.bytes().await?.len())
}

async fn list_announcements(State(state): State<AppState>) -> Response {
    Json(json!({ "announcements": state.announcements.active() })).into_response()
}

async fn create_announcement(
    State(state): State<AppState>,
    Json(announcement): Json<Announcement>,
) -> Response {
    let announcement = state.announcements.create(announcement);
    state.broadcaster.notify_announcement(&announcement);
    Json(json!({ "success": true, "id": announcement.id })).into_response()
}

async fn delete_announcement(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<AckResponse> {
    state.announcements.delete(&id);
    Json(AckResponse { success: true })
}

async fn ws_status(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| {
        handle_socket(
            socket,
            Arc::clone(&state.connections),
            Arc::clone(&state.broadcaster),
        )
    })
}
