//! chatgate HTTP surface: chat (blocking and SSE), history and health.

pub mod body;

use axum::{
    body::Body,
    extract::{ConnectInfo, Path, Query, State},
    http::{header, HeaderName, Request, StatusCode},
    middleware::Next,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use body::ChatBody;
use chatgate_core::stream::encode_frame;
use chatgate_core::{validate, ChatReply, Coordinator, GatewayError, SessionRecord};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

const DEFAULT_HISTORY_LIMIT: usize = 50;
const DEFAULT_SESSIONS_LIMIT: usize = 20;
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
}

impl AppState {
    pub fn new(coordinator: Coordinator) -> Self {
        Self { coordinator: Arc::new(coordinator) }
    }
}

/// HTTP mapping for `GatewayError`: 400 validation, 502 provider, 500 otherwise.
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        Self(err)
    }
}

impl From<chatgate_core::PersistenceError> for ApiError {
    fn from(err: chatgate_core::PersistenceError) -> Self {
        Self(GatewayError::Persistence(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::Provider(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Config(_) | GatewayError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(target: "chatgate::gateway", error = %self.0, "request failed");
        }
        (status, Json(serde_json::json!({ "message": self.0.to_string() }))).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/chat", post(chat_handler))
        .route("/chat/stream", post(chat_stream_handler))
        .route("/chat/history", get(history_handler))
        .route("/chat/sessions", get(sessions_handler))
        .route("/chat/sessions/:id", delete(delete_session_handler))
        .with_state(state)
        .layer(axum::middleware::from_fn(log_requests))
}

async fn log_requests(
    connect: Option<ConnectInfo<SocketAddr>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();
    let response = next.run(request).await;
    tracing::info!(
        target: "chatgate::gateway",
        peer = ?connect.map(|ConnectInfo(addr)| addr),
        %method,
        %path,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request handled"
    );
    response
}

async fn health() -> &'static str {
    "OK"
}

async fn chat_handler(
    State(state): State<AppState>,
    Json(body): Json<ChatBody>,
) -> Result<Json<ChatReply>, ApiError> {
    let req = body.into_request()?;
    Ok(Json(state.coordinator.chat(req).await?))
}

/// Canonical events as SSE, one compact JSON object per `data:` line.
async fn chat_stream_handler(
    State(state): State<AppState>,
    Json(body): Json<ChatBody>,
) -> Result<Response, ApiError> {
    let req = body.into_request()?;
    validate(&req)?;
    let events = Arc::clone(&state.coordinator)
        .chat_stream(req)
        .map(|event| Ok::<_, Infallible>(Event::default().data(encode_frame(&event))));
    let sse = Sse::new(events).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL));
    Ok((
        [
            (header::CACHE_CONTROL, "no-cache"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        sse,
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryQuery {
    #[serde(default, alias = "session_id")]
    session_id: String,
    limit: Option<usize>,
}

#[derive(Serialize)]
struct HistoryEntry {
    role: &'static str,
    content: String,
    time: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HistoryReply {
    session_id: String,
    messages: Vec<HistoryEntry>,
}

async fn history_handler(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryReply>, ApiError> {
    let session_id = query.session_id.trim().to_string();
    if session_id.is_empty() {
        return Err(GatewayError::Validation("sessionId is required".into()).into());
    }
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    let messages = state
        .coordinator
        .history()
        .list_messages(&session_id, limit)
        .await?
        .into_iter()
        .map(|m| HistoryEntry {
            role: m.role.as_str(),
            content: m.content,
            time: m.created_at.to_rfc3339(),
        })
        .collect();
    Ok(Json(HistoryReply { session_id, messages }))
}

#[derive(Debug, Deserialize)]
struct SessionsQuery {
    limit: Option<usize>,
}

#[derive(Serialize)]
struct SessionsReply {
    sessions: Vec<SessionRecord>,
}

async fn sessions_handler(
    State(state): State<AppState>,
    Query(query): Query<SessionsQuery>,
) -> Result<Json<SessionsReply>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_SESSIONS_LIMIT);
    let sessions = state.coordinator.history().list_sessions(limit).await?;
    Ok(Json(SessionsReply { sessions }))
}

async fn delete_session_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deleted = state.coordinator.history().delete_session(&session_id).await?;
    Ok(Json(serde_json::json!({ "sessionId": session_id, "deleted": deleted })))
}
