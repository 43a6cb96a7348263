use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use opsgraph_core::error::OpsError;
use opsgraph_core::event::StreamEvent;
use opsgraph_core::types::{ChatRequest, ResumeRequest, SessionId};

use crate::state::AppState;

const NDJSON: &str = "application/x-ndjson";
const THREAD_HEADER: &str = "x-thread-id";

/// JSON error body with a status code.
pub struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(serde_json::json!({ "error": self.1 }))).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        // Unknown resume actions and malformed bodies are client errors alike
        Self(StatusCode::BAD_REQUEST, rejection.body_text())
    }
}

fn ndjson_response(thread_id: &SessionId, rx: mpsc::Receiver<StreamEvent>) -> Response {
    let lines = ReceiverStream::new(rx).map(|event| Ok::<_, Infallible>(event.to_line()));
    let mut response = Response::new(Body::from_stream(lines));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(NDJSON));
    if let Ok(value) = HeaderValue::from_str(thread_id.as_str()) {
        headers.insert(THREAD_HEADER, value);
    }
    response
}

// GET /api/health
pub async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "nodes": state.engine.roster().nodes().len(),
        "bind": state.config.bind,
    }))
}

// POST /chat
pub async fn chat(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) = body?;
    if req.message.trim().is_empty() {
        return Err(ApiError(StatusCode::BAD_REQUEST, "message must not be empty".into()));
    }

    let (thread_id, rx) = state.engine.spawn_chat(req);
    info!(session_id = %thread_id, "Chat stream opened");
    Ok(ndjson_response(&thread_id, rx))
}

// POST /chat/resume
pub async fn resume(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ResumeRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) = body?;
    if req.thread_id.trim().is_empty() {
        return Err(ApiError(StatusCode::BAD_REQUEST, "thread_id must not be empty".into()));
    }

    let thread_id = SessionId::from_string(req.thread_id.trim());
    debug!(session_id = %thread_id, action = ?req.action, "Resume stream opened");
    let rx = state.engine.spawn_resume(req);
    Ok(ndjson_response(&thread_id, rx))
}

// GET /api/sessions
pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, ApiError> {
    let ids = state.engine.store().list().map_err(|e| {
        warn!(error = %e, "Listing sessions failed");
        ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;
    Ok(Json(serde_json::json!({ "sessions": ids })))
}

// GET /api/sessions/{id}
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state.engine.store().load(&SessionId::from_string(&id)) {
        Ok(session) => Ok(Json(serde_json::json!({
            "thread_id": session.id,
            "cursor": session.cursor,
            "revision": session.revision,
            "last_decision": session.last_decision,
            "messages": session.messages,
        }))),
        Err(e @ OpsError::SessionNotFound(_)) => Err(ApiError(StatusCode::NOT_FOUND, e.to_string())),
        Err(e) => Err(ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}
