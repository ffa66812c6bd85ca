use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use mainline_core::{
    bus::EventBus, config::Config, director::Director, rate::RateLimiter, runner::PipelineRunner,
    types::PipelineRequest,
};
use serde_json::json;
use tracing::{info, warn};

use crate::webhook;

pub struct AppState {
    pub config: Arc<Config>,
    pub bus: Arc<EventBus>,
    pub runner: Arc<PipelineRunner>,
    pub director: Arc<Director>,
    pub run_limiter: RateLimiter,
    pub webhook_limiter: RateLimiter,
    pub start_time: Instant,
}

pub(crate) fn internal(e: impl std::fmt::Display) -> StatusCode {
    tracing::error!("internal error: {e}");
    StatusCode::INTERNAL_SERVER_ERROR
}

fn rate_limited(retry_after: u64) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, retry_after.to_string())],
        Json(json!({"error": "rate limited"})),
    )
        .into_response()
}

// ── Health ────────────────────────────────────────────────────────────────

pub(crate) async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "uptime_s": state.start_time.elapsed().as_secs(),
    }))
}

// ── Pipeline ──────────────────────────────────────────────────────────────

pub(crate) async fn run_pipeline(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(request): Json<PipelineRequest>,
) -> Response {
    if let Err(retry_after) = state.run_limiter.check(&format!("run:{}", peer.ip())) {
        return rate_limited(retry_after);
    }
    match state.runner.run(request).await {
        Ok(request_id) => {
            info!(request_id = %request_id, "pipeline run accepted");
            (StatusCode::ACCEPTED, Json(json!({"request_id": request_id}))).into_response()
        }
        Err(e) => {
            warn!("pipeline run rejected: {e:#}");
            (StatusCode::CONFLICT, Json(json!({"error": format!("{e:#}")}))).into_response()
        }
    }
}

pub(crate) async fn stop_pipeline(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<String>,
) -> Response {
    if state.runner.stop(&request_id) {
        Json(json!({"status": "stopping", "request_id": request_id})).into_response()
    } else {
        (StatusCode::NOT_FOUND, Json(json!({"error": "no such run"}))).into_response()
    }
}

pub(crate) async fn pipeline_status(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<String>,
) -> Response {
    match state.runner.status(&request_id) {
        Some(pipeline_state) => Json(pipeline_state).into_response(),
        None => (StatusCode::NOT_FOUND, Json(json!({"error": "unknown request_id"}))).into_response(),
    }
}

pub(crate) async fn list_pipelines(State(state): State<Arc<AppState>>) -> Response {
    Json(state.runner.list_all()).into_response()
}

/// The persisted JSONL sequence for a request, in file order.
pub(crate) async fn pipeline_events(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<String>,
) -> Result<Json<Vec<mainline_core::types::PipelineEvent>>, StatusCode> {
    state.bus.events_for(&request_id).await.map(Json).map_err(internal)
}

// ── Director ──────────────────────────────────────────────────────────────

pub(crate) async fn director_run(State(state): State<Arc<AppState>>) -> Response {
    let director = Arc::clone(&state.director);
    let project_path = state.config.project_path.clone();
    tokio::spawn(async move {
        if let Err(e) = director.run_cycle(&project_path).await {
            warn!("forced director cycle: {e:#}");
        }
    });
    (StatusCode::ACCEPTED, Json(json!({"status": "scheduled"}))).into_response()
}

// ── Webhook ingress ───────────────────────────────────────────────────────

pub(crate) async fn vcs_webhook(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(vcs): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(retry_after) = state.webhook_limiter.check(&format!("hook:{}", peer.ip())) {
        return rate_limited(retry_after);
    }

    if let Some(secret) = &state.config.webhook_secret {
        let signature = headers
            .get("x-hub-signature-256")
            .and_then(|v| v.to_str().ok());
        if !webhook::verify_signature(secret, &body, signature) {
            warn!(vcs = %vcs, "webhook signature validation failed");
            return (StatusCode::UNAUTHORIZED, Json(json!({"error": "bad signature"})))
                .into_response();
        }
    }

    let kind = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, Json(json!({"error": format!("bad payload: {e}")})))
                .into_response()
        }
    };

    let events = webhook::translate(kind, &payload, &state.config);
    if events.is_empty() {
        return Json(json!({"status": "ignored"})).into_response();
    }
    let count = events.len();
    for event in events {
        state.bus.publish(event).await;
    }
    Json(json!({"status": "ok", "events": count})).into_response()
}
