//! HTTP surface: cron trigger, dashboard reads, ingestion report-in.
//!
//! Mutating endpoints and the trigger require `Authorization: Bearer <cronSecret>`
//! when a secret is configured. Every failure is answered as JSON.

use std::future::Future;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::SentinelError;
use crate::huc;
use crate::scheduler::{RunReport, RunStatus, Sentinel, WatershedDetail};
use crate::summary::AlertSummary;
use crate::types::{ChangeEvent, RecordOutcome, SentinelHealth};

type AppState = Arc<Sentinel>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized")
    }
}

impl From<SentinelError> for ApiError {
    fn from(err: SentinelError) -> Self {
        let status = match err {
            SentinelError::InvalidEvent(_) => StatusCode::BAD_REQUEST,
            SentinelError::WarmUpTimeout(..) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(rejection.status(), rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "status": "error",
            "message": self.message,
        }));
        (self.status, body).into_response()
    }
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Check the bearer token against the configured secret. With no secret
/// configured every request is let through.
fn authorize(headers: &HeaderMap, secret: Option<&str>) -> Result<(), ApiError> {
    let Some(secret) = secret else {
        return Ok(());
    };
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    match token {
        Some(token) if constant_time_eq(token.as_bytes(), secret.as_bytes()) => Ok(()),
        _ => Err(ApiError::unauthorized()),
    }
}

fn authorize_state(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    authorize(headers, state.config().server.cron_secret.as_deref())
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn health_routes() -> Router {
    Router::new().route("/health", get(health_check))
}

pub fn sentinel_routes() -> Router<AppState> {
    Router::new()
        .route("/api/cron/sentinel", get(trigger_run))
        .route("/api/sentinel/summary", get(get_summary))
        .route("/api/sentinel/watersheds/{huc8}", get(get_watershed))
        .route("/api/sentinel/events", post(post_events))
        .route("/api/sentinel/sources/{source_id}/outcome", post(post_source_outcome))
}

pub fn router(sentinel: Arc<Sentinel>) -> Router {
    Router::new()
        .merge(sentinel_routes())
        .with_state(sentinel)
        .merge(health_routes())
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "sentinel"
    }))
}

async fn trigger_run(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<RunReport>), ApiError> {
    authorize_state(&state, &headers)?;
    let report = state.run_once().await;
    let status = match report.status {
        RunStatus::Error => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::OK,
    };
    Ok((status, Json(report)))
}

async fn get_summary(State(state): State<AppState>) -> Json<AlertSummary> {
    Json(state.summary(Utc::now()))
}

async fn get_watershed(
    State(state): State<AppState>,
    Path(huc8): Path<String>,
) -> Result<Json<WatershedDetail>, ApiError> {
    if !huc::is_valid_huc8(&huc8) {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("{:?} is not an 8-digit HUC", huc8),
        ));
    }
    Ok(Json(state.watershed(&huc8)))
}

#[derive(Debug, Deserialize)]
struct EventBatch {
    events: Vec<ChangeEvent>,
}

#[derive(Debug, Serialize)]
struct RejectedEvent {
    index: usize,
    error: String,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct EventBatchResult {
    accepted: usize,
    deduplicated: usize,
    outside_window: usize,
    rejected: Vec<RejectedEvent>,
}

async fn post_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<EventBatch>, JsonRejection>,
) -> Result<Json<EventBatchResult>, ApiError> {
    authorize_state(&state, &headers)?;
    let Json(batch) = body?;

    let mut result = EventBatchResult::default();
    for (index, event) in batch.events.into_iter().enumerate() {
        match state.record_event(event).await {
            Ok(RecordOutcome::Accepted) => result.accepted += 1,
            Ok(RecordOutcome::Deduplicated) => result.deduplicated += 1,
            Ok(RecordOutcome::OutsideWindow) => result.outside_window += 1,
            Err(SentinelError::InvalidEvent(msg)) => {
                result.rejected.push(RejectedEvent { index, error: msg });
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SourceOutcomeRequest {
    success: bool,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    at: Option<DateTime<Utc>>,
}

async fn post_source_outcome(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(source_id): Path<String>,
    body: Result<Json<SourceOutcomeRequest>, JsonRejection>,
) -> Result<Json<SentinelHealth>, ApiError> {
    authorize_state(&state, &headers)?;
    let Json(req) = body?;
    let health = state
        .report_source_outcome(
            &source_id,
            req.success,
            req.error_code,
            req.at.unwrap_or_else(Utc::now),
        )
        .await?;
    Ok(Json(health))
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Bind and serve until `shutdown` resolves.
pub async fn serve<F>(sentinel: Arc<Sentinel>, shutdown: F) -> Result<(), SentinelError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let bind = sentinel.config().server.bind.clone();
    if sentinel.config().server.cron_secret.is_none() {
        log::warn!("Sentinel: no cronSecret configured, trigger and ingestion endpoints are open");
    }

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .map_err(|e| SentinelError::Config(format!("cannot bind {}: {}", bind, e)))?;
    log::info!("Sentinel: listening on http://{}", bind);

    axum::serve(listener, router(sentinel))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| SentinelError::Internal(format!("server error: {}", e)))
}
