//! Route handlers

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use snipbox::{LanguageSummary, PollSnapshot, RequestId, ServiceStats, Submission};
use tracing::debug;

use crate::AppState;
use crate::error::ApiError;
use crate::session::ClientSession;
use crate::sse::stream_events;

#[derive(Debug, Deserialize)]
pub struct ExecuteBody {
    pub language: String,
    pub source: String,
    #[serde(default)]
    pub stdin: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PollQuery {
    #[serde(default)]
    pub cursor: u64,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    /// First sequence number to deliver
    pub from: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    #[serde(flatten)]
    pub stats: ServiceStats,
}

/// POST /execute
pub async fn submit(
    State(state): State<AppState>,
    ClientSession(session): ClientSession,
    body: Result<Json<ExecuteBody>, JsonRejection>,
) -> Result<(StatusCode, Json<Submission>), ApiError> {
    let Json(body) = body.map_err(|rejection| body_rejected(&rejection, &state))?;
    let submission = state
        .gateway
        .submit(session, &body.language, body.source, body.stdin)?;
    Ok((StatusCode::ACCEPTED, Json(submission)))
}

/// GET /execute/{id}?cursor=N
pub async fn poll(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<PollQuery>,
) -> Result<Json<PollSnapshot>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.gateway.poll(&id, query.cursor)?))
}

/// GET /execute/{id}/events
pub async fn events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    // A reconnecting EventSource resumes after the last frame it saw
    let resume = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(|seq| seq + 1);
    let from = query.from.or(resume).unwrap_or(0);

    let subscription = state.gateway.subscribe(&id, from)?;
    debug!(request = %id, from, "streaming events");
    Ok(stream_events(subscription, state.keep_alive))
}

/// DELETE /execute/{id}
pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&id)?;
    state.gateway.cancel(&id)?;
    Ok(StatusCode::ACCEPTED)
}

/// GET /languages
pub async fn languages(State(state): State<AppState>) -> Json<Vec<LanguageSummary>> {
    Json(state.gateway.languages())
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        stats: state.gateway.stats(),
    })
}

fn body_rejected(rejection: &JsonRejection, state: &AppState) -> ApiError {
    if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return ApiError::BodyTooLarge {
            limit: state.gateway.request_body_limit(),
        };
    }
    ApiError::BadRequest(rejection.body_text())
}

fn parse_id(raw: &str) -> Result<RequestId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("'{raw}' is not a request id")))
}
