//! HTTP surface over the event log.
//!
//! | Route                              | Effect                                  |
//! |------------------------------------|-----------------------------------------|
//! | `GET /health`                      | `ok`                                    |
//! | `GET /api/passes/{gate}`           | today's records as a JSON array         |
//! | `GET /api/passes/{gate}/stream`    | live event stream of new records        |
//! | `POST /api/passes/{gate}`          | append one pass, 201 + stored record    |
//! | `DELETE /api/passes/{gate}`        | clear today's partition, 204            |
//!
//! Handlers stay thin: normalisation comes from the ingestion crate and
//! every file operation runs on the blocking pool.

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{Method, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use futures::{Stream, StreamExt};
use rallytime_ingest::normalize_pass;
use rallytime_log::{spawn_tail, EventLog, LogError, TailEvent, TailOptions};
use rallytime_protocol::defaults::READY_BODY;
use rallytime_protocol::{GateId, LogRecord, PartitionKey};
use serde::Serialize;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info};

#[derive(Clone)]
pub struct AppState {
    log: Arc<EventLog>,
    tail: TailOptions,
    retry_hint: Duration,
}

impl AppState {
    pub fn new(log: Arc<EventLog>, tail: TailOptions, retry_hint: Duration) -> Self {
        Self {
            log,
            tail,
            retry_hint,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/api/passes/{gate}",
            get(snapshot).post(append).delete(clear),
        )
        .route("/api/passes/{gate}/stream", get(stream))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::DELETE])
                .allow_headers(Any),
        )
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(state: AppState, bind: &str, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    info!("HTTP listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server failed")?;
    Ok(())
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorPayload,
}

#[derive(Debug, Serialize)]
struct ErrorPayload {
    code: &'static str,
    message: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn invalid_gate(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "invalid_gate",
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal_error",
            message: message.into(),
        }
    }
}

impl From<LogError> for ApiError {
    fn from(e: LogError) -> Self {
        error!("Storage failure: {}", e);
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "storage_error",
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorPayload {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn today(gate: &str) -> Result<PartitionKey, ApiError> {
    let gate = GateId::parse(gate).map_err(|e| ApiError::invalid_gate(e.to_string()))?;
    Ok(PartitionKey::today(gate))
}

/// Run a log operation on the blocking pool.
async fn blocking<T, F>(state: &AppState, op: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&EventLog) -> rallytime_log::Result<T> + Send + 'static,
{
    let log = Arc::clone(&state.log);
    tokio::task::spawn_blocking(move || op(&log))
        .await
        .map_err(|e| ApiError::internal(format!("Storage task failed: {}", e)))?
        .map_err(ApiError::from)
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> &'static str {
    "ok"
}

async fn snapshot(
    State(state): State<AppState>,
    Path(gate): Path<String>,
) -> Result<Json<Vec<LogRecord>>, ApiError> {
    let key = today(&gate)?;
    let records = blocking(&state, move |log| log.read_all(&key)).await?;
    Ok(Json(records))
}

async fn append(
    State(state): State<AppState>,
    Path(gate): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<LogRecord>), ApiError> {
    let key = today(&gate)?;
    let record = normalize_pass(&key.gate_id, &body, Utc::now());
    let stored = record.clone();
    blocking(&state, move |log| log.append(&key, &record)).await?;
    debug!("Appended pass for {} via HTTP", stored.gate_id);
    Ok((StatusCode::CREATED, Json(stored)))
}

async fn clear(
    State(state): State<AppState>,
    Path(gate): Path<String>,
) -> Result<StatusCode, ApiError> {
    let key = today(&gate)?;
    let cleared = key.clone();
    blocking(&state, move |log| log.truncate(&key)).await?;
    info!("Cleared {} via HTTP", cleared);
    Ok(StatusCode::NO_CONTENT)
}

async fn stream(
    State(state): State<AppState>,
    Path(gate): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let key = today(&gate)?;
    let subscription = spawn_tail(Arc::clone(&state.log), key, state.tail)?;
    let retry = state.retry_hint;

    // Dropping the body (client gone) drops the subscription, which stops the tail task.
    let events = subscription
        .into_stream()
        .map(move |event| Ok(stream_event(event, retry)));
    Ok(Sse::new(events))
}

/// One tail event as a stream frame. Data carries the raw record line.
fn stream_event(event: TailEvent, retry: Duration) -> Event {
    match event {
        TailEvent::Ready => Event::default()
            .retry(retry)
            .event("ready")
            .data(READY_BODY),
        TailEvent::Line(line) => Event::default().data(frame_text(&line)),
        TailEvent::Error(message) => Event::default().event("error").data(frame_text(&message)),
    }
}

/// Frame fields may not carry carriage returns; a trailing newline would add an empty data line.
fn frame_text(text: &str) -> String {
    text.trim_end_matches(['\r', '\n']).replace('\r', "")
}
