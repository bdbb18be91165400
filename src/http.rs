use crate::error::SinkError;
use crate::ingest::{check_batch_fields, validate_items, ItemError, RawBatch, TimestampBounds};
use crate::registry::TargetRegistry;
use crate::sample::now_epoch;
use crate::sink::{SinkHandle, SinkStatusSnapshot};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;

#[derive(Clone)]
pub struct HttpState {
    pub registry: Arc<TargetRegistry>,
    pub sink: SinkHandle,
    pub bounds: TimestampBounds,
}

#[derive(Debug, Serialize)]
struct BatchResponse {
    accepted: usize,
    rejected: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    errors: Vec<ItemError>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    targets: usize,
    pollable_targets: usize,
    queue_capacity: usize,
    sink: SinkStatusSnapshot,
}

#[derive(Debug, Serialize)]
struct RefreshResponse {
    targets: usize,
}

async fn healthz() -> &'static str {
    "ok"
}

/// Accepts a sample batch, validates it and forwards the valid samples to
/// the sink. Item-level failures are reported alongside successes;
/// batch-level failures reject the request.
async fn post_batch(
    State(state): State<HttpState>,
    Json(payload): Json<RawBatch>,
) -> Result<Json<BatchResponse>, (StatusCode, String)> {
    let (host, timestamp) = check_batch_fields(&payload, now_epoch(), &state.bounds)
        .map_err(|err| (StatusCode::BAD_REQUEST, err.to_string()))?;

    let known = state.registry.lookup_parameters(&host).await;
    let outcome = validate_items(&payload.samples, &host, timestamp, known.as_ref());

    // Fail fast before enqueuing anything the queue cannot take.
    if state.sink.capacity() < outcome.samples.len() {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            SinkError::QueueFull.to_string(),
        ));
    }

    let mut accepted = 0usize;
    for sample in outcome.samples {
        match state.sink.try_enqueue(sample) {
            Ok(()) => accepted += 1,
            Err(err) => {
                tracing::warn!(host = %host, accepted, error = %err, "sink rejected batch mid-enqueue");
                return Err((StatusCode::SERVICE_UNAVAILABLE, err.to_string()));
            }
        }
    }

    if !outcome.rejected.is_empty() {
        tracing::debug!(
            host = %host,
            accepted,
            rejected = outcome.rejected.len(),
            "batch accepted with item rejections"
        );
    }
    Ok(Json(BatchResponse {
        accepted,
        rejected: outcome.rejected.len(),
        errors: outcome.rejected,
    }))
}

async fn get_status(State(state): State<HttpState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        targets: state.registry.target_count().await,
        pollable_targets: state.registry.pollable_count().await,
        queue_capacity: state.sink.capacity(),
        sink: state.sink.stats().snapshot(),
    })
}

async fn post_refresh(
    State(state): State<HttpState>,
) -> Result<Json<RefreshResponse>, (StatusCode, String)> {
    let targets = state.registry.refresh().await.map_err(|err| {
        tracing::error!(error = %err, "target refresh failed");
        (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    })?;
    Ok(Json(RefreshResponse { targets }))
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/collector/", post(post_batch))
        .route("/collector/status", get(get_status))
        .route("/collector/targets/refresh", post(post_refresh))
        .with_state(state)
}
