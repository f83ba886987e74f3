use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::error;

use crate::metrics::{
    INGEST_ITEMS_TOTAL, INGEST_LATENCY_SECONDS, ROWS_CREATED_TOTAL, VALIDATION_FAILURES_TOTAL,
};
use crate::processor::{ProcessOutcome, RuleProcessor};
use crate::store::TelemetryStore;
use crate::validate::{IngestItem, ItemErrors, Validator};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TelemetryStore>,
    pub validator: Arc<Validator>,
    pub processor: Arc<RuleProcessor>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/telemetry", post(ingest_telemetry))
        .route("/api/v1/telemetry", get(get_telemetry))
        .route("/api/v1/events/:id/ack", post(ack_event))
        .with_state(state)
}

/// Single object or array form of the inbound payload.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum IngestPayload {
    Batch(Vec<IngestItem>),
    Single(IngestItem),
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    /// Rows actually created; conflicting re-deliveries are absorbed and not
    /// counted.
    pub created: usize,
    /// Item index to item- or metric-level validation failures.
    pub errors: BTreeMap<usize, ItemErrors>,
    /// Rule evaluation outcomes per created row.
    pub results: Vec<ProcessOutcome>,
}

/// Ingest endpoint: validate, insert, evaluate rules per created row.
///
/// Validation failures come back in the structured error map with a 200, a
/// malformed body is axum's 4xx; neither is ever a bare 500.
async fn ingest_telemetry(
    State(state): State<AppState>,
    Json(payload): Json<IngestPayload>,
) -> Result<Json<IngestResponse>, AppError> {
    let items = match payload {
        IngestPayload::Single(item) => vec![item],
        IngestPayload::Batch(items) => items,
    };
    INGEST_ITEMS_TOTAL.inc_by(items.len() as f64);
    let start = Instant::now();

    let outcome = state.validator.validate_batch(&items).await?;
    VALIDATION_FAILURES_TOTAL.inc_by(outcome.errors.len() as f64);

    let created = state.store.insert_telemetry(&outcome.rows).await?;
    ROWS_CREATED_TOTAL.inc_by(created.len() as f64);

    let mut results = Vec::with_capacity(created.len());
    for row in &created {
        results.push(state.processor.run(row).await?);
    }

    INGEST_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());

    Ok(Json(IngestResponse {
        created: created.len(),
        errors: outcome.errors,
        results,
    }))
}

#[derive(Debug, Deserialize)]
pub struct TelemetryQuery {
    device_metric_id: i64,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct TelemetryResponse {
    pub data: Vec<crate::model::TelemetryRow>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

/// Windowed read API over stored telemetry, defaulting to the last hour.
async fn get_telemetry(
    State(state): State<AppState>,
    Query(params): Query<TelemetryQuery>,
) -> Result<Json<TelemetryResponse>, AppError> {
    let limit = params.limit.unwrap_or(100).min(1000);
    let offset = params.offset.unwrap_or(0);
    let end = params.end.unwrap_or_else(Utc::now);
    let start = params.start.unwrap_or(end - Duration::hours(1));

    let rows = state
        .store
        .window(params.device_metric_id, end, end - start)
        .await?;
    let total = rows.len();
    let data: Vec<_> = rows.into_iter().skip(offset).take(limit).collect();

    Ok(Json(TelemetryResponse {
        data,
        total,
        limit,
        offset,
    }))
}

/// Operator acknowledgement of an event, the one mutation events support.
async fn ack_event(
    State(state): State<AppState>,
    Path(event_id): Path<i64>,
) -> Result<StatusCode, AppError> {
    if state.store.acknowledge_event(event_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Ok(StatusCode::NOT_FOUND)
    }
}

struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!("API error: {}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Internal server error: {}", self.0),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
