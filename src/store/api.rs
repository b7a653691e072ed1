//! REST handlers for the central trace store.
//!
//! # Responsibilities
//! - Ingest spans, errors, logs and request summaries
//! - Serve filtered listings, reconstructed traces and dashboard aggregates
//!
//! # Design Decisions
//! - Every database call runs on the blocking pool via `blocking`
//! - Absent traces are `404`, never an empty success
//! - The instrumentation middleware is never mounted on these routes

use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::aggregate::{self, ErrorCount, ErrorStats, PerformanceBucket, ServiceSummary, SystemStats, TraceCount, ViolationStats};
use super::database::{BulkOutcome, TraceKey, TraceStore};
use super::query::{look_back, ErrorQuery, LogQuery, TraceQuery, Window};
use super::reconstruct::build_full_trace;
use crate::error::StoreError;
use crate::http::response::ApiError;
use crate::model::{ErrorCategory, ErrorEntry, FullTrace, LogRecord, RequestMetrics, Span};
use crate::observability::metrics;

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Run a store call on the blocking pool.
async fn blocking<T, F>(store: &TraceStore, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&TraceStore) -> Result<T, StoreError> + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
        .map_err(ApiError::from)
}

/// Routes served by `trace-mesh store`.
pub fn router(store: TraceStore) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/stats", get(system_stats))
        .route("/traces", post(create_span).get(list_spans))
        .route("/trace/{trace_id}", get(trace_spans))
        .route("/trace/{trace_id}/full", get(full_trace))
        .route("/request/{request_id}/full", get(full_request))
        .route("/errors", post(create_error).get(list_errors))
        .route("/errors/technical", get(technical_errors))
        .route("/errors/stats", get(errors_stats))
        .route("/security/violations", get(security_violations))
        .route("/security/violations/stats", get(security_violation_stats))
        .route("/logs", post(create_log).get(list_logs))
        .route("/logs/bulk", post(create_logs))
        .route("/logs/cleanup", delete(cleanup_logs))
        .route("/service-metrics", post(create_request_metrics).get(list_request_metrics))
        .route("/metrics/traces/count", get(traces_count))
        .route("/metrics/errors/count", get(errors_count))
        .route("/metrics/performance", get(performance))
        .route("/metrics/services/summary", get(services_summary))
        .with_state(store)
}

async fn root() -> Json<serde_json::Value> {
    Json(json!({
        "service": "trace-mesh store",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
    }))
}

async fn health(State(store): State<TraceStore>) -> Response {
    match blocking(&store, |s| s.ping()).await {
        Ok(()) => Json(json!({ "status": "healthy", "database": "connected" })).into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unhealthy", "database": e.0.to_string() })),
        )
            .into_response(),
    }
}

// ----- ingestion -----

async fn create_span(State(store): State<TraceStore>, Json(span): Json<Span>) -> ApiResult<serde_json::Value> {
    let write = blocking(&store, move |s| s.upsert_span(&span)).await?;
    metrics::record_ingested("span", 1);
    Ok(Json(json!({ "status": "ok", "result": write })))
}

async fn create_error(
    State(store): State<TraceStore>,
    Json(entry): Json<ErrorEntry>,
) -> ApiResult<serde_json::Value> {
    blocking(&store, move |s| s.insert_error(&entry)).await?;
    metrics::record_ingested("error", 1);
    Ok(Json(json!({ "status": "ok" })))
}

async fn create_log(
    State(store): State<TraceStore>,
    Json(record): Json<LogRecord>,
) -> ApiResult<serde_json::Value> {
    blocking(&store, move |s| s.insert_log(&record)).await?;
    metrics::record_ingested("log", 1);
    Ok(Json(json!({ "status": "ok" })))
}

#[derive(Debug, Serialize)]
struct BulkResponse {
    #[serde(flatten)]
    outcome: BulkOutcome,
    /// Seconds.
    processing_time: f64,
}

async fn create_logs(
    State(store): State<TraceStore>,
    Json(records): Json<Vec<LogRecord>>,
) -> ApiResult<BulkResponse> {
    let started = Instant::now();
    let outcome = blocking(&store, move |s| s.insert_logs(&records)).await?;
    metrics::record_ingested("log", outcome.inserted as u64);
    Ok(Json(BulkResponse {
        outcome,
        processing_time: started.elapsed().as_secs_f64(),
    }))
}

async fn create_request_metrics(
    State(store): State<TraceStore>,
    Json(summary): Json<RequestMetrics>,
) -> ApiResult<serde_json::Value> {
    blocking(&store, move |s| s.insert_request_metrics(&summary)).await?;
    metrics::record_ingested("metrics", 1);
    Ok(Json(json!({ "status": "ok" })))
}

#[derive(Debug, Deserialize)]
struct Cleanup {
    #[serde(default = "default_retention_days")]
    days: u32,
}

fn default_retention_days() -> u32 {
    30
}

async fn cleanup_logs(
    State(store): State<TraceStore>,
    Query(params): Query<Cleanup>,
) -> ApiResult<serde_json::Value> {
    let cutoff = look_back(Utc::now(), Duration::try_days(i64::from(params.days)), "days", params.days)?;
    let deleted = blocking(&store, move |s| s.delete_logs_before(cutoff)).await?;
    tracing::info!(deleted, days = params.days, "Old logs removed");
    Ok(Json(json!({ "deleted": deleted, "cutoff": cutoff })))
}

// ----- lookups and listings -----

async fn list_spans(State(store): State<TraceStore>, Query(query): Query<TraceQuery>) -> ApiResult<Vec<Span>> {
    let started = Instant::now();
    let spans = blocking(&store, move |s| s.query_spans(&query)).await?;
    metrics::record_query("traces", started);
    Ok(Json(spans))
}

async fn list_errors(
    State(store): State<TraceStore>,
    Query(query): Query<ErrorQuery>,
) -> ApiResult<Vec<ErrorEntry>> {
    let started = Instant::now();
    let errors = blocking(&store, move |s| s.query_errors(&query)).await?;
    metrics::record_query("errors", started);
    Ok(Json(errors))
}

async fn list_logs(State(store): State<TraceStore>, Query(query): Query<LogQuery>) -> ApiResult<Vec<LogRecord>> {
    let started = Instant::now();
    let logs = blocking(&store, move |s| s.query_logs(&query)).await?;
    metrics::record_query("logs", started);
    Ok(Json(logs))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PageParams {
    limit: Option<u32>,
    offset: Option<u32>,
}

async fn list_request_metrics(
    State(store): State<TraceStore>,
    Query(params): Query<PageParams>,
) -> ApiResult<Vec<RequestMetrics>> {
    let page = store.page(params.limit, params.offset);
    let summaries = blocking(&store, move |s| s.recent_request_metrics(page)).await?;
    Ok(Json(summaries))
}

async fn trace_spans(State(store): State<TraceStore>, Path(trace_id): Path<String>) -> ApiResult<Vec<Span>> {
    let key = TraceKey::Trace(trace_id);
    let spans = blocking(&store, move |s| {
        let spans = s.spans_for(&key)?;
        if spans.is_empty() {
            return Err(StoreError::NotFound(key.describe()));
        }
        Ok(spans)
    })
    .await?;
    Ok(Json(spans))
}

/// Load and reconstruct one trace or request.
pub fn load_full_trace(store: &TraceStore, key: &TraceKey) -> Result<FullTrace, StoreError> {
    let spans = store.spans_for(key)?;
    if spans.is_empty() {
        return Err(StoreError::NotFound(key.describe()));
    }
    let errors = store.errors_for(key)?;
    build_full_trace(&key.describe(), spans, errors)
}

async fn full_trace(State(store): State<TraceStore>, Path(trace_id): Path<String>) -> ApiResult<FullTrace> {
    let started = Instant::now();
    let key = TraceKey::Trace(trace_id);
    let trace = blocking(&store, move |s| load_full_trace(s, &key)).await?;
    metrics::record_query("trace_full", started);
    Ok(Json(trace))
}

async fn full_request(State(store): State<TraceStore>, Path(request_id): Path<String>) -> ApiResult<FullTrace> {
    let started = Instant::now();
    let key = TraceKey::Request(request_id);
    let trace = blocking(&store, move |s| load_full_trace(s, &key)).await?;
    metrics::record_query("request_full", started);
    Ok(Json(trace))
}

// ----- category views -----

async fn category_listing(
    store: &TraceStore,
    category: ErrorCategory,
    window: Window,
) -> Result<Vec<ErrorEntry>, ApiError> {
    let query = ErrorQuery {
        category: Some(category),
        service: window.service.clone(),
        error_type: window.error_type.clone(),
        start_date: Some(window.since(Utc::now())?),
        limit: window.limit,
        offset: window.offset,
        ..ErrorQuery::default()
    };
    blocking(store, move |s| s.query_errors(&query)).await
}

async fn security_violations(
    State(store): State<TraceStore>,
    Query(window): Query<Window>,
) -> ApiResult<Vec<ErrorEntry>> {
    Ok(Json(category_listing(&store, ErrorCategory::Security, window).await?))
}

async fn technical_errors(
    State(store): State<TraceStore>,
    Query(window): Query<Window>,
) -> ApiResult<Vec<ErrorEntry>> {
    Ok(Json(category_listing(&store, ErrorCategory::Technical, window).await?))
}

async fn security_violation_stats(
    State(store): State<TraceStore>,
    Query(window): Query<Window>,
) -> ApiResult<ViolationStats> {
    let since = window.since(Utc::now())?;
    let points = blocking(&store, move |s| {
        s.error_points(since, None, None, Some(ErrorCategory::Security))
    })
    .await?;
    Ok(Json(aggregate::violation_stats(&points)))
}

async fn errors_stats(State(store): State<TraceStore>, Query(window): Query<Window>) -> ApiResult<ErrorStats> {
    let since = window.since(Utc::now())?;
    let points = blocking(&store, move |s| s.error_points(since, None, None, None)).await?;
    Ok(Json(aggregate::error_stats(&points)))
}

// ----- dashboard aggregates -----

async fn traces_count(State(store): State<TraceStore>, Query(window): Query<Window>) -> ApiResult<Vec<TraceCount>> {
    let started = Instant::now();
    let since = window.since(Utc::now())?;
    let points = blocking(&store, move |s| {
        s.span_points(since, window.service.as_deref(), window.status)
    })
    .await?;
    metrics::record_query("traces_count", started);
    Ok(Json(aggregate::trace_counts(&points)))
}

async fn errors_count(State(store): State<TraceStore>, Query(window): Query<Window>) -> ApiResult<Vec<ErrorCount>> {
    let started = Instant::now();
    let since = window.since(Utc::now())?;
    let points = blocking(&store, move |s| {
        s.error_points(since, window.service.as_deref(), window.error_type.as_deref(), None)
    })
    .await?;
    metrics::record_query("errors_count", started);
    Ok(Json(aggregate::error_counts(&points)))
}

async fn performance(
    State(store): State<TraceStore>,
    Query(window): Query<Window>,
) -> ApiResult<Vec<PerformanceBucket>> {
    let started = Instant::now();
    let since = window.since(Utc::now())?;
    let points = blocking(&store, move |s| s.span_points(since, window.service.as_deref(), None)).await?;
    metrics::record_query("performance", started);
    Ok(Json(aggregate::performance(&points)))
}

async fn services_summary(
    State(store): State<TraceStore>,
    Query(window): Query<Window>,
) -> ApiResult<Vec<ServiceSummary>> {
    let since = window.since(Utc::now())?;
    let (spans, errors) = blocking(&store, move |s| {
        Ok((s.span_points(since, None, None)?, s.error_points(since, None, None, None)?))
    })
    .await?;
    Ok(Json(aggregate::services_summary(&spans, &errors)))
}

async fn system_stats(State(store): State<TraceStore>) -> ApiResult<SystemStats> {
    let now = Utc::now();
    let stats = blocking(&store, move |s| {
        let day_ago = now - Duration::hours(24);
        let total = s.count_logs()?;
        let logs = s.log_points(day_ago)?;
        let avg = s.average_request_duration(day_ago)?;
        Ok(aggregate::system_stats(total, &logs, avg, now))
    })
    .await?;
    Ok(Json(stats))
}
