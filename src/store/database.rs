//! SQLite persistence for spans, errors, logs and request summaries.
//!
//! # Design Decisions
//! - Spans are keyed by `span_id`; the completion record of a span replaces
//!   its `running` record, and nothing replaces a finished span
//! - Errors, logs and request summaries are append-only
//! - Timestamps are stored as fixed-width RFC 3339 UTC text with microsecond
//!   precision, so text order is time order
//! - Methods block; async callers go through `spawn_blocking`

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::query::{ErrorQuery, Filter, LogQuery, Page, TraceQuery};
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::model::{
    ErrorCategory, ErrorEntry, LogLevel, LogRecord, RequestMetrics, RequestStatus, Span, SpanStatus,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS spans (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    trace_id TEXT NOT NULL,
    request_id TEXT NOT NULL,
    span_id TEXT NOT NULL UNIQUE,
    service TEXT NOT NULL,
    operation TEXT NOT NULL,
    start_time TEXT NOT NULL,
    end_time TEXT,
    duration REAL,
    status TEXT NOT NULL,
    error_message TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    user_id TEXT,
    session_id TEXT
);

CREATE TABLE IF NOT EXISTS errors (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    trace_id TEXT NOT NULL,
    request_id TEXT NOT NULL,
    span_id TEXT,
    service TEXT NOT NULL,
    error_type TEXT NOT NULL,
    error_message TEXT NOT NULL,
    stack_trace TEXT,
    context TEXT NOT NULL DEFAULT '{}',
    category TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    user_id TEXT,
    session_id TEXT
);

CREATE TABLE IF NOT EXISTS logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    level TEXT NOT NULL,
    service TEXT NOT NULL,
    message TEXT NOT NULL,
    trace_id TEXT,
    request_id TEXT,
    user_id TEXT,
    session_id TEXT,
    extra TEXT NOT NULL DEFAULT '{}',
    timestamp TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS service_metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    request_id TEXT NOT NULL,
    user_id TEXT,
    session_id TEXT,
    service_durations TEXT NOT NULL,
    total_duration REAL NOT NULL,
    status TEXT NOT NULL,
    completed_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_spans_trace_id ON spans(trace_id, start_time);
CREATE INDEX IF NOT EXISTS idx_spans_request_id ON spans(request_id, start_time);
CREATE INDEX IF NOT EXISTS idx_spans_start_time ON spans(start_time);
CREATE INDEX IF NOT EXISTS idx_errors_trace_id ON errors(trace_id);
CREATE INDEX IF NOT EXISTS idx_errors_request_id ON errors(request_id);
CREATE INDEX IF NOT EXISTS idx_errors_timestamp ON errors(timestamp);
CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);
CREATE INDEX IF NOT EXISTS idx_service_metrics_completed_at ON service_metrics(completed_at);
"#;

const SPAN_COLUMNS: &str = "trace_id, request_id, span_id, service, operation, start_time, \
     end_time, duration, status, error_message, metadata, user_id, session_id";

const ERROR_COLUMNS: &str = "trace_id, request_id, span_id, service, error_type, error_message, \
     stack_trace, context, category, timestamp, user_id, session_id";

const LOG_COLUMNS: &str =
    "level, service, message, trace_id, request_id, user_id, session_id, extra, timestamp";

/// What happened to an ingested span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanWrite {
    Inserted,
    Updated,
    /// A finished span with this `span_id` already exists.
    Ignored,
}

/// Result of a bulk log insert.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BulkOutcome {
    pub inserted: usize,
    pub errors: usize,
}

/// Which identifier a trace lookup is keyed on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceKey {
    Trace(String),
    Request(String),
}

impl TraceKey {
    fn column(&self) -> &'static str {
        match self {
            TraceKey::Trace(_) => "trace_id",
            TraceKey::Request(_) => "request_id",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            TraceKey::Trace(id) | TraceKey::Request(id) => id,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            TraceKey::Trace(id) => format!("trace {id}"),
            TraceKey::Request(id) => format!("request {id}"),
        }
    }
}

/// Aggregate-friendly projection of a span.
#[derive(Debug, Clone, PartialEq)]
pub struct SpanPoint {
    pub start_time: DateTime<Utc>,
    pub service: String,
    pub operation: String,
    pub status: SpanStatus,
    pub duration: Option<f64>,
}

/// Aggregate-friendly projection of an error.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorPoint {
    pub timestamp: DateTime<Utc>,
    pub service: String,
    pub error_type: String,
    pub category: ErrorCategory,
}

/// Aggregate-friendly projection of a log record.
#[derive(Debug, Clone, PartialEq)]
pub struct LogPoint {
    pub timestamp: DateTime<Utc>,
    pub service: String,
    pub level: LogLevel,
}

/// Handle to the trace database. Cheap to clone.
#[derive(Clone)]
pub struct TraceStore {
    conn: Arc<Mutex<Connection>>,
    default_page_size: u32,
    max_page_size: u32,
}

pub(crate) fn encode_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error(idx: usize, err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

fn ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn opt_ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(_) => ts_column(row, idx).map(Some),
        None => Ok(None),
    }
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn enum_column<T>(row: &Row<'_>, idx: usize, parse: impl Fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| conversion_error(idx, format!("unexpected value '{raw}'")))
}

fn read_span(row: &Row<'_>) -> rusqlite::Result<Span> {
    Ok(Span {
        trace_id: row.get(0)?,
        request_id: row.get(1)?,
        span_id: row.get(2)?,
        service: row.get(3)?,
        operation: row.get(4)?,
        start_time: ts_column(row, 5)?,
        end_time: opt_ts_column(row, 6)?,
        duration: row.get(7)?,
        status: enum_column(row, 8, SpanStatus::parse)?,
        error_message: row.get(9)?,
        metadata: json_column(row, 10)?,
        user_id: row.get(11)?,
        session_id: row.get(12)?,
    })
}

fn read_error(row: &Row<'_>) -> rusqlite::Result<ErrorEntry> {
    Ok(ErrorEntry {
        trace_id: row.get(0)?,
        request_id: row.get(1)?,
        span_id: row.get(2)?,
        service: row.get(3)?,
        error_type: row.get(4)?,
        error_message: row.get(5)?,
        stack_trace: row.get(6)?,
        context: json_column(row, 7)?,
        category: enum_column(row, 8, ErrorCategory::parse)?,
        timestamp: ts_column(row, 9)?,
        user_id: row.get(10)?,
        session_id: row.get(11)?,
    })
}

fn read_log(row: &Row<'_>) -> rusqlite::Result<LogRecord> {
    Ok(LogRecord {
        level: enum_column(row, 0, LogLevel::parse)?,
        service: row.get(1)?,
        message: row.get(2)?,
        trace_id: row.get(3)?,
        request_id: row.get(4)?,
        user_id: row.get(5)?,
        session_id: row.get(6)?,
        extra: json_column(row, 7)?,
        timestamp: ts_column(row, 8)?,
    })
}

fn read_metrics(row: &Row<'_>) -> rusqlite::Result<RequestMetrics> {
    Ok(RequestMetrics {
        request_id: row.get(0)?,
        user_id: row.get(1)?,
        session_id: row.get(2)?,
        service_durations: json_column(row, 3)?,
        total_duration: row.get(4)?,
        status: enum_column(row, 5, RequestStatus::parse)?,
        completed_at: ts_column(row, 6)?,
    })
}

impl TraceStore {
    /// Open or create the store described by `config`.
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        let conn = if config.database_path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            let path = Path::new(&config.database_path);
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Task(format!("create {}: {e}", parent.display())))?;
            }
            let conn = Connection::open(path)?;
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
            conn
        };
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        conn.execute_batch(SCHEMA)?;

        tracing::info!(path = %config.database_path, "Trace store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            default_page_size: config.default_page_size,
            max_page_size: config.max_page_size,
        })
    }

    /// Private in-memory store, for tests and embedding.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::open(&StoreConfig {
            database_path: ":memory:".to_string(),
            ..StoreConfig::default()
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn page(&self, limit: Option<u32>, offset: Option<u32>) -> Page {
        Page::resolve(limit, offset, self.default_page_size, self.max_page_size)
    }

    /// Liveness probe for the health endpoint.
    pub fn ping(&self) -> Result<(), StoreError> {
        self.conn().query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    // ----- ingestion -----

    /// Insert a span, or complete the stored `running` record with the same `span_id`.
    pub fn upsert_span(&self, span: &Span) -> Result<SpanWrite, StoreError> {
        span.validate().map_err(StoreError::InvalidRecord)?;
        let metadata = serde_json::to_string(&span.metadata)?;
        let conn = self.conn();

        let existed: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM spans WHERE span_id = ?1)",
            params![span.span_id],
            |row| row.get(0),
        )?;

        let changed = conn.execute(
            "INSERT INTO spans (trace_id, request_id, span_id, service, operation, start_time,
                                end_time, duration, status, error_message, metadata, user_id, session_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(span_id) DO UPDATE SET
                 end_time = excluded.end_time,
                 duration = excluded.duration,
                 status = excluded.status,
                 error_message = excluded.error_message,
                 metadata = excluded.metadata,
                 user_id = COALESCE(excluded.user_id, spans.user_id),
                 session_id = COALESCE(excluded.session_id, spans.session_id)
             WHERE spans.status = 'running'",
            params![
                span.trace_id,
                span.request_id,
                span.span_id,
                span.service,
                span.operation,
                encode_ts(&span.start_time),
                span.end_time.as_ref().map(encode_ts),
                span.duration,
                span.status.as_str(),
                span.error_message,
                metadata,
                span.user_id,
                span.session_id,
            ],
        )?;

        Ok(match (existed, changed) {
            (false, _) => SpanWrite::Inserted,
            (true, 0) => SpanWrite::Ignored,
            (true, _) => SpanWrite::Updated,
        })
    }

    pub fn insert_error(&self, entry: &ErrorEntry) -> Result<(), StoreError> {
        entry.validate().map_err(StoreError::InvalidRecord)?;
        let context = serde_json::to_string(&entry.context)?;
        self.conn().execute(
            &format!("INSERT INTO errors ({ERROR_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"),
            params![
                entry.trace_id,
                entry.request_id,
                entry.span_id,
                entry.service,
                entry.error_type,
                entry.error_message,
                entry.stack_trace,
                context,
                entry.category.as_str(),
                encode_ts(&entry.timestamp),
                entry.user_id,
                entry.session_id,
            ],
        )?;
        Ok(())
    }

    pub fn insert_log(&self, record: &LogRecord) -> Result<(), StoreError> {
        let conn = self.conn();
        insert_log_with(&conn, record)
    }

    /// Insert many logs in one transaction. Records that fail to insert are
    /// counted and skipped.
    pub fn insert_logs(&self, records: &[LogRecord]) -> Result<BulkOutcome, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut outcome = BulkOutcome { inserted: 0, errors: 0 };
        for record in records {
            match insert_log_with(&tx, record) {
                Ok(()) => outcome.inserted += 1,
                Err(e) => {
                    tracing::warn!(error = %e, service = %record.service, "Skipping log record");
                    outcome.errors += 1;
                }
            }
        }
        tx.commit()?;
        Ok(outcome)
    }

    pub fn insert_request_metrics(&self, summary: &RequestMetrics) -> Result<(), StoreError> {
        if summary.request_id.is_empty() {
            return Err(StoreError::InvalidRecord("request_id must not be empty".into()));
        }
        let durations = serde_json::to_string(&summary.service_durations)?;
        self.conn().execute(
            "INSERT INTO service_metrics
             (request_id, user_id, session_id, service_durations, total_duration, status, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                summary.request_id,
                summary.user_id,
                summary.session_id,
                durations,
                summary.total_duration,
                summary.status.as_str(),
                encode_ts(&summary.completed_at),
            ],
        )?;
        Ok(())
    }

    /// Delete logs older than `cutoff`. Returns how many were removed.
    pub fn delete_logs_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        Ok(self
            .conn()
            .execute("DELETE FROM logs WHERE timestamp < ?1", params![encode_ts(&cutoff)])?)
    }

    // ----- lookups -----

    /// Every span for one trace or request, ordered by start time.
    pub fn spans_for(&self, key: &TraceKey) -> Result<Vec<Span>, StoreError> {
        let sql = format!(
            "SELECT {SPAN_COLUMNS} FROM spans WHERE {} = ?1 ORDER BY start_time ASC, id ASC",
            key.column()
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let spans = stmt
            .query_map(params![key.id()], read_span)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(spans)
    }

    /// Every error for one trace or request, ordered by timestamp.
    pub fn errors_for(&self, key: &TraceKey) -> Result<Vec<ErrorEntry>, StoreError> {
        let sql = format!(
            "SELECT {ERROR_COLUMNS} FROM errors WHERE {} = ?1 ORDER BY timestamp ASC, id ASC",
            key.column()
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let errors = stmt
            .query_map(params![key.id()], read_error)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(errors)
    }

    // ----- listings -----

    pub fn query_spans(&self, query: &TraceQuery) -> Result<Vec<Span>, StoreError> {
        let mut filter = Filter::default();
        filter
            .eq("trace_id", query.trace_id.as_deref())
            .eq("request_id", query.request_id.as_deref())
            .eq("service", query.service.as_deref())
            .contains("operation", query.operation.as_deref())
            .eq("status", query.status.as_ref().map(SpanStatus::as_str))
            .eq("user_id", query.user_id.as_deref())
            .eq("session_id", query.session_id.as_deref())
            .at_least("start_time", query.start_date)
            .at_most("start_time", query.end_date);
        let page = self.page(query.limit, query.offset);
        self.select(
            &format!("SELECT {SPAN_COLUMNS} FROM spans"),
            filter,
            "start_time DESC, id DESC",
            page,
            read_span,
        )
    }

    pub fn query_errors(&self, query: &ErrorQuery) -> Result<Vec<ErrorEntry>, StoreError> {
        let mut filter = Filter::default();
        filter
            .eq("trace_id", query.trace_id.as_deref())
            .eq("request_id", query.request_id.as_deref())
            .eq("service", query.service.as_deref())
            .eq("error_type", query.error_type.as_deref())
            .eq("category", query.category.as_ref().map(ErrorCategory::as_str))
            .eq("user_id", query.user_id.as_deref())
            .eq("session_id", query.session_id.as_deref())
            .at_least("timestamp", query.start_date)
            .at_most("timestamp", query.end_date);
        let page = self.page(query.limit, query.offset);
        self.select(
            &format!("SELECT {ERROR_COLUMNS} FROM errors"),
            filter,
            "timestamp DESC, id DESC",
            page,
            read_error,
        )
    }

    pub fn query_logs(&self, query: &LogQuery) -> Result<Vec<LogRecord>, StoreError> {
        let mut filter = Filter::default();
        filter
            .eq("service", query.service.as_deref())
            .eq("level", query.level.as_ref().map(LogLevel::as_str))
            .eq("trace_id", query.trace_id.as_deref())
            .eq("request_id", query.request_id.as_deref())
            .eq("user_id", query.user_id.as_deref())
            .eq("session_id", query.session_id.as_deref())
            .at_least("timestamp", query.start_date)
            .at_most("timestamp", query.end_date);
        let page = self.page(query.limit, query.offset);
        self.select(
            &format!("SELECT {LOG_COLUMNS} FROM logs"),
            filter,
            "timestamp DESC, id DESC",
            page,
            read_log,
        )
    }

    /// Most recent completed-request summaries first.
    pub fn recent_request_metrics(&self, page: Page) -> Result<Vec<RequestMetrics>, StoreError> {
        self.select(
            "SELECT request_id, user_id, session_id, service_durations, total_duration, status, completed_at
             FROM service_metrics",
            Filter::default(),
            "completed_at DESC, id DESC",
            page,
            read_metrics,
        )
    }

    fn select<T>(
        &self,
        base: &str,
        filter: Filter,
        order: &str,
        page: Page,
        read: fn(&Row<'_>) -> rusqlite::Result<T>,
    ) -> Result<Vec<T>, StoreError> {
        let sql = format!(
            "{base}{} ORDER BY {order} LIMIT {} OFFSET {}",
            filter.where_clause(),
            page.limit,
            page.offset
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(filter.into_values()), read)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ----- aggregate inputs -----

    /// Span projections started at or after `since`, optionally narrowed.
    pub fn span_points(
        &self,
        since: DateTime<Utc>,
        service: Option<&str>,
        status: Option<SpanStatus>,
    ) -> Result<Vec<SpanPoint>, StoreError> {
        let mut filter = Filter::default();
        filter
            .at_least("start_time", Some(since))
            .eq("service", service)
            .eq("status", status.as_ref().map(SpanStatus::as_str));
        let sql = format!(
            "SELECT start_time, service, operation, status, duration FROM spans{} ORDER BY start_time ASC, id ASC",
            filter.where_clause()
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let points = stmt
            .query_map(params_from_iter(filter.into_values()), |row| {
                Ok(SpanPoint {
                    start_time: ts_column(row, 0)?,
                    service: row.get(1)?,
                    operation: row.get(2)?,
                    status: enum_column(row, 3, SpanStatus::parse)?,
                    duration: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(points)
    }

    /// Error projections at or after `since`, optionally narrowed.
    pub fn error_points(
        &self,
        since: DateTime<Utc>,
        service: Option<&str>,
        error_type: Option<&str>,
        category: Option<ErrorCategory>,
    ) -> Result<Vec<ErrorPoint>, StoreError> {
        let mut filter = Filter::default();
        filter
            .at_least("timestamp", Some(since))
            .eq("service", service)
            .eq("error_type", error_type)
            .eq("category", category.as_ref().map(ErrorCategory::as_str));
        let sql = format!(
            "SELECT timestamp, service, error_type, category FROM errors{} ORDER BY timestamp ASC, id ASC",
            filter.where_clause()
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let points = stmt
            .query_map(params_from_iter(filter.into_values()), |row| {
                Ok(ErrorPoint {
                    timestamp: ts_column(row, 0)?,
                    service: row.get(1)?,
                    error_type: row.get(2)?,
                    category: enum_column(row, 3, ErrorCategory::parse)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(points)
    }

    /// Log projections at or after `since`.
    pub fn log_points(&self, since: DateTime<Utc>) -> Result<Vec<LogPoint>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT timestamp, service, level FROM logs WHERE timestamp >= ?1 ORDER BY timestamp ASC",
        )?;
        let points = stmt
            .query_map(params![encode_ts(&since)], |row| {
                Ok(LogPoint {
                    timestamp: ts_column(row, 0)?,
                    service: row.get(1)?,
                    level: enum_column(row, 2, LogLevel::parse)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(points)
    }

    pub fn count_logs(&self) -> Result<u64, StoreError> {
        let count: i64 = self.conn().query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    /// Mean `total_duration` (ms) of request summaries completed since `since`.
    pub fn average_request_duration(&self, since: DateTime<Utc>) -> Result<Option<f64>, StoreError> {
        let avg: Option<f64> = self.conn().query_row(
            "SELECT AVG(total_duration) FROM service_metrics WHERE completed_at >= ?1",
            params![encode_ts(&since)],
            |row| row.get(0),
        )?;
        Ok(avg)
    }
}

fn insert_log_with(conn: &Connection, record: &LogRecord) -> Result<(), StoreError> {
    if record.service.is_empty() {
        return Err(StoreError::InvalidRecord("service must not be empty".into()));
    }
    let extra = serde_json::to_string(&record.extra)?;
    conn.execute(
        &format!("INSERT INTO logs ({LOG_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
        params![
            record.level.as_str(),
            record.service,
            record.message,
            record.trace_id,
            record.request_id,
            record.user_id,
            record.session_id,
            extra,
            encode_ts(&record.timestamp),
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::CorrelationContext;
    use crate::model::Attributes;
    use chrono::Duration as ChronoDuration;

    fn ctx() -> CorrelationContext {
        CorrelationContext::detached().with_identity(Some("u1".into()), Some("s1".into()))
    }

    #[test]
    fn test_running_then_success_collapses_to_one_row() {
        let store = TraceStore::open_in_memory().unwrap();
        let ctx = ctx();
        let mut span = Span::start(&ctx, "api-gateway", "POST /chat").with_metadata("method", "POST");

        assert_eq!(store.upsert_span(&span).unwrap(), SpanWrite::Inserted);
        span.succeed();
        span = span.with_metadata("status_code", 200);
        assert_eq!(store.upsert_span(&span).unwrap(), SpanWrite::Updated);

        let spans = store.spans_for(&TraceKey::Trace(ctx.trace_id.clone())).unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].status, SpanStatus::Success);
        assert_eq!(spans[0].metadata["status_code"], 200);
    }

    #[test]
    fn test_late_running_record_never_downgrades() {
        let store = TraceStore::open_in_memory().unwrap();
        let ctx = ctx();
        let running = Span::start(&ctx, "rag-service", "POST /search");
        let mut done = running.clone();
        done.fail("index unavailable");

        store.upsert_span(&done).unwrap();
        assert_eq!(store.upsert_span(&running).unwrap(), SpanWrite::Ignored);

        let spans = store.spans_for(&TraceKey::Request(ctx.request_id.clone())).unwrap();
        assert_eq!(spans[0].status, SpanStatus::Error);
        assert_eq!(spans[0].error_message.as_deref(), Some("index unavailable"));
    }

    #[test]
    fn test_invalid_span_is_rejected() {
        let store = TraceStore::open_in_memory().unwrap();
        let mut span = Span::start(&ctx(), "api-gateway", "GET /");
        span.status = SpanStatus::Error;
        assert!(matches!(store.upsert_span(&span), Err(StoreError::InvalidRecord(_))));
    }

    #[test]
    fn test_timestamps_round_trip_with_microseconds() {
        let store = TraceStore::open_in_memory().unwrap();
        let span = Span::start(&ctx(), "api-gateway", "GET /chat");
        store.upsert_span(&span).unwrap();
        let stored = &store.spans_for(&TraceKey::Trace(span.trace_id.clone())).unwrap()[0];
        assert_eq!(
            stored.start_time.timestamp_micros(),
            span.start_time.timestamp_micros()
        );
    }

    #[test]
    fn test_query_spans_filters_and_pages() {
        let store = TraceStore::open_in_memory().unwrap();
        for i in 0..5 {
            let ctx = ctx();
            let service = if i % 2 == 0 { "api-gateway" } else { "rag-service" };
            let mut span = Span::start(&ctx, service, format!("GET /chat/{i}"));
            span.succeed();
            store.upsert_span(&span).unwrap();
        }

        let gateway = store
            .query_spans(&TraceQuery {
                service: Some("api-gateway".into()),
                ..TraceQuery::default()
            })
            .unwrap();
        assert_eq!(gateway.len(), 3);
        assert!(gateway[0].start_time >= gateway[2].start_time);

        let page = store
            .query_spans(&TraceQuery {
                limit: Some(2),
                offset: Some(1),
                ..TraceQuery::default()
            })
            .unwrap();
        assert_eq!(page.len(), 2);

        let by_operation = store
            .query_spans(&TraceQuery {
                operation: Some("CHAT/3".into()),
                ..TraceQuery::default()
            })
            .unwrap();
        assert_eq!(by_operation.len(), 1);
    }

    #[test]
    fn test_query_errors_by_category_and_time() {
        let store = TraceStore::open_in_memory().unwrap();
        let ctx = ctx();
        store
            .insert_error(&ErrorEntry::new(&ctx, "security-service", "AuthenticationError", "token expired"))
            .unwrap();
        store
            .insert_error(&ErrorEntry::new(&ctx, "rag-service", "ValueError", "division by zero"))
            .unwrap();

        let security = store
            .query_errors(&ErrorQuery {
                category: Some(ErrorCategory::Security),
                ..ErrorQuery::default()
            })
            .unwrap();
        assert_eq!(security.len(), 1);
        assert_eq!(security[0].service, "security-service");

        let future = store
            .query_errors(&ErrorQuery {
                start_date: Some(Utc::now() + ChronoDuration::hours(1)),
                ..ErrorQuery::default()
            })
            .unwrap();
        assert!(future.is_empty());
    }

    #[test]
    fn test_bulk_logs_count_failures() {
        let store = TraceStore::open_in_memory().unwrap();
        let good = LogRecord::new(LogLevel::Info, "api-gateway", "started");
        let bad = LogRecord::new(LogLevel::Error, "", "no service");
        let outcome = store.insert_logs(&[good.clone(), bad, good]).unwrap();
        assert_eq!(outcome, BulkOutcome { inserted: 2, errors: 1 });

        let errors = store
            .query_logs(&LogQuery {
                level: Some(LogLevel::Info),
                ..LogQuery::default()
            })
            .unwrap();
        assert_eq!(errors.len(), 2);
        assert_eq!(store.count_logs().unwrap(), 2);
    }

    #[test]
    fn test_delete_old_logs() {
        let store = TraceStore::open_in_memory().unwrap();
        let mut old = LogRecord::new(LogLevel::Info, "api-gateway", "old");
        old.timestamp = Utc::now() - ChronoDuration::days(40);
        store.insert_log(&old).unwrap();
        store.insert_log(&LogRecord::new(LogLevel::Info, "api-gateway", "new")).unwrap();

        let removed = store.delete_logs_before(Utc::now() - ChronoDuration::days(30)).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.count_logs().unwrap(), 1);
    }

    #[test]
    fn test_request_metrics_round_trip_order() {
        let store = TraceStore::open_in_memory().unwrap();
        for (i, status) in [RequestStatus::Success, RequestStatus::Incomplete].into_iter().enumerate() {
            store
                .insert_request_metrics(&RequestMetrics {
                    request_id: format!("req-{i}"),
                    user_id: None,
                    session_id: None,
                    service_durations: [("api-gateway".to_string(), 12.5)].into_iter().collect(),
                    total_duration: 20.0,
                    status,
                    completed_at: Utc::now() + ChronoDuration::milliseconds(i as i64),
                })
                .unwrap();
        }
        let recent = store.recent_request_metrics(store.page(None, None)).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].status, RequestStatus::Incomplete);
        assert_eq!(recent[0].service_durations["api-gateway"], 12.5);
        assert_eq!(store.average_request_duration(Utc::now() - ChronoDuration::hours(1)).unwrap(), Some(20.0));
    }

    #[test]
    fn test_file_backed_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            database_path: dir.path().join("nested/traces.db").display().to_string(),
            ..StoreConfig::default()
        };
        let store = TraceStore::open(&config).unwrap();
        store.ping().unwrap();
        let entry = ErrorEntry::new(&ctx(), "api-gateway", "KeyError", "'x'")
            .with_context(Attributes::new());
        store.insert_error(&entry).unwrap();
        drop(store);

        let reopened = TraceStore::open(&config).unwrap();
        let key = TraceKey::Trace(entry.trace_id.clone());
        assert_eq!(reopened.errors_for(&key).unwrap().len(), 1);
    }
}
