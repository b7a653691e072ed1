//! Reconstructed trace views. Computed on read, never persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Attributes, ErrorCategory, ErrorEntry, Span, SpanStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceStatus {
    Success,
    Error,
}

/// One hop of a trace, as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanSummary {
    pub service: String,
    pub operation: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration: Option<f64>,
    pub status: SpanStatus,
    pub error_message: Option<String>,
    pub metadata: Attributes,
}

impl From<&Span> for SpanSummary {
    fn from(span: &Span) -> Self {
        Self {
            service: span.service.clone(),
            operation: span.operation.clone(),
            start_time: span.start_time,
            end_time: span.end_time,
            duration: span.duration,
            status: span.status,
            error_message: span.error_message.clone(),
            metadata: span.metadata.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub service: String,
    pub error_type: String,
    pub error_message: String,
    pub category: ErrorCategory,
    pub timestamp: DateTime<Utc>,
    pub stack_trace: Option<String>,
    pub context: Attributes,
}

impl From<&ErrorEntry> for ErrorSummary {
    fn from(entry: &ErrorEntry) -> Self {
        Self {
            service: entry.service.clone(),
            error_type: entry.error_type.clone(),
            error_message: entry.error_message.clone(),
            category: entry.category,
            timestamp: entry.timestamp,
            stack_trace: entry.stack_trace.clone(),
            context: entry.context.clone(),
        }
    }
}

/// Every span and error of one trace (or one request), joined and ordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullTrace {
    pub request_id: String,
    pub trace_id: String,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Milliseconds; absent while no span has finished.
    pub total_duration: Option<f64>,
    pub status: TraceStatus,
    pub services_path: Vec<SpanSummary>,
    pub errors: Vec<ErrorSummary>,
}
