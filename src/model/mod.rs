//! Telemetry data model.
//!
//! # Records
//! - `Span`: one timed operation in one service (mutable once, at completion)
//! - `ErrorEntry`: a detailed failure record with a security/technical category
//! - `LogRecord`: a log line shipped out of process
//! - `RequestMetrics`: the per-request summary emitted on completion detection
//! - `FullTrace`: the read-only reconstruction of one trace or request
//!
//! Timestamps are UTC. Span durations are seconds; trace durations are
//! milliseconds, matching what the dashboard consumes.

pub mod error_entry;
pub mod log;
pub mod metrics;
pub mod span;
pub mod trace;

use std::collections::BTreeMap;

/// Free-form key/value attributes. Ordered so serialised records are stable.
pub type Attributes = BTreeMap<String, serde_json::Value>;

pub use error_entry::{ErrorCategory, ErrorEntry};
pub use log::{LogLevel, LogRecord};
pub use metrics::{RequestMetrics, RequestStatus};
pub use span::{Span, SpanStatus};
pub use trace::{ErrorSummary, FullTrace, SpanSummary, TraceStatus};
