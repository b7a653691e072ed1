//! Central trace store.
//!
//! # Data Flow
//! ```text
//! TelemetryClient (every service)
//!     → api.rs (POST /traces, /errors, /logs, /service-metrics)
//!     → database.rs (SQLite, span upsert keyed on span_id)
//!
//! dashboard / operator
//!     → api.rs (GET listings, /trace/{id}/full, /metrics/*)
//!     → database.rs (filtered reads)
//!     → reconstruct.rs | aggregate.rs (pure folds)
//! ```

pub mod aggregate;
pub mod api;
pub mod database;
pub mod query;
pub mod reconstruct;

pub use api::{load_full_trace, router};
pub use database::{BulkOutcome, SpanWrite, TraceKey, TraceStore};
pub use query::{ErrorQuery, LogQuery, Page, TraceQuery, Window};
pub use reconstruct::build_full_trace;
