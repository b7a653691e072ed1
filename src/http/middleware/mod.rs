//! Request middleware.

pub mod tracing;

pub use self::tracing::{trace_requests, TracingState};
