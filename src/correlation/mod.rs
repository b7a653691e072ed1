//! Correlation-ID scheme.
//!
//! # Identifiers
//! - `trace_id`: one end-user interaction across every hop; minted at the edge
//!   if absent and forwarded unchanged downstream.
//! - `request_id`: one HTTP call and its fan-out; `req-{micros}-{hex8}`.
//! - `span_id`: one measured operation; never propagated.
//!
//! # Data Flow
//! ```text
//! inbound headers → CorrelationContext::from_headers (generate missing IDs)
//!     → request extensions (handlers extract it)
//!     → outbound reqwest calls via PropagateExt::propagate
//!     → response headers via CorrelationContext::write_response_headers
//! ```

pub mod headers;
pub mod ids;

pub use headers::{
    CorrelationContext, PropagateExt, X_REQUEST_ID, X_SESSION_ID, X_SPAN_ID, X_TRACE_ID,
    X_USER_ID,
};
pub use ids::{new_request_id, new_span_id, new_trace_id};
