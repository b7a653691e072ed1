//! HTTP surface of both service modes.
//!
//! # Data Flow
//! ```text
//! sidecar:
//!     inbound call
//!         → middleware/tracing.rs (IDs, span, tracker, error capture)
//!         → relay.rs (forward to upstream with correlation headers)
//!         → response with X-Trace-Id / X-Request-Id / X-Span-Id
//!
//! store:
//!     TelemetryClient / dashboard
//!         → server.rs (timeout, access logs)
//!         → store::api handlers
//!         → response.rs (ApiError → status + {"detail"})
//! ```

pub mod middleware;
pub mod relay;
pub mod response;
pub mod server;

pub use middleware::TracingState;
pub use relay::RelayState;
pub use response::{ApiError, FailureReport};
pub use server::{instrument, HttpServer};
