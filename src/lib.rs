//! Distributed request tracing for a fleet of HTTP services.
//!
//! Every service wraps its handler with the instrumentation middleware,
//! which mints or forwards correlation IDs, times the call and ships spans
//! and errors to a central trace store without ever blocking the request.
//! The store persists the records and rebuilds the end-to-end view of any
//! trace on demand.

pub mod config;
pub mod correlation;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod model;
pub mod observability;
pub mod store;
pub mod telemetry;
pub mod tracker;

pub use config::MeshConfig;
pub use correlation::{CorrelationContext, PropagateExt};
pub use http::HttpServer;
pub use lifecycle::{ServiceRuntime, Shutdown};
pub use store::TraceStore;
pub use telemetry::TelemetryClient;
