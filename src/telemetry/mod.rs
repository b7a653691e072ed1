//! Telemetry shipping subsystem.
//!
//! # Data Flow
//! ```text
//! Middleware / handlers
//!     → policy.rs (mode filter: full, errors_only, disabled)
//!     → client.rs (bounded queue → dispatcher → POST to the store)
//!
//! classify.rs: error_type + error_message → security | technical
//! ```
//!
//! # Design Decisions
//! - Nothing in this module returns an error to a request path
//! - Error entries and request summaries bypass the mode filter

pub mod classify;
pub mod client;
pub mod policy;

pub use classify::classify_error;
pub use client::TelemetryClient;
pub use policy::{TelemetryMode, TelemetryPolicy};
