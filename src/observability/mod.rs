//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events via `tracing`)
//!     → metrics.rs (counters, gauges, histograms via `metrics`)
//!
//! Consumers:
//!     → stdout (human or JSON lines)
//!     → Prometheus scrape endpoint (optional)
//! ```
//!
//! # Design Decisions
//! - Metric helpers are free functions so call sites stay one line
//! - Without an installed recorder the `metrics` macros are no-ops

pub mod logging;
pub mod metrics;

pub use logging::init_logging;
pub use metrics::init_metrics;
