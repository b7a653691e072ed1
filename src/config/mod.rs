//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → MeshConfig (validated, immutable)
//!     → handed to ServiceRuntime / HttpServer at startup
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → runtime applies the live-reloadable fields (telemetry mode)
//! ```
//!
//! # Design Decisions
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - Only the telemetry mode is hot-swapped; everything else needs a restart

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, ConfigError};
pub use schema::{
    ListenerConfig, MeshConfig, MiddlewareConfig, ObservabilityConfig, SidecarConfig, StoreConfig,
    TelemetryConfig, TimeoutConfig, TrackerBackend, TrackerConfig,
};
pub use watcher::ConfigWatcher;
