//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for both the
//! trace store and the instrumented sidecar. All types derive Serde traits
//! for deserialization from config files.

use serde::{Deserialize, Serialize};

use crate::telemetry::TelemetryMode;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct MeshConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Central trace store settings.
    pub store: StoreConfig,

    /// Telemetry shipping settings.
    pub telemetry: TelemetryConfig,

    /// Instrumentation middleware settings.
    pub middleware: MiddlewareConfig,

    /// Request completion tracking.
    pub tracker: TrackerConfig,

    /// Pass-through relay settings.
    pub sidecar: SidecarConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8004").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8004".to_string(),
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Request timeout (total time for request/response) in seconds.
    pub request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { request_secs: 30 }
    }
}

/// SQLite-backed trace store.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database file. `:memory:` keeps everything in process.
    pub database_path: String,

    /// How long a writer waits on a locked database.
    pub busy_timeout_ms: u64,

    /// Page size when a listing request omits `limit`.
    pub default_page_size: u32,

    /// Upper bound applied to any requested `limit`.
    pub max_page_size: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: "trace-mesh.db".to_string(),
            busy_timeout_ms: 5_000,
            default_page_size: 100,
            max_page_size: 1_000,
        }
    }
}

/// Telemetry client settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Base URL of the trace store.
    pub store_url: String,

    /// Per-attempt HTTP timeout.
    pub timeout_ms: u64,

    /// Extra attempts after the first failure (0 or 1).
    pub max_retries: u32,

    /// Span/log volume filter.
    pub mode: TelemetryMode,

    /// Records buffered before new ones are dropped.
    pub queue_capacity: usize,

    /// Concurrent deliveries.
    pub max_in_flight: usize,

    /// How long shutdown waits for queued records.
    pub drain_timeout_ms: u64,

    /// Report every send as successful without network I/O. Debugging only.
    pub bypass_delivery: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            store_url: "http://127.0.0.1:8004".to_string(),
            timeout_ms: 2_000,
            max_retries: 1,
            mode: TelemetryMode::Full,
            queue_capacity: 1_024,
            max_in_flight: 32,
            drain_timeout_ms: 2_000,
            bypass_delivery: false,
        }
    }
}

/// Instrumentation middleware settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MiddlewareConfig {
    /// Name reported on every span and error.
    pub service_name: String,

    /// Mount the middleware at all.
    pub enabled: bool,

    /// Exact paths that are never traced.
    pub excluded_paths: Vec<String>,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            service_name: "service".to_string(),
            enabled: true,
            excluded_paths: ["/", "/health", "/docs", "/openapi.json", "/metrics"]
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

/// Where per-request timing state lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackerBackend {
    /// Process-local map. Replicas do not see each other's progress.
    #[default]
    Memory,
    /// SQLite file shared by every replica on the host or volume.
    Shared,
}

/// Request completion tracking.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub backend: TrackerBackend,

    /// Services that must all report before a request is complete.
    /// Empty means only this service.
    pub expected_services: Vec<String>,

    /// Database file for the shared backend.
    pub shared_path: String,

    /// Age after which an unfinished request is force-completed.
    pub stale_after_secs: u64,

    /// Sweep period.
    pub sweep_interval_secs: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            backend: TrackerBackend::Memory,
            expected_services: Vec::new(),
            shared_path: "trace-mesh-tracker.db".to_string(),
            stale_after_secs: 300,
            sweep_interval_secs: 30,
        }
    }
}

/// Pass-through relay settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SidecarConfig {
    /// Service the relay forwards to. Required for `sidecar` mode.
    pub upstream_url: Option<String>,

    /// Largest request body buffered for forwarding.
    pub max_body_bytes: usize,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            upstream_url: None,
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit JSON lines instead of human-readable output.
    pub json_logs: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
