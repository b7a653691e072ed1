//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, page sizes, addresses)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: MeshConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::{MeshConfig, TrackerBackend};

/// One rejected field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

pub fn validate_config(config: &MeshConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }

    if config.timeouts.request_secs == 0 {
        errors.push(ValidationError::new("timeouts.request_secs", "must be greater than 0"));
    }

    let store = &config.store;
    if store.database_path.trim().is_empty() {
        errors.push(ValidationError::new("store.database_path", "must not be empty"));
    }
    if store.default_page_size == 0 {
        errors.push(ValidationError::new("store.default_page_size", "must be greater than 0"));
    }
    if store.max_page_size < store.default_page_size {
        errors.push(ValidationError::new(
            "store.max_page_size",
            "must be at least store.default_page_size",
        ));
    }

    let telemetry = &config.telemetry;
    if url::Url::parse(&telemetry.store_url).is_err() {
        errors.push(ValidationError::new(
            "telemetry.store_url",
            format!("'{}' is not a URL", telemetry.store_url),
        ));
    }
    if telemetry.timeout_ms == 0 {
        errors.push(ValidationError::new("telemetry.timeout_ms", "must be greater than 0"));
    }
    if telemetry.max_retries > 1 {
        errors.push(ValidationError::new("telemetry.max_retries", "must be 0 or 1"));
    }
    if telemetry.queue_capacity == 0 {
        errors.push(ValidationError::new("telemetry.queue_capacity", "must be greater than 0"));
    }
    if telemetry.max_in_flight == 0 {
        errors.push(ValidationError::new("telemetry.max_in_flight", "must be greater than 0"));
    }

    if config.middleware.service_name.trim().is_empty() {
        errors.push(ValidationError::new("middleware.service_name", "must not be empty"));
    }
    if config.middleware.excluded_paths.iter().any(|p| !p.starts_with('/')) {
        errors.push(ValidationError::new("middleware.excluded_paths", "paths must start with '/'"));
    }

    let tracker = &config.tracker;
    if tracker.backend == TrackerBackend::Shared && tracker.shared_path.trim().is_empty() {
        errors.push(ValidationError::new(
            "tracker.shared_path",
            "required when tracker.backend = \"shared\"",
        ));
    }
    if tracker.stale_after_secs == 0 {
        errors.push(ValidationError::new("tracker.stale_after_secs", "must be greater than 0"));
    }
    if tracker.sweep_interval_secs == 0 {
        errors.push(ValidationError::new("tracker.sweep_interval_secs", "must be greater than 0"));
    }

    if let Some(upstream) = &config.sidecar.upstream_url {
        if url::Url::parse(upstream).is_err() {
            errors.push(ValidationError::new(
                "sidecar.upstream_url",
                format!("'{}' is not a URL", upstream),
            ));
        }
    }

    let observability = &config.observability;
    if observability.metrics_enabled && observability.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
