//! Crate-level error types.
//!
//! Telemetry delivery failures never show up here: they are swallowed inside
//! the telemetry client. These errors cover the store read/write path,
//! the shared tracker backend, client construction and startup.

use thiserror::Error;

/// Errors produced by the central trace store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No spans exist for the requested identifier.
    #[error("{0} not found")]
    NotFound(String),

    /// An ingested record violates a data-model invariant.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// Underlying SQLite failure.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A JSON column could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A timestamp column could not be parsed.
    #[error("invalid timestamp in column: {0}")]
    Timestamp(#[from] chrono::ParseError),

    /// The blocking task running the query was cancelled or panicked.
    #[error("store task failed: {0}")]
    Task(String),
}

/// Errors from a timing tracker backend. The in-memory backend never fails.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("tracker database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("tracker state is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("tracker task failed: {0}")]
    Task(String),
}

/// Errors raised while constructing the telemetry client.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("invalid store url '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Errors raised while bringing a service up.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error("sidecar upstream url is not configured")]
    MissingUpstream,

    #[error("invalid upstream url '{0}'")]
    InvalidUpstream(String),

    #[error("failed to build relay client: {0}")]
    RelayClient(#[source] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
