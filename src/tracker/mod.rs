//! Per-request completion tracking.
//!
//! # Data Flow
//! ```text
//! Middleware entry:  start_request → start_service_timing
//! Middleware exit:   end_service_timing
//!     → all expected services reported?
//!         no  → keep state
//!         yes → RequestMetrics summary → CompletionSink, state removed
//!
//! sweep.rs (periodic): evict_stale → RequestMetrics { status: incomplete }
//! ```
//!
//! # Design Decisions
//! - The completion check and the state removal happen under one lock
//!   (a dashmap shard or a SQLite write transaction), so exactly one caller
//!   observes completion
//! - `memory` state is per process; `shared` state is visible to every
//!   replica opening the same database file
//! - A service outside the expected set may report; completion only looks
//!   at the expected set

pub mod memory;
pub mod shared;
pub mod sweep;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::config::{TrackerBackend, TrackerConfig};
use crate::error::TrackerError;
use crate::model::{RequestMetrics, RequestStatus, SpanStatus};

pub use memory::InMemoryTimingTracker;
pub use shared::SharedTimingTracker;
pub use sweep::StaleRequestSweeper;

/// Aggregation state for one in-flight request, as exposed by a tracker.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestTimingState {
    pub request_id: String,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub expected_services: BTreeSet<String>,
    pub completed_services: BTreeSet<String>,
    /// Milliseconds per completed service.
    pub service_durations: BTreeMap<String, f64>,
    pub status: RequestStatus,
}

impl RequestTimingState {
    pub fn new(
        request_id: &str,
        user_id: Option<&str>,
        session_id: Option<&str>,
        expected_services: &[String],
    ) -> Self {
        Self {
            request_id: request_id.to_string(),
            user_id: user_id.map(str::to_string),
            session_id: session_id.map(str::to_string),
            expected_services: expected_services.iter().cloned().collect(),
            completed_services: BTreeSet::new(),
            service_durations: BTreeMap::new(),
            status: RequestStatus::Running,
        }
    }

    /// Record one service's contribution.
    pub fn complete_service(&mut self, service: &str, duration_ms: f64, status: SpanStatus) {
        self.completed_services.insert(service.to_string());
        self.service_durations.insert(service.to_string(), duration_ms);
        self.status = self.status.absorb(status);
    }

    /// Every expected service has reported.
    pub fn is_complete(&self) -> bool {
        self.expected_services.is_subset(&self.completed_services)
    }

    /// Build the summary event. `Incomplete` overrides the folded status.
    pub fn into_summary(self, total_duration_ms: f64, forced: bool) -> RequestMetrics {
        let status = if forced {
            RequestStatus::Incomplete
        } else {
            self.status
        };
        RequestMetrics {
            request_id: self.request_id,
            user_id: self.user_id,
            session_id: self.session_id,
            service_durations: self.service_durations,
            total_duration: total_duration_ms,
            status,
            completed_at: Utc::now(),
        }
    }
}

/// Accumulates per-service timings and detects when a request is done.
#[async_trait]
pub trait TimingTracker: Send + Sync {
    /// Create state for `request_id`. A second call for the same id is a no-op.
    async fn start_request(
        &self,
        request_id: &str,
        user_id: Option<&str>,
        session_id: Option<&str>,
        expected_services: &[String],
    ) -> Result<(), TrackerError>;

    /// Mark the moment `service` began its part of the request.
    async fn start_service_timing(&self, request_id: &str, service: &str) -> Result<(), TrackerError>;

    /// Record that `service` finished. Returns the summary exactly once,
    /// to the caller whose report completed the expected set.
    async fn end_service_timing(
        &self,
        request_id: &str,
        service: &str,
        status: SpanStatus,
    ) -> Result<Option<RequestMetrics>, TrackerError>;

    /// Remove and force-complete every request older than `max_age`.
    async fn evict_stale(&self, max_age: Duration) -> Result<Vec<RequestMetrics>, TrackerError>;

    /// Requests currently being aggregated.
    async fn in_flight(&self) -> Result<usize, TrackerError>;
}

/// Build the backend selected by configuration.
pub fn build_tracker(config: &TrackerConfig) -> Result<Arc<dyn TimingTracker>, TrackerError> {
    match config.backend {
        TrackerBackend::Memory => Ok(Arc::new(InMemoryTimingTracker::new())),
        TrackerBackend::Shared => Ok(Arc::new(SharedTimingTracker::open(&config.shared_path)?)),
    }
}

/// Receives completed-request summaries. Must not block.
pub trait CompletionSink: Send + Sync {
    fn deliver(&self, summary: RequestMetrics);
}

/// Keeps every summary in memory.
#[derive(Default)]
pub struct CollectingSink {
    summaries: Mutex<Vec<RequestMetrics>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn summaries(&self) -> Vec<RequestMetrics> {
        self.summaries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl CompletionSink for CollectingSink {
    fn deliver(&self, summary: RequestMetrics) {
        self.summaries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(summary);
    }
}
