//! Completed-request summary emitted by the timing tracker.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::span::SpanStatus;

/// Terminal status of one logical request across services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Running,
    Success,
    Error,
    /// Force-completed by the stale sweeper before every expected service reported.
    Incomplete,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Running => "running",
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
            RequestStatus::Incomplete => "incomplete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(RequestStatus::Running),
            "success" => Some(RequestStatus::Success),
            "error" => Some(RequestStatus::Error),
            "incomplete" => Some(RequestStatus::Incomplete),
            _ => None,
        }
    }

    /// Fold one service outcome into the request status. `Error` dominates.
    pub fn absorb(self, service_status: SpanStatus) -> Self {
        match (self, service_status) {
            (RequestStatus::Error, _) | (_, SpanStatus::Error) => RequestStatus::Error,
            _ => RequestStatus::Success,
        }
    }
}

/// The synthesized metrics event for a completed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMetrics {
    pub request_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Milliseconds each service spent on the request.
    pub service_durations: BTreeMap<String, f64>,
    /// Milliseconds from `start_request` to completion.
    pub total_duration: f64,
    pub status: RequestStatus,
    pub completed_at: DateTime<Utc>,
}
