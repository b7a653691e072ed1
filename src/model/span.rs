//! Span records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Attributes;
use crate::correlation::CorrelationContext;

/// Fallback message for error spans reported without one.
const UNKNOWN_ERROR: &str = "unknown error";

/// Lifecycle status of a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanStatus {
    Running,
    Success,
    Error,
}

impl SpanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanStatus::Running => "running",
            SpanStatus::Success => "success",
            SpanStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(SpanStatus::Running),
            "success" => Some(SpanStatus::Success),
            "error" => Some(SpanStatus::Error),
            _ => None,
        }
    }
}

/// One timed operation inside one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub trace_id: String,
    pub request_id: String,
    pub span_id: String,
    pub service: String,
    pub operation: String,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// Seconds between start and end.
    #[serde(default)]
    pub duration: Option<f64>,
    pub status: SpanStatus,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub metadata: Attributes,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl Span {
    /// Open a `running` span for the given call.
    pub fn start(ctx: &CorrelationContext, service: &str, operation: impl Into<String>) -> Self {
        Self {
            trace_id: ctx.trace_id.clone(),
            request_id: ctx.request_id.clone(),
            span_id: ctx.span_id.clone(),
            service: service.to_string(),
            operation: operation.into(),
            start_time: Utc::now(),
            end_time: None,
            duration: None,
            status: SpanStatus::Running,
            error_message: None,
            metadata: Attributes::new(),
            user_id: ctx.user_id.clone(),
            session_id: ctx.session_id.clone(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Close the span successfully.
    pub fn succeed(&mut self) {
        self.close(SpanStatus::Success, None);
    }

    /// Close the span as failed. An empty message is replaced so the
    /// error-implies-message invariant always holds.
    pub fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        let message = if message.trim().is_empty() {
            UNKNOWN_ERROR.to_string()
        } else {
            message
        };
        self.close(SpanStatus::Error, Some(message));
    }

    fn close(&mut self, status: SpanStatus, error_message: Option<String>) {
        let end = Utc::now().max(self.start_time);
        let elapsed = (end - self.start_time).num_microseconds().unwrap_or(0) as f64 / 1_000_000.0;
        self.end_time = Some(end);
        self.duration = Some(elapsed);
        self.status = status;
        self.error_message = error_message;
    }

    pub fn is_error(&self) -> bool {
        self.status == SpanStatus::Error
    }

    /// Check the record invariants before it is accepted by the store.
    pub fn validate(&self) -> Result<(), String> {
        if self.trace_id.is_empty() || self.request_id.is_empty() || self.span_id.is_empty() {
            return Err("correlation identifiers must not be empty".into());
        }
        if self.service.is_empty() {
            return Err("service must not be empty".into());
        }
        if let Some(end) = self.end_time {
            if end < self.start_time {
                return Err(format!("span {} ends before it starts", self.span_id));
            }
        }
        if self.status == SpanStatus::Error
            && self.error_message.as_deref().map_or(true, |m| m.trim().is_empty())
        {
            return Err(format!("error span {} has no error_message", self.span_id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn span() -> Span {
        Span::start(&CorrelationContext::detached(), "rag-service", "POST /search")
    }

    #[test]
    fn test_start_is_running() {
        let s = span();
        assert_eq!(s.status, SpanStatus::Running);
        assert!(s.end_time.is_none());
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_succeed_sets_end_and_duration() {
        let mut s = span();
        s.succeed();
        assert_eq!(s.status, SpanStatus::Success);
        assert!(s.end_time.unwrap() >= s.start_time);
        assert!(s.duration.unwrap() >= 0.0);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_fail_always_has_message() {
        let mut s = span();
        s.fail("   ");
        assert_eq!(s.status, SpanStatus::Error);
        assert_eq!(s.error_message.as_deref(), Some(UNKNOWN_ERROR));
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_broken_invariants() {
        let mut s = span();
        s.status = SpanStatus::Error;
        assert!(s.validate().is_err());

        let mut s = span();
        s.end_time = Some(s.start_time - Duration::seconds(1));
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_status_wire_format() {
        let json = serde_json::to_string(&SpanStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");
        assert_eq!(SpanStatus::parse("error"), Some(SpanStatus::Error));
        assert_eq!(SpanStatus::parse("done"), None);
    }
}
