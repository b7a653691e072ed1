//! Out-of-band error records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Attributes;
use crate::correlation::CorrelationContext;
use crate::telemetry::classify::classify_error;

/// Whether a failure looks like a security event or a plain technical fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Security,
    Technical,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Security => "security",
            ErrorCategory::Technical => "technical",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "security" => Some(ErrorCategory::Security),
            "technical" => Some(ErrorCategory::Technical),
            _ => None,
        }
    }
}

/// A detailed failure record, created once at the point of detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub trace_id: String,
    pub request_id: String,
    #[serde(default)]
    pub span_id: Option<String>,
    pub service: String,
    pub error_type: String,
    pub error_message: String,
    #[serde(default)]
    pub stack_trace: Option<String>,
    #[serde(default)]
    pub context: Attributes,
    pub category: ErrorCategory,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl ErrorEntry {
    /// Create a classified error record for the given call.
    pub fn new(
        ctx: &CorrelationContext,
        service: &str,
        error_type: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        let error_type = error_type.into();
        let error_message = error_message.into();
        let category = classify_error(&error_type, &error_message);
        Self {
            trace_id: ctx.trace_id.clone(),
            request_id: ctx.request_id.clone(),
            span_id: Some(ctx.span_id.clone()),
            service: service.to_string(),
            error_type,
            error_message,
            stack_trace: None,
            context: Attributes::new(),
            category,
            timestamp: Utc::now(),
            user_id: ctx.user_id.clone(),
            session_id: ctx.session_id.clone(),
        }
    }

    pub fn with_stack_trace(mut self, stack_trace: Option<String>) -> Self {
        self.stack_trace = stack_trace;
        self
    }

    pub fn with_context(mut self, context: Attributes) -> Self {
        self.context = context;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.trace_id.is_empty() || self.request_id.is_empty() {
            return Err("correlation identifiers must not be empty".into());
        }
        if self.service.is_empty() || self.error_type.is_empty() {
            return Err("service and error_type must not be empty".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_entry_is_classified() {
        let ctx = CorrelationContext::detached();
        let entry = ErrorEntry::new(&ctx, "security-service", "PermissionError", "access denied");
        assert_eq!(entry.category, ErrorCategory::Security);
        assert_eq!(entry.trace_id, ctx.trace_id);
        assert_eq!(entry.span_id.as_deref(), Some(ctx.span_id.as_str()));

        let entry = ErrorEntry::new(&ctx, "rag-service", "IndexError", "list index out of range");
        assert_eq!(entry.category, ErrorCategory::Technical);
    }

    #[test]
    fn test_category_round_trips_through_str() {
        for category in [ErrorCategory::Security, ErrorCategory::Technical] {
            assert_eq!(ErrorCategory::parse(category.as_str()), Some(category));
        }
    }
}
