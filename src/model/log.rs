//! Log records shipped to the central store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Attributes;

/// Severity of a shipped log record. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        }
    }

    /// Accepts the upper-case wire names, plus `WARN` for convenience.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARNING" | "WARN" => Some(LogLevel::Warning),
            "ERROR" => Some(LogLevel::Error),
            "CRITICAL" => Some(LogLevel::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: LogLevel,
    pub service: String,
    pub message: String,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub extra: Attributes,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl LogRecord {
    /// An uncorrelated record stamped now.
    pub fn new(level: LogLevel, service: &str, message: impl Into<String>) -> Self {
        Self {
            level,
            service: service.to_string(),
            message: message.into(),
            trace_id: None,
            request_id: None,
            user_id: None,
            session_id: None,
            extra: Attributes::new(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Warning);
        assert!(LogLevel::Error < LogLevel::Critical);
    }

    #[test]
    fn test_minimal_record_deserializes() {
        let record: LogRecord = serde_json::from_str(
            r#"{"level":"WARNING","service":"api-gateway","message":"slow upstream"}"#,
        )
        .unwrap();
        assert_eq!(record.level, LogLevel::Warning);
        assert!(record.extra.is_empty());
        assert!(record.trace_id.is_none());
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(LogLevel::parse("warn"), Some(LogLevel::Warning));
        assert_eq!(LogLevel::parse("CRITICAL"), Some(LogLevel::Critical));
        assert_eq!(LogLevel::parse("verbose"), None);
    }
}
