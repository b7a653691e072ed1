//! Listing filters accepted by the query API.
//!
//! Every filter is optional. Time bounds are inclusive and compared against
//! the record's start time (spans) or timestamp (errors, logs).

use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Value;
use serde::Deserialize;

use crate::error::StoreError;
use crate::model::{ErrorCategory, LogLevel, SpanStatus};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TraceQuery {
    pub trace_id: Option<String>,
    pub request_id: Option<String>,
    pub service: Option<String>,
    /// Case-insensitive substring of the operation.
    pub operation: Option<String>,
    pub status: Option<SpanStatus>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ErrorQuery {
    pub trace_id: Option<String>,
    pub request_id: Option<String>,
    pub service: Option<String>,
    pub error_type: Option<String>,
    pub category: Option<ErrorCategory>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogQuery {
    pub service: Option<String>,
    pub level: Option<LogLevel>,
    pub trace_id: Option<String>,
    pub request_id: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Look-back window used by the aggregate and category views.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Window {
    pub hours: u32,
    pub service: Option<String>,
    pub status: Option<SpanStatus>,
    pub error_type: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl Default for Window {
    fn default() -> Self {
        Self {
            hours: 24,
            service: None,
            status: None,
            error_type: None,
            limit: None,
            offset: None,
        }
    }
}

impl Window {
    pub fn since(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, StoreError> {
        look_back(now, Duration::try_hours(i64::from(self.hours)), "hours", self.hours)
    }
}

/// `now` minus `span`, rejecting windows that fall outside the representable range.
pub fn look_back(
    now: DateTime<Utc>,
    span: Option<Duration>,
    param: &str,
    value: u32,
) -> Result<DateTime<Utc>, StoreError> {
    span.and_then(|span| now.checked_sub_signed(span))
        .ok_or_else(|| StoreError::InvalidRecord(format!("{param}={value} is out of range")))
}

/// Resolved `LIMIT`/`OFFSET`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: u32,
    pub offset: u32,
}

impl Page {
    pub fn resolve(limit: Option<u32>, offset: Option<u32>, default: u32, max: u32) -> Self {
        Self {
            limit: limit.unwrap_or(default).clamp(1, max.max(1)),
            offset: offset.unwrap_or(0),
        }
    }
}

/// Accumulates `WHERE` clauses with positional parameters.
#[derive(Debug, Default)]
pub(crate) struct Filter {
    clauses: Vec<String>,
    values: Vec<Value>,
}

impl Filter {
    fn push(&mut self, clause: String, value: Value) {
        self.values.push(value);
        self.clauses.push(clause.replace('?', &format!("?{}", self.values.len())));
    }

    pub fn eq(&mut self, column: &str, value: Option<&str>) -> &mut Self {
        if let Some(value) = value {
            self.push(format!("{column} = ?"), Value::Text(value.to_string()));
        }
        self
    }

    pub fn contains(&mut self, column: &str, value: Option<&str>) -> &mut Self {
        if let Some(value) = value {
            self.push(
                format!("LOWER({column}) LIKE ?"),
                Value::Text(format!("%{}%", value.to_lowercase())),
            );
        }
        self
    }

    pub fn at_least(&mut self, column: &str, value: Option<DateTime<Utc>>) -> &mut Self {
        if let Some(value) = value {
            self.push(format!("{column} >= ?"), Value::Text(super::database::encode_ts(&value)));
        }
        self
    }

    pub fn at_most(&mut self, column: &str, value: Option<DateTime<Utc>>) -> &mut Self {
        if let Some(value) = value {
            self.push(format!("{column} <= ?"), Value::Text(super::database::encode_ts(&value)));
        }
        self
    }

    /// `WHERE ...` (with leading space) or an empty string.
    pub fn where_clause(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_clamps() {
        assert_eq!(Page::resolve(None, None, 100, 1000), Page { limit: 100, offset: 0 });
        assert_eq!(Page::resolve(Some(5000), Some(20), 100, 1000), Page { limit: 1000, offset: 20 });
        assert_eq!(Page::resolve(Some(0), None, 100, 1000).limit, 1);
    }

    #[test]
    fn test_filter_numbers_parameters() {
        let mut filter = Filter::default();
        filter
            .eq("service", Some("rag-service"))
            .eq("status", None)
            .contains("operation", Some("Search"));
        assert_eq!(filter.where_clause(), " WHERE service = ?1 AND LOWER(operation) LIKE ?2");
        let values = filter.into_values();
        assert_eq!(values[1], Value::Text("%search%".to_string()));
    }

    #[test]
    fn test_window_since() {
        let now = Utc::now();
        let window = Window { hours: 2, ..Window::default() };
        assert_eq!(window.since(now).unwrap(), now - Duration::hours(2));

        let huge = Window { hours: u32::MAX, ..Window::default() };
        assert!(matches!(huge.since(now), Err(StoreError::InvalidRecord(_))));
    }

    #[test]
    fn test_empty_filter() {
        assert_eq!(Filter::default().where_clause(), "");
    }

    #[test]
    fn test_query_from_query_string_shape() {
        let query: TraceQuery = serde_json::from_value(serde_json::json!({
            "service": "api-gateway",
            "status": "error",
            "start_date": "2026-01-01T00:00:00Z",
            "limit": 10
        }))
        .unwrap();
        assert_eq!(query.status, Some(SpanStatus::Error));
        assert_eq!(query.limit, Some(10));
        assert!(query.start_date.is_some());
    }
}
