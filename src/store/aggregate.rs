//! Hourly bucketing and per-service rollups for the dashboard endpoints.
//!
//! Every function here is pure over projections loaded by `TraceStore`;
//! output order is deterministic (bucket hour, then the grouping keys).

use std::collections::BTreeMap;

use chrono::{DateTime, Timelike, Utc};
use serde::Serialize;

use super::database::{ErrorPoint, LogPoint, SpanPoint};
use crate::model::{ErrorCategory, LogLevel, SpanStatus};

/// Truncate to the start of the hour.
pub fn hour_bucket(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceCount {
    pub timestamp: DateTime<Utc>,
    pub service: String,
    pub status: SpanStatus,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorCount {
    pub timestamp: DateTime<Utc>,
    pub service: String,
    pub error_type: String,
    pub count: u64,
}

/// Span durations (seconds) for one service in one hour.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceBucket {
    pub timestamp: DateTime<Utc>,
    pub service: String,
    pub avg_duration: f64,
    pub min_duration: f64,
    pub max_duration: f64,
    pub total_duration: f64,
    pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServiceSummary {
    pub service: String,
    pub total_traces: u64,
    pub success_traces: u64,
    pub error_traces: u64,
    pub total_errors: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryCount {
    pub category: ErrorCategory,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypeCount {
    pub error_type: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceCount {
    pub service: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HourCount {
    pub hour: DateTime<Utc>,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorStats {
    pub total_errors: u64,
    pub errors_by_category: Vec<CategoryCount>,
    pub errors_by_type: Vec<TypeCount>,
    pub errors_by_service: Vec<ServiceCount>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViolationStats {
    pub total_violations: u64,
    pub violations_by_type: Vec<TypeCount>,
    pub violations_by_service: Vec<ServiceCount>,
    pub hourly_violations: Vec<HourCount>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStats {
    pub total_logs: u64,
    pub logs_today: u64,
    /// Services that logged within the last hour.
    pub active_services: u64,
    /// Percentage of the last 24h of logs at `ERROR` or above.
    pub error_rate_24h: f64,
    /// Mean completed-request duration in milliseconds over the last 24h.
    pub avg_response_time: Option<f64>,
}

fn count_by<K: Ord, T>(items: &[T], key: impl Fn(&T) -> K) -> BTreeMap<K, u64> {
    let mut counts = BTreeMap::new();
    for item in items {
        *counts.entry(key(item)).or_insert(0) += 1;
    }
    counts
}

pub fn trace_counts(points: &[SpanPoint]) -> Vec<TraceCount> {
    count_by(points, |p| (hour_bucket(p.start_time), p.service.clone(), p.status.as_str()))
        .into_iter()
        .map(|((timestamp, service, status), count)| TraceCount {
            timestamp,
            service,
            status: SpanStatus::parse(status).unwrap_or(SpanStatus::Running),
            count,
        })
        .collect()
}

pub fn error_counts(points: &[ErrorPoint]) -> Vec<ErrorCount> {
    count_by(points, |p| (hour_bucket(p.timestamp), p.service.clone(), p.error_type.clone()))
        .into_iter()
        .map(|((timestamp, service, error_type), count)| ErrorCount {
            timestamp,
            service,
            error_type,
            count,
        })
        .collect()
}

/// Only spans with a recorded duration contribute.
pub fn performance(points: &[SpanPoint]) -> Vec<PerformanceBucket> {
    let mut buckets: BTreeMap<(String, DateTime<Utc>), PerformanceBucket> = BTreeMap::new();
    for point in points {
        let Some(duration) = point.duration else {
            continue;
        };
        let hour = hour_bucket(point.start_time);
        let bucket = buckets
            .entry((point.service.clone(), hour))
            .or_insert_with(|| PerformanceBucket {
                timestamp: hour,
                service: point.service.clone(),
                avg_duration: 0.0,
                min_duration: f64::INFINITY,
                max_duration: 0.0,
                total_duration: 0.0,
                count: 0,
            });
        bucket.count += 1;
        bucket.total_duration += duration;
        bucket.avg_duration = bucket.total_duration / bucket.count as f64;
        bucket.min_duration = bucket.min_duration.min(duration);
        bucket.max_duration = bucket.max_duration.max(duration);
    }
    buckets.into_values().collect()
}

fn summary_for<'a>(
    services: &'a mut BTreeMap<String, ServiceSummary>,
    service: &str,
) -> &'a mut ServiceSummary {
    services
        .entry(service.to_string())
        .or_insert_with(|| ServiceSummary {
            service: service.to_string(),
            ..ServiceSummary::default()
        })
}

pub fn services_summary(spans: &[SpanPoint], errors: &[ErrorPoint]) -> Vec<ServiceSummary> {
    let mut services = BTreeMap::new();
    for span in spans {
        let summary = summary_for(&mut services, &span.service);
        summary.total_traces += 1;
        match span.status {
            SpanStatus::Success => summary.success_traces += 1,
            SpanStatus::Error => summary.error_traces += 1,
            SpanStatus::Running => {}
        }
    }
    for error in errors {
        summary_for(&mut services, &error.service).total_errors += 1;
    }
    services.into_values().collect()
}

fn type_counts(points: &[ErrorPoint]) -> Vec<TypeCount> {
    count_by(points, |p| p.error_type.clone())
        .into_iter()
        .map(|(error_type, count)| TypeCount { error_type, count })
        .collect()
}

fn service_counts(points: &[ErrorPoint]) -> Vec<ServiceCount> {
    count_by(points, |p| p.service.clone())
        .into_iter()
        .map(|(service, count)| ServiceCount { service, count })
        .collect()
}

pub fn error_stats(points: &[ErrorPoint]) -> ErrorStats {
    ErrorStats {
        total_errors: points.len() as u64,
        errors_by_category: count_by(points, |p| p.category.as_str())
            .into_iter()
            .filter_map(|(category, count)| {
                ErrorCategory::parse(category).map(|category| CategoryCount { category, count })
            })
            .collect(),
        errors_by_type: type_counts(points),
        errors_by_service: service_counts(points),
    }
}

/// Expects security-category points only.
pub fn violation_stats(points: &[ErrorPoint]) -> ViolationStats {
    ViolationStats {
        total_violations: points.len() as u64,
        violations_by_type: type_counts(points),
        violations_by_service: service_counts(points),
        hourly_violations: count_by(points, |p| hour_bucket(p.timestamp))
            .into_iter()
            .map(|(hour, count)| HourCount { hour, count })
            .collect(),
    }
}

/// `logs` must cover at least the last 24 hours before `now`.
pub fn system_stats(
    total_logs: u64,
    logs: &[LogPoint],
    avg_response_time: Option<f64>,
    now: DateTime<Utc>,
) -> SystemStats {
    let today = now
        .with_hour(0)
        .map(hour_bucket)
        .unwrap_or_else(|| hour_bucket(now));
    let last_hour = now - chrono::Duration::hours(1);
    let last_day = now - chrono::Duration::hours(24);

    let logs_today = logs.iter().filter(|l| l.timestamp >= today).count() as u64;
    let active_services = count_by(
        &logs.iter().filter(|l| l.timestamp >= last_hour).collect::<Vec<_>>(),
        |l| l.service.clone(),
    )
    .len() as u64;

    let day: Vec<_> = logs.iter().filter(|l| l.timestamp >= last_day).collect();
    let errors = day.iter().filter(|l| l.level >= LogLevel::Error).count();
    let error_rate_24h = if day.is_empty() {
        0.0
    } else {
        errors as f64 / day.len() as f64 * 100.0
    };

    SystemStats {
        total_logs,
        logs_today,
        active_services,
        error_rate_24h,
        avg_response_time,
    }
}
