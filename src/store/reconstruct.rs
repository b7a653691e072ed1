//! Joins the spans and errors of one trace into a `FullTrace`.
//!
//! Pure: no I/O, no clock. The same inputs always give the same output.

use crate::error::StoreError;
use crate::model::{ErrorEntry, ErrorSummary, FullTrace, Span, SpanSummary, TraceStatus};

/// Fold the stored records for one identifier into a trace view.
///
/// `subject` names the identifier for the `NotFound` error. Spans are
/// ordered by start time and errors by timestamp; ties keep input order.
pub fn build_full_trace(
    subject: &str,
    mut spans: Vec<Span>,
    mut errors: Vec<ErrorEntry>,
) -> Result<FullTrace, StoreError> {
    spans.sort_by_key(|span| span.start_time);
    errors.sort_by_key(|entry| entry.timestamp);

    let first = spans
        .first()
        .ok_or_else(|| StoreError::NotFound(subject.to_string()))?;

    let start_time = first.start_time;
    let end_time = spans.iter().filter_map(|span| span.end_time).max();
    let total_duration = end_time.map(|end| {
        (end - start_time).num_microseconds().unwrap_or(0).max(0) as f64 / 1000.0
    });

    let status = if spans.iter().any(Span::is_error) {
        TraceStatus::Error
    } else {
        TraceStatus::Success
    };

    let user_id = first
        .user_id
        .clone()
        .or_else(|| spans.iter().find_map(|span| span.user_id.clone()));
    let session_id = first
        .session_id
        .clone()
        .or_else(|| spans.iter().find_map(|span| span.session_id.clone()));

    Ok(FullTrace {
        request_id: first.request_id.clone(),
        trace_id: first.trace_id.clone(),
        user_id,
        session_id,
        start_time,
        end_time,
        total_duration,
        status,
        services_path: spans.iter().map(SpanSummary::from).collect(),
        errors: errors.iter().map(ErrorSummary::from).collect(),
    })
}
