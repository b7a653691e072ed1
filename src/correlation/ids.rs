//! Identifier generation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use uuid::Uuid;

/// Last timestamp component handed out, in microseconds since the epoch.
static LAST_MICROS: AtomicU64 = AtomicU64::new(0);

/// Generate a fresh trace ID (UUID v4).
pub fn new_trace_id() -> String {
    Uuid::new_v4().to_string()
}

/// Generate a fresh span ID (UUID v4).
pub fn new_span_id() -> String {
    Uuid::new_v4().to_string()
}

/// Generate a request ID of the form `req-{micros}-{hex8}`.
///
/// The timestamp component is strictly increasing within a process, so IDs
/// sort by creation order; the random suffix keeps replicas apart.
pub fn new_request_id() -> String {
    let micros = next_micros();
    let suffix: u32 = rand::thread_rng().gen();
    format!("req-{}-{:08x}", micros, suffix)
}

fn next_micros() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64;

    let mut last = LAST_MICROS.load(Ordering::Relaxed);
    loop {
        let candidate = now.max(last + 1);
        match LAST_MICROS.compare_exchange_weak(last, candidate, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return candidate,
            Err(actual) => last = actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_request_id_format() {
        let id = new_request_id();
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "req");
        assert!(parts[1].parse::<u64>().is_ok());
        assert_eq!(parts[2].len(), 8);
        assert!(u32::from_str_radix(parts[2], 16).is_ok());
    }

    #[test]
    fn test_request_id_timestamp_is_monotonic() {
        let stamp = |id: &str| id.split('-').nth(1).unwrap().parse::<u64>().unwrap();
        let mut previous = stamp(&new_request_id());
        for _ in 0..1_000 {
            let current = stamp(&new_request_id());
            assert!(current > previous);
            previous = current;
        }
    }

    #[test]
    fn test_no_collisions_across_100k_generations() {
        let mut traces = HashSet::with_capacity(100_000);
        let mut requests = HashSet::with_capacity(100_000);
        for _ in 0..100_000 {
            let trace = new_trace_id();
            assert!(!trace.is_empty());
            assert!(traces.insert(trace));
            assert!(requests.insert(new_request_id()));
        }
    }

    #[test]
    fn test_span_ids_unique() {
        assert_ne!(new_span_id(), new_span_id());
    }
}
