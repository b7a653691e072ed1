//! Process-local timing tracker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{RequestTimingState, TimingTracker};
use crate::error::TrackerError;
use crate::model::{RequestMetrics, SpanStatus};

struct Tracked {
    state: RequestTimingState,
    started: Instant,
    service_starts: HashMap<String, Instant>,
}

impl Tracked {
    fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }
}

/// Timing state in a concurrent map owned by this process.
///
/// Replicas of the same service each hold their own map, so a request whose
/// services land on different replicas never completes here. Use
/// `SharedTimingTracker` for multi-replica deployments.
#[derive(Clone, Default)]
pub struct InMemoryTimingTracker {
    states: Arc<DashMap<String, Tracked>>,
}

impl InMemoryTimingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one request's state.
    pub fn state(&self, request_id: &str) -> Option<RequestTimingState> {
        self.states.get(request_id).map(|r| r.value().state.clone())
    }
}

#[async_trait]
impl TimingTracker for InMemoryTimingTracker {
    async fn start_request(
        &self,
        request_id: &str,
        user_id: Option<&str>,
        session_id: Option<&str>,
        expected_services: &[String],
    ) -> Result<(), TrackerError> {
        self.states.entry(request_id.to_string()).or_insert_with(|| Tracked {
            state: RequestTimingState::new(request_id, user_id, session_id, expected_services),
            started: Instant::now(),
            service_starts: HashMap::new(),
        });
        Ok(())
    }

    async fn start_service_timing(&self, request_id: &str, service: &str) -> Result<(), TrackerError> {
        match self.states.get_mut(request_id) {
            Some(mut tracked) => {
                tracked
                    .service_starts
                    .entry(service.to_string())
                    .or_insert_with(Instant::now);
            }
            None => tracing::debug!(request_id, service, "Service timing for unknown request"),
        }
        Ok(())
    }

    async fn end_service_timing(
        &self,
        request_id: &str,
        service: &str,
        status: SpanStatus,
    ) -> Result<Option<RequestMetrics>, TrackerError> {
        // The shard lock is held from the update through the removal.
        match self.states.entry(request_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let tracked = entry.get_mut();
                let since = tracked
                    .service_starts
                    .remove(service)
                    .unwrap_or(tracked.started);
                let duration_ms = since.elapsed().as_secs_f64() * 1000.0;
                tracked.state.complete_service(service, duration_ms, status);

                if !tracked.state.is_complete() {
                    return Ok(None);
                }
                let tracked = entry.remove();
                let total = tracked.elapsed_ms();
                Ok(Some(tracked.state.into_summary(total, false)))
            }
            Entry::Vacant(_) => {
                tracing::debug!(request_id, service, "End of timing for unknown or completed request");
                Ok(None)
            }
        }
    }

    async fn evict_stale(&self, max_age: Duration) -> Result<Vec<RequestMetrics>, TrackerError> {
        let stale: Vec<String> = self
            .states
            .iter()
            .filter(|r| r.value().started.elapsed() >= max_age)
            .map(|r| r.key().clone())
            .collect();

        let mut evicted = Vec::with_capacity(stale.len());
        for request_id in stale {
            // Re-checked under the lock: a completion may have raced the scan.
            if let Some((_, tracked)) = self
                .states
                .remove_if(&request_id, |_, t| t.started.elapsed() >= max_age)
            {
                let total = tracked.elapsed_ms();
                evicted.push(tracked.state.into_summary(total, true));
            }
        }
        Ok(evicted)
    }

    async fn in_flight(&self) -> Result<usize, TrackerError> {
        Ok(self.states.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RequestStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn expected(services: &[&str]) -> Vec<String> {
        services.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_completes_after_last_expected_service() {
        let tracker = InMemoryTimingTracker::new();
        let services = expected(&["api-gateway", "rag-service"]);
        tracker.start_request("req-1", Some("u1"), Some("s1"), &services).await.unwrap();

        tracker.start_service_timing("req-1", "api-gateway").await.unwrap();
        let first = tracker
            .end_service_timing("req-1", "api-gateway", SpanStatus::Success)
            .await
            .unwrap();
        assert!(first.is_none());
        assert_eq!(tracker.in_flight().await.unwrap(), 1);

        let summary = tracker
            .end_service_timing("req-1", "rag-service", SpanStatus::Success)
            .await
            .unwrap()
            .expect("request should complete");
        assert_eq!(summary.status, RequestStatus::Success);
        assert_eq!(summary.session_id.as_deref(), Some("s1"));
        assert_eq!(summary.service_durations.len(), 2);
        assert_eq!(tracker.in_flight().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_start_request_is_idempotent() {
        let tracker = InMemoryTimingTracker::new();
        tracker.start_request("req-1", Some("u1"), None, &expected(&["a", "b"])).await.unwrap();
        tracker
            .end_service_timing("req-1", "a", SpanStatus::Success)
            .await
            .unwrap();
        tracker.start_request("req-1", Some("other"), None, &expected(&["a"])).await.unwrap();

        let state = tracker.state("req-1").unwrap();
        assert_eq!(state.user_id.as_deref(), Some("u1"));
        assert!(state.completed_services.contains("a"));
        assert_eq!(state.expected_services.len(), 2);
    }

    #[tokio::test]
    async fn test_error_dominates() {
        let tracker = InMemoryTimingTracker::new();
        tracker.start_request("req-1", None, None, &expected(&["a", "b"])).await.unwrap();
        tracker.end_service_timing("req-1", "a", SpanStatus::Error).await.unwrap();
        let summary = tracker
            .end_service_timing("req-1", "b", SpanStatus::Success)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.status, RequestStatus::Error);
    }

    #[tokio::test]
    async fn test_unknown_request_is_ignored() {
        let tracker = InMemoryTimingTracker::new();
        let result = tracker
            .end_service_timing("never-started", "a", SpanStatus::Success)
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(tracker.in_flight().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_total_duration_tracks_wall_clock() {
        let tracker = InMemoryTimingTracker::new();
        tracker.start_request("req-1", None, None, &expected(&["a"])).await.unwrap();
        let started = Instant::now();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let summary = tracker
            .end_service_timing("req-1", "a", SpanStatus::Success)
            .await
            .unwrap()
            .unwrap();
        let wall = started.elapsed().as_secs_f64() * 1000.0;
        assert!(summary.total_duration >= 50.0);
        assert!(summary.total_duration <= wall + 5.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_completion_fires_once() {
        for round in 0..50 {
            let tracker = InMemoryTimingTracker::new();
            let request_id = format!("req-{round}");
            let services = expected(&["a", "b", "c"]);
            tracker.start_request(&request_id, None, None, &services).await.unwrap();

            let fired = Arc::new(AtomicUsize::new(0));
            let mut handles = Vec::new();
            for service in services.clone() {
                let tracker = tracker.clone();
                let fired = fired.clone();
                let request_id = request_id.clone();
                handles.push(tokio::spawn(async move {
                    let done = tracker
                        .end_service_timing(&request_id, &service, SpanStatus::Success)
                        .await
                        .unwrap();
                    if done.is_some() {
                        fired.fetch_add(1, Ordering::SeqCst);
                    }
                }));
            }
            for handle in handles {
                handle.await.unwrap();
            }
            assert_eq!(fired.load(Ordering::SeqCst), 1, "round {round}");
            assert_eq!(tracker.in_flight().await.unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn test_evict_stale_force_completes() {
        let tracker = InMemoryTimingTracker::new();
        tracker.start_request("old", None, None, &expected(&["a", "b"])).await.unwrap();
        tracker.end_service_timing("old", "a", SpanStatus::Success).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        tracker.start_request("fresh", None, None, &expected(&["a"])).await.unwrap();

        let evicted = tracker.evict_stale(Duration::from_millis(20)).await.unwrap();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].request_id, "old");
        assert_eq!(evicted[0].status, RequestStatus::Incomplete);
        assert!(tracker.state("fresh").is_some());
        assert!(tracker.state("old").is_none());
    }
}
