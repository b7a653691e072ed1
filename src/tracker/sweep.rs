//! Background eviction of requests that never complete.
//!
//! # Responsibilities
//! - Periodically force-complete requests older than the stale threshold
//! - Hand their `incomplete` summaries to the completion sink
//! - Publish the in-flight gauge

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time;

use super::{CompletionSink, TimingTracker};
use crate::config::TrackerConfig;
use crate::observability::metrics;

pub struct StaleRequestSweeper {
    tracker: Arc<dyn TimingTracker>,
    sink: Arc<dyn CompletionSink>,
    stale_after: Duration,
    interval: Duration,
}

impl StaleRequestSweeper {
    pub fn new(
        tracker: Arc<dyn TimingTracker>,
        sink: Arc<dyn CompletionSink>,
        config: &TrackerConfig,
    ) -> Self {
        Self {
            tracker,
            sink,
            stale_after: Duration::from_secs(config.stale_after_secs),
            interval: Duration::from_secs(config.sweep_interval_secs),
        }
    }

    /// Override the schedule, mainly for tests.
    pub fn with_timing(mut self, stale_after: Duration, interval: Duration) -> Self {
        self.stale_after = stale_after;
        self.interval = interval;
        self
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(
            stale_after_secs = self.stale_after.as_secs(),
            interval_secs = self.interval.as_secs(),
            "Stale request sweeper starting"
        );

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_once().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Stale request sweeper received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// One eviction pass. Returns how many requests were force-completed.
    pub async fn sweep_once(&self) -> usize {
        let evicted = match self.tracker.evict_stale(self.stale_after).await {
            Ok(evicted) => evicted,
            Err(e) => {
                tracing::warn!(error = %e, "Stale request sweep failed");
                return 0;
            }
        };

        let count = evicted.len();
        for summary in evicted {
            tracing::debug!(request_id = %summary.request_id, "Force-completing stale request");
            metrics::record_request_completed(summary.status.as_str());
            self.sink.deliver(summary);
        }
        if count > 0 {
            tracing::info!(evicted = count, "Evicted stale requests");
        }

        if let Ok(in_flight) = self.tracker.in_flight().await {
            metrics::record_in_flight(in_flight);
        }
        count
    }
}
