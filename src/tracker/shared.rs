//! SQLite-backed timing tracker shared by replicas.
//!
//! # Responsibilities
//! - Keep request timing state in a database file every replica opens
//! - Detect completion regardless of which replica handled which service
//!
//! # Design Decisions
//! - Every mutation runs in a `BEGIN IMMEDIATE` transaction, which takes the
//!   database write lock up front; the completion check and the delete are
//!   therefore atomic across processes
//! - Timestamps are wall-clock epoch microseconds so replicas can compare them
//! - Blocking SQLite calls run on the blocking thread pool

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};

use super::{RequestTimingState, TimingTracker};
use crate::error::TrackerError;
use crate::model::{RequestMetrics, RequestStatus, SpanStatus};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS timing_states (
    request_id TEXT PRIMARY KEY,
    user_id TEXT,
    session_id TEXT,
    expected_services TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS timing_services (
    request_id TEXT NOT NULL,
    service TEXT NOT NULL,
    started_at INTEGER,
    ended_at INTEGER,
    duration_ms REAL,
    PRIMARY KEY (request_id, service)
);

CREATE INDEX IF NOT EXISTS idx_timing_states_started_at ON timing_states(started_at);
"#;

/// Timing state in a SQLite database shared by every replica.
#[derive(Clone)]
pub struct SharedTimingTracker {
    conn: Arc<Mutex<Connection>>,
}

impl SharedTimingTracker {
    /// Open or create the tracker database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TrackerError> {
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(SCHEMA)?;
        tracing::debug!(path = %path.as_ref().display(), "Shared timing tracker opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_tx<T, F>(&self, f: F) -> Result<T, TrackerError>
    where
        T: Send + 'static,
        F: FnOnce(&Transaction<'_>) -> Result<T, TrackerError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> Result<T, TrackerError> {
            let mut conn = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
        .await
        .map_err(|e| TrackerError::Task(e.to_string()))?
    }
}

fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

fn micros_to_ms(micros: i64) -> f64 {
    micros.max(0) as f64 / 1000.0
}

/// Load a request's state and its start time, if it is still tracked.
fn load_state(
    tx: &Transaction<'_>,
    request_id: &str,
) -> Result<Option<(RequestTimingState, i64)>, TrackerError> {
    let row = tx
        .query_row(
            "SELECT user_id, session_id, expected_services, status, started_at
             FROM timing_states WHERE request_id = ?1",
            params![request_id],
            |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            },
        )
        .optional()?;

    let Some((user_id, session_id, expected, status, started_at)) = row else {
        return Ok(None);
    };

    let expected: Vec<String> = serde_json::from_str(&expected)?;
    let mut state =
        RequestTimingState::new(request_id, user_id.as_deref(), session_id.as_deref(), &expected);
    state.status = RequestStatus::parse(&status).unwrap_or(RequestStatus::Running);

    let mut stmt = tx.prepare(
        "SELECT service, duration_ms FROM timing_services
         WHERE request_id = ?1 AND ended_at IS NOT NULL",
    )?;
    let rows = stmt.query_map(params![request_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
    })?;
    for row in rows {
        let (service, duration_ms) = row?;
        state.completed_services.insert(service.clone());
        state.service_durations.insert(service, duration_ms);
    }

    Ok(Some((state, started_at)))
}

fn delete_state(tx: &Transaction<'_>, request_id: &str) -> Result<(), TrackerError> {
    tx.execute("DELETE FROM timing_services WHERE request_id = ?1", params![request_id])?;
    tx.execute("DELETE FROM timing_states WHERE request_id = ?1", params![request_id])?;
    Ok(())
}

#[async_trait]
impl TimingTracker for SharedTimingTracker {
    async fn start_request(
        &self,
        request_id: &str,
        user_id: Option<&str>,
        session_id: Option<&str>,
        expected_services: &[String],
    ) -> Result<(), TrackerError> {
        let request_id = request_id.to_string();
        let user_id = user_id.map(str::to_string);
        let session_id = session_id.map(str::to_string);
        let expected = serde_json::to_string(expected_services)?;
        self.with_tx(move |tx| {
            tx.execute(
                "INSERT OR IGNORE INTO timing_states
                 (request_id, user_id, session_id, expected_services, status, started_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    request_id,
                    user_id,
                    session_id,
                    expected,
                    RequestStatus::Running.as_str(),
                    now_micros()
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn start_service_timing(&self, request_id: &str, service: &str) -> Result<(), TrackerError> {
        let request_id = request_id.to_string();
        let service = service.to_string();
        self.with_tx(move |tx| {
            tx.execute(
                "INSERT OR IGNORE INTO timing_services (request_id, service, started_at)
                 SELECT ?1, ?2, ?3
                 WHERE EXISTS (SELECT 1 FROM timing_states WHERE request_id = ?1)",
                params![request_id, service, now_micros()],
            )?;
            Ok(())
        })
        .await
    }

    async fn end_service_timing(
        &self,
        request_id: &str,
        service: &str,
        status: SpanStatus,
    ) -> Result<Option<RequestMetrics>, TrackerError> {
        let request_id = request_id.to_string();
        let service = service.to_string();
        self.with_tx(move |tx| {
            let Some((mut state, request_started)) = load_state(tx, &request_id)? else {
                tracing::debug!(request_id = %request_id, service = %service, "End of timing for unknown or completed request");
                return Ok(None);
            };

            let now = now_micros();
            let service_started: Option<i64> = tx
                .query_row(
                    "SELECT started_at FROM timing_services WHERE request_id = ?1 AND service = ?2",
                    params![request_id, service],
                    |row| row.get::<_, Option<i64>>(0),
                )
                .optional()?
                .flatten();
            let duration_ms = micros_to_ms(now - service_started.unwrap_or(request_started));
            state.complete_service(&service, duration_ms, status);

            if state.is_complete() {
                delete_state(tx, &request_id)?;
                return Ok(Some(state.into_summary(micros_to_ms(now - request_started), false)));
            }

            tx.execute(
                "INSERT INTO timing_services (request_id, service, started_at, ended_at, duration_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(request_id, service) DO UPDATE SET
                     ended_at = excluded.ended_at,
                     duration_ms = excluded.duration_ms",
                params![request_id, service, service_started, now, duration_ms],
            )?;
            tx.execute(
                "UPDATE timing_states SET status = ?2 WHERE request_id = ?1",
                params![request_id, state.status.as_str()],
            )?;
            Ok(None)
        })
        .await
    }

    async fn evict_stale(&self, max_age: Duration) -> Result<Vec<RequestMetrics>, TrackerError> {
        let max_age_us = i64::try_from(max_age.as_micros()).unwrap_or(i64::MAX);
        self.with_tx(move |tx| {
            let now = now_micros();
            let cutoff = now.saturating_sub(max_age_us);
            let stale: Vec<String> = {
                let mut stmt =
                    tx.prepare("SELECT request_id FROM timing_states WHERE started_at <= ?1")?;
                let rows = stmt.query_map(params![cutoff], |row| row.get::<_, String>(0))?;
                let ids = rows.collect::<Result<Vec<_>, _>>()?;
                ids
            };

            let mut evicted = Vec::with_capacity(stale.len());
            for request_id in stale {
                if let Some((state, started)) = load_state(tx, &request_id)? {
                    delete_state(tx, &request_id)?;
                    evicted.push(state.into_summary(micros_to_ms(now - started), true));
                }
            }
            Ok(evicted)
        })
        .await
    }

    async fn in_flight(&self) -> Result<usize, TrackerError> {
        self.with_tx(|tx| {
            let count: i64 = tx.query_row("SELECT COUNT(*) FROM timing_states", [], |row| row.get(0))?;
            Ok(count.max(0) as usize)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn expected(services: &[&str]) -> Vec<String> {
        services.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_replicas_share_completion() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracker.db");
        let replica_a = SharedTimingTracker::open(&path).unwrap();
        let replica_b = SharedTimingTracker::open(&path).unwrap();
        let services = expected(&["api-gateway", "rag-service"]);

        replica_a.start_request("req-1", Some("u1"), None, &services).await.unwrap();
        replica_b.start_request("req-1", Some("u1"), None, &services).await.unwrap();
        replica_a.start_service_timing("req-1", "api-gateway").await.unwrap();

        let first = replica_a
            .end_service_timing("req-1", "api-gateway", SpanStatus::Success)
            .await
            .unwrap();
        assert!(first.is_none());

        let summary = replica_b
            .end_service_timing("req-1", "rag-service", SpanStatus::Error)
            .await
            .unwrap()
            .expect("completion should be visible across replicas");
        assert_eq!(summary.status, RequestStatus::Error);
        assert_eq!(summary.user_id.as_deref(), Some("u1"));
        assert_eq!(summary.service_durations.len(), 2);
        assert_eq!(replica_a.in_flight().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_request_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = SharedTimingTracker::open(dir.path().join("tracker.db")).unwrap();
        tracker.start_service_timing("ghost", "a").await.unwrap();
        let result = tracker
            .end_service_timing("ghost", "a", SpanStatus::Success)
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(tracker.in_flight().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_replicas_fire_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracker.db");
        let replicas: Vec<_> = (0..3)
            .map(|_| SharedTimingTracker::open(&path).unwrap())
            .collect();
        let services = expected(&["a", "b", "c"]);

        for round in 0..10 {
            let request_id = format!("req-{round}");
            replicas[0].start_request(&request_id, None, None, &services).await.unwrap();

            let fired = Arc::new(AtomicUsize::new(0));
            let mut handles = Vec::new();
            for (replica, service) in replicas.iter().zip(services.iter()) {
                let replica = replica.clone();
                let service = service.clone();
                let request_id = request_id.clone();
                let fired = fired.clone();
                handles.push(tokio::spawn(async move {
                    let done = replica
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
        }
    }

    #[tokio::test]
    async fn test_evict_stale() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = SharedTimingTracker::open(dir.path().join("tracker.db")).unwrap();
        tracker.start_request("old", None, Some("s1"), &expected(&["a", "b"])).await.unwrap();
        tracker.end_service_timing("old", "a", SpanStatus::Success).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        tracker.start_request("fresh", None, None, &expected(&["a"])).await.unwrap();

        let evicted = tracker.evict_stale(Duration::from_millis(20)).await.unwrap();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].request_id, "old");
        assert_eq!(evicted[0].status, RequestStatus::Incomplete);
        assert_eq!(evicted[0].session_id.as_deref(), Some("s1"));
        assert!(evicted[0].service_durations.contains_key("a"));
        assert_eq!(tracker.in_flight().await.unwrap(), 1);
    }
}
