//! Best-effort shipping of spans, errors, logs and request summaries.
//!
//! # Responsibilities
//! - Accept records from request handlers without ever blocking them
//! - Filter records through the active `TelemetryPolicy`
//! - POST records to the central store with a short timeout and one retry
//!
//! # Design Decisions
//! - Callers enqueue onto a bounded channel; a full queue drops the record
//! - A single dispatcher task fans records out with bounded concurrency
//! - Delivery failures are logged at debug and counted, never returned
//! - Telemetry loss is preferred over added request latency: no backoff

use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use url::Url;

use crate::config::TelemetryConfig;
use crate::correlation::CorrelationContext;
use crate::error::TelemetryError;
use crate::lifecycle::Shutdown;
use crate::model::{Attributes, ErrorEntry, LogLevel, LogRecord, RequestMetrics, Span};
use crate::observability::metrics;
use crate::telemetry::policy::{TelemetryMode, TelemetryPolicy};
use crate::tracker::CompletionSink;

/// One record waiting to be shipped.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
enum Envelope {
    Span(Span),
    Error(ErrorEntry),
    Log(LogRecord),
    Metrics(RequestMetrics),
}

impl Envelope {
    fn kind(&self) -> &'static str {
        match self {
            Envelope::Span(_) => "span",
            Envelope::Error(_) => "error",
            Envelope::Log(_) => "log",
            Envelope::Metrics(_) => "metrics",
        }
    }

    fn path(&self) -> &'static str {
        match self {
            Envelope::Span(_) => "traces",
            Envelope::Error(_) => "errors",
            Envelope::Log(_) => "logs",
            Envelope::Metrics(_) => "service-metrics",
        }
    }
}

/// The HTTP side of the client, shared by every in-flight send.
struct Delivery {
    http: reqwest::Client,
    base_url: Url,
    max_retries: u32,
    bypass: bool,
}

impl Delivery {
    async fn deliver(&self, envelope: &Envelope) -> bool {
        if self.bypass {
            return true;
        }

        let url = match self.base_url.join(envelope.path()) {
            Ok(url) => url,
            Err(e) => {
                tracing::debug!(error = %e, "Invalid telemetry endpoint");
                return false;
            }
        };

        for attempt in 0..=self.max_retries {
            match self.http.post(url.clone()).json(envelope).send().await {
                Ok(response) if response.status().is_success() => return true,
                Ok(response) if response.status().is_server_error() => {
                    tracing::debug!(
                        kind = envelope.kind(),
                        attempt,
                        status = %response.status(),
                        "Telemetry store failed"
                    );
                }
                Ok(response) => {
                    // A rejected record is rejected again on retry.
                    tracing::debug!(
                        kind = envelope.kind(),
                        status = %response.status(),
                        "Telemetry store rejected record"
                    );
                    return false;
                }
                Err(e) => {
                    tracing::debug!(kind = envelope.kind(), attempt, error = %e, "Telemetry send failed");
                }
            }
        }
        false
    }
}

/// Non-blocking telemetry sender for one service.
pub struct TelemetryClient {
    service: String,
    policy: ArcSwap<TelemetryPolicy>,
    queue: mpsc::Sender<Envelope>,
    shutdown: Shutdown,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    drain_timeout: Duration,
}

impl TelemetryClient {
    /// Build the client and spawn its dispatcher. Must run inside a Tokio runtime.
    pub fn new(config: &TelemetryConfig, service: &str) -> Result<Self, TelemetryError> {
        let base_url = normalize_base(&config.store_url)?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;

        let delivery = Arc::new(Delivery {
            http,
            base_url,
            max_retries: config.max_retries.min(1),
            bypass: config.bypass_delivery,
        });
        if delivery.bypass {
            tracing::warn!(service, "Telemetry delivery bypass is enabled; records are not sent");
        }

        let (queue, rx) = mpsc::channel(config.queue_capacity.max(1));
        let shutdown = Shutdown::new();
        let limit = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
        let drain_timeout = Duration::from_millis(config.drain_timeout_ms);
        let handle = tokio::spawn(dispatch(rx, delivery, limit, shutdown.subscribe(), drain_timeout));

        Ok(Self {
            service: service.to_string(),
            policy: ArcSwap::from_pointee(TelemetryPolicy::new(config.mode)),
            queue,
            shutdown,
            dispatcher: Mutex::new(Some(handle)),
            drain_timeout,
        })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn mode(&self) -> TelemetryMode {
        self.policy.load().mode
    }

    /// Swap the filtering mode at runtime.
    pub fn set_mode(&self, mode: TelemetryMode) {
        if self.mode() != mode {
            tracing::info!(service = %self.service, ?mode, "Telemetry mode changed");
            self.policy.store(Arc::new(TelemetryPolicy::new(mode)));
        }
    }

    /// Queue a span. Returns whether the record was accepted for delivery.
    pub fn send_span(&self, span: &Span) -> bool {
        if !self.policy.load().allows_span(span) {
            metrics::record_telemetry("span", "filtered");
            return false;
        }
        self.enqueue(Envelope::Span(span.clone()))
    }

    pub fn send_error(&self, entry: ErrorEntry) -> bool {
        self.enqueue(Envelope::Error(entry))
    }

    pub fn send_log(
        &self,
        level: LogLevel,
        message: impl Into<String>,
        ctx: Option<&CorrelationContext>,
        extra: Attributes,
    ) -> bool {
        if !self.policy.load().allows_log(level) {
            metrics::record_telemetry("log", "filtered");
            return false;
        }
        let record = LogRecord {
            level,
            service: self.service.clone(),
            message: message.into(),
            trace_id: ctx.map(|c| c.trace_id.clone()),
            request_id: ctx.map(|c| c.request_id.clone()),
            user_id: ctx.and_then(|c| c.user_id.clone()),
            session_id: ctx.and_then(|c| c.session_id.clone()),
            extra,
            timestamp: chrono::Utc::now(),
        };
        self.enqueue(Envelope::Log(record))
    }

    pub fn send_metrics(&self, summary: RequestMetrics) -> bool {
        self.enqueue(Envelope::Metrics(summary))
    }

    /// Build, classify and ship an error record outside the request middleware.
    pub fn report_error(
        &self,
        ctx: &CorrelationContext,
        error_type: &str,
        error_message: &str,
        stack_trace: Option<String>,
        context: Attributes,
    ) -> bool {
        let entry = ErrorEntry::new(ctx, &self.service, error_type, error_message)
            .with_stack_trace(stack_trace)
            .with_context(context);
        self.send_error(entry)
    }

    fn enqueue(&self, envelope: Envelope) -> bool {
        let kind = envelope.kind();
        match self.queue.try_send(envelope) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(kind, "Telemetry queue full, dropping record");
                metrics::record_telemetry(kind, "dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                metrics::record_telemetry(kind, "dropped");
                false
            }
        }
    }

    /// Stop accepting records and flush what is queued, bounded by the drain timeout.
    pub async fn close(&self) {
        self.shutdown.trigger();
        let handle = self
            .dispatcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            let grace = self.drain_timeout + Duration::from_millis(100);
            if tokio::time::timeout(grace, handle).await.is_err() {
                tracing::warn!(service = %self.service, "Telemetry dispatcher did not drain in time");
            }
        }
        tracing::debug!(service = %self.service, "Telemetry client closed");
    }
}

impl CompletionSink for TelemetryClient {
    fn deliver(&self, summary: RequestMetrics) {
        self.send_metrics(summary);
    }
}

async fn dispatch(
    mut rx: mpsc::Receiver<Envelope>,
    delivery: Arc<Delivery>,
    limit: Arc<Semaphore>,
    mut shutdown: broadcast::Receiver<()>,
    drain_timeout: Duration,
) {
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(envelope) => spawn_send(&mut in_flight, &delivery, &limit, envelope).await,
                None => break,
            },
            _ = shutdown.recv() => {
                rx.close();
                while let Some(envelope) = rx.recv().await {
                    spawn_send(&mut in_flight, &delivery, &limit, envelope).await;
                }
                break;
            }
            Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
        }
    }

    let drained = tokio::time::timeout(drain_timeout, async {
        while in_flight.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::debug!(abandoned = in_flight.len(), "Abandoning undelivered telemetry");
        in_flight.abort_all();
    }
}

async fn spawn_send(
    in_flight: &mut JoinSet<()>,
    delivery: &Arc<Delivery>,
    limit: &Arc<Semaphore>,
    envelope: Envelope,
) {
    let Ok(permit) = limit.clone().acquire_owned().await else {
        return;
    };
    let delivery = delivery.clone();
    in_flight.spawn(async move {
        let outcome = if delivery.deliver(&envelope).await { "sent" } else { "failed" };
        metrics::record_telemetry(envelope.kind(), outcome);
        drop(permit);
    });
}

/// Make sure `join` appends to the configured path instead of replacing its last segment.
fn normalize_base(raw: &str) -> Result<Url, TelemetryError> {
    let with_slash = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{}/", raw)
    };
    Url::parse(&with_slash).map_err(|source| TelemetryError::InvalidUrl {
        url: raw.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TelemetryConfig;

    fn unreachable_config() -> TelemetryConfig {
        TelemetryConfig {
            store_url: "http://127.0.0.1:9".to_string(),
            timeout_ms: 200,
            drain_timeout_ms: 300,
            ..TelemetryConfig::default()
        }
    }

    #[test]
    fn test_normalize_base_keeps_path() {
        let base = normalize_base("http://monitoring:8004/api").unwrap();
        assert_eq!(base.join("traces").unwrap().as_str(), "http://monitoring:8004/api/traces");

        let base = normalize_base("http://monitoring:8004").unwrap();
        assert_eq!(base.join("errors").unwrap().as_str(), "http://monitoring:8004/errors");
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        assert!(normalize_base("not a url").is_err());
    }

    #[tokio::test]
    async fn test_sends_never_block_on_unreachable_store() {
        let client = TelemetryClient::new(&unreachable_config(), "api-gateway").unwrap();
        let ctx = CorrelationContext::detached();

        let started = std::time::Instant::now();
        for _ in 0..50 {
            let mut span = Span::start(&ctx, "api-gateway", "GET /");
            span.succeed();
            client.send_span(&span);
        }
        assert!(started.elapsed() < Duration::from_millis(50));
        client.close().await;
    }

    #[tokio::test]
    async fn test_filtered_span_is_not_queued() {
        let mut config = unreachable_config();
        config.mode = TelemetryMode::ErrorsOnly;
        let client = TelemetryClient::new(&config, "rag-service").unwrap();
        let ctx = CorrelationContext::detached();

        let mut ok = Span::start(&ctx, "rag-service", "POST /search");
        ok.succeed();
        assert!(!client.send_span(&ok));

        let mut failed = Span::start(&ctx, "rag-service", "POST /search");
        failed.fail("index unavailable");
        assert!(client.send_span(&failed));

        assert!(!client.send_log(LogLevel::Info, "hello", None, Attributes::new()));
        assert!(client.send_log(LogLevel::Error, "bad", Some(&ctx), Attributes::new()));
        client.close().await;
    }

    #[tokio::test]
    async fn test_full_queue_drops() {
        let mut config = unreachable_config();
        config.queue_capacity = 1;
        config.max_in_flight = 1;
        config.timeout_ms = 2_000;
        let client = TelemetryClient::new(&config, "dialogue-service").unwrap();
        let ctx = CorrelationContext::detached();

        let accepted = (0..100)
            .filter(|_| client.report_error(&ctx, "ValueError", "bad input", None, Attributes::new()))
            .count();
        assert!(accepted < 100);
        client.close().await;
    }

    #[tokio::test]
    async fn test_mode_can_be_swapped() {
        let client = TelemetryClient::new(&unreachable_config(), "api-gateway").unwrap();
        assert_eq!(client.mode(), TelemetryMode::Full);
        client.set_mode(TelemetryMode::Disabled);
        assert_eq!(client.mode(), TelemetryMode::Disabled);
        client.close().await;
    }

    #[tokio::test]
    async fn test_closed_client_rejects_records() {
        let client = TelemetryClient::new(&unreachable_config(), "api-gateway").unwrap();
        client.close().await;
        let ctx = CorrelationContext::detached();
        assert!(!client.report_error(&ctx, "ValueError", "late", None, Attributes::new()));
    }

    #[tokio::test]
    async fn test_bypass_reports_success_without_network() {
        let mut config = unreachable_config();
        config.bypass_delivery = true;
        let delivery = Delivery {
            http: reqwest::Client::new(),
            base_url: normalize_base(&config.store_url).unwrap(),
            max_retries: 1,
            bypass: true,
        };
        let span = Span::start(&CorrelationContext::detached(), "svc", "op");
        assert!(delivery.deliver(&Envelope::Span(span)).await);
    }

    async fn counting_store(status: axum::http::StatusCode) -> (Url, Arc<std::sync::atomic::AtomicUsize>) {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = axum::Router::new().route(
            "/traces",
            axum::routing::post(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { status }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (normalize_base(&format!("http://{addr}")).unwrap(), hits)
    }

    fn delivery_to(base_url: Url) -> Delivery {
        Delivery {
            http: reqwest::Client::new(),
            base_url,
            max_retries: 1,
            bypass: false,
        }
    }

    #[tokio::test]
    async fn test_rejected_record_is_not_retried() {
        use std::sync::atomic::Ordering;

        let (base, hits) = counting_store(axum::http::StatusCode::UNPROCESSABLE_ENTITY).await;
        let span = Span::start(&CorrelationContext::detached(), "svc", "op");
        assert!(!delivery_to(base).deliver(&Envelope::Span(span)).await);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_server_error_is_retried_once() {
        use std::sync::atomic::Ordering;

        let (base, hits) = counting_store(axum::http::StatusCode::SERVICE_UNAVAILABLE).await;
        let span = Span::start(&CorrelationContext::detached(), "svc", "op");
        assert!(!delivery_to(base).deliver(&Envelope::Span(span)).await);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
