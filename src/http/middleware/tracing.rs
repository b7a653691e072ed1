//! Instrumentation middleware.
//!
//! # Responsibilities
//! - Read or mint the correlation IDs and expose them to handlers
//! - Ship a `running` span on entry and the finished span on exit
//! - Turn failure reports, 5xx responses and panics into error entries
//! - Report service start/end to the timing tracker
//! - Echo the IDs to the caller in response headers
//!
//! # Design Decisions
//! - Telemetry and tracker failures are logged at debug and never reach the caller
//! - A panicking handler still yields a well-formed 500 carrying the IDs
//! - Excluded paths skip the middleware entirely

use std::collections::HashSet;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::USER_AGENT;
use axum::middleware::Next;
use axum::response::Response;
use futures_util::FutureExt;
use serde_json::Value;

use crate::config::MiddlewareConfig;
use crate::correlation::CorrelationContext;
use crate::http::response::{internal_error, FailureReport};
use crate::model::{Attributes, ErrorEntry, Span, SpanStatus};
use crate::observability::metrics;
use crate::telemetry::TelemetryClient;
use crate::tracker::{CompletionSink, TimingTracker};

/// Everything the middleware needs, injected at startup.
#[derive(Clone)]
pub struct TracingState {
    service: Arc<str>,
    client: Arc<TelemetryClient>,
    tracker: Arc<dyn TimingTracker>,
    sink: Arc<dyn CompletionSink>,
    expected_services: Arc<[String]>,
    excluded_paths: Arc<HashSet<String>>,
}

impl TracingState {
    /// An empty `expected_services` means the request completes once this
    /// service has reported.
    pub fn new(
        config: &MiddlewareConfig,
        expected_services: &[String],
        client: Arc<TelemetryClient>,
        tracker: Arc<dyn TimingTracker>,
        sink: Arc<dyn CompletionSink>,
    ) -> Self {
        let expected: Vec<String> = if expected_services.is_empty() {
            vec![config.service_name.clone()]
        } else {
            expected_services.to_vec()
        };
        Self {
            service: Arc::from(config.service_name.as_str()),
            client,
            tracker,
            sink,
            expected_services: expected.into(),
            excluded_paths: Arc::new(config.excluded_paths.iter().cloned().collect()),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn client(&self) -> &Arc<TelemetryClient> {
        &self.client
    }

    fn is_excluded(&self, path: &str) -> bool {
        self.excluded_paths.contains(path)
    }

    async fn begin(&self, ctx: &CorrelationContext) {
        if let Err(e) = self
            .tracker
            .start_request(
                &ctx.request_id,
                ctx.user_id.as_deref(),
                ctx.session_id.as_deref(),
                &self.expected_services,
            )
            .await
        {
            tracing::debug!(request_id = %ctx.request_id, error = %e, "Tracker start failed");
            return;
        }
        if let Err(e) = self.tracker.start_service_timing(&ctx.request_id, &self.service).await {
            tracing::debug!(request_id = %ctx.request_id, error = %e, "Tracker service start failed");
        }
    }

    async fn finish(&self, ctx: &CorrelationContext, status: SpanStatus) {
        match self
            .tracker
            .end_service_timing(&ctx.request_id, &self.service, status)
            .await
        {
            Ok(Some(summary)) => {
                tracing::debug!(
                    request_id = %summary.request_id,
                    total_ms = summary.total_duration,
                    status = summary.status.as_str(),
                    "Request complete"
                );
                metrics::record_request_completed(summary.status.as_str());
                self.sink.deliver(summary);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::debug!(request_id = %ctx.request_id, error = %e, "Tracker end failed");
            }
        }
    }
}

/// Request facts captured before the handler consumes the request.
struct CallInfo {
    method: String,
    path: String,
    query: String,
    user_agent: Option<String>,
    remote_addr: Option<String>,
}

impl CallInfo {
    fn of(req: &Request) -> Self {
        Self {
            method: req.method().to_string(),
            path: req.uri().path().to_string(),
            query: req.uri().query().unwrap_or_default().to_string(),
            user_agent: req
                .headers()
                .get(USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            remote_addr: req
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string()),
        }
    }

    fn operation(&self) -> String {
        format!("{} {}", self.method, self.path)
    }

    fn error_context(&self) -> Attributes {
        let mut context = Attributes::new();
        context.insert("method".into(), Value::from(self.method.clone()));
        context.insert("path".into(), Value::from(self.path.clone()));
        context.insert("query".into(), Value::from(self.query.clone()));
        context.insert("client_ip".into(), Value::from(self.remote_addr.clone()));
        context
    }
}

/// `axum::middleware::from_fn_with_state` entry point.
pub async fn trace_requests(State(state): State<TracingState>, mut req: Request, next: Next) -> Response {
    if state.is_excluded(req.uri().path()) {
        return next.run(req).await;
    }

    let ctx = CorrelationContext::from_headers(req.headers());
    req.extensions_mut().insert(ctx.clone());
    let call = CallInfo::of(&req);

    let mut span = Span::start(&ctx, &state.service, call.operation())
        .with_metadata("method", call.method.clone())
        .with_metadata("path", call.path.clone())
        .with_metadata("query", call.query.clone())
        .with_metadata("user_agent", call.user_agent.clone())
        .with_metadata("remote_addr", call.remote_addr.clone());
    state.client.send_span(&span);
    state.begin(&ctx).await;

    let (mut response, failure) = match AssertUnwindSafe(next.run(req)).catch_unwind().await {
        Ok(response) => {
            let failure = response.extensions().get::<FailureReport>().cloned().or_else(|| {
                response
                    .status()
                    .is_server_error()
                    .then(|| FailureReport::from_status(response.status()))
            });
            (response, failure)
        }
        Err(payload) => {
            let report = FailureReport::from_panic(&*payload);
            tracing::error!(
                request_id = %ctx.request_id,
                trace_id = %ctx.trace_id,
                error = %report.message,
                "Handler panicked"
            );
            (internal_error(&ctx), Some(report))
        }
    };

    span = span.with_metadata("status_code", response.status().as_u16());
    let status = match failure {
        Some(report) => {
            let entry = ErrorEntry::new(&ctx, &state.service, report.error_type.as_str(), report.message.as_str())
                .with_stack_trace(report.stack_trace)
                .with_context(call.error_context());
            state.client.send_error(entry);
            span = span.with_metadata("error_type", report.error_type);
            span.fail(report.message);
            SpanStatus::Error
        }
        None => {
            span.succeed();
            SpanStatus::Success
        }
    };
    state.client.send_span(&span);

    ctx.write_response_headers(response.headers_mut());
    state.finish(&ctx, status).await;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TelemetryConfig;
    use crate::correlation::{X_REQUEST_ID, X_SPAN_ID, X_TRACE_ID};
    use crate::model::RequestStatus;
    use crate::tracker::memory::InMemoryTimingTracker;
    use crate::tracker::CollectingSink;
    use axum::body::Body;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    struct Harness {
        app: Router,
        sink: Arc<CollectingSink>,
        tracker: InMemoryTimingTracker,
    }

    fn harness(expected: &[String]) -> Harness {
        let config = MiddlewareConfig {
            service_name: "api-gateway".to_string(),
            ..MiddlewareConfig::default()
        };
        let telemetry = TelemetryConfig {
            bypass_delivery: true,
            ..TelemetryConfig::default()
        };
        let client = Arc::new(TelemetryClient::new(&telemetry, "api-gateway").unwrap());
        let tracker = InMemoryTimingTracker::new();
        let sink = Arc::new(CollectingSink::new());
        let state = TracingState::new(&config, expected, client, Arc::new(tracker.clone()), sink.clone());

        let app = Router::new()
            .route("/", get(|| async { "root" }))
            .route("/chat", get(|ctx: CorrelationContext| async move { ctx.trace_id }))
            .route(
                "/degraded",
                get(|| async {
                    (
                        StatusCode::SERVICE_UNAVAILABLE,
                        FailureReport::new("LLMUnavailable", "upstream model timed out"),
                        "try again later",
                    )
                        .into_response()
                }),
            )
            .route(
                "/panic",
                get(|| async {
                    if true {
                        panic!("handler exploded");
                    }
                    "unreachable"
                }),
            )
            .layer(axum::middleware::from_fn_with_state(state, trace_requests));
        Harness { app, sink, tracker }
    }

    fn request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_ids_are_minted_and_echoed() {
        let h = harness(&[]);
        let response = h.app.clone().oneshot(request("/chat")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let trace_id = response.headers()[&X_TRACE_ID].to_str().unwrap().to_string();
        assert!(!trace_id.is_empty());
        assert!(response.headers().contains_key(&X_REQUEST_ID));
        assert!(response.headers().contains_key(&X_SPAN_ID));

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body, trace_id.as_bytes());
    }

    #[tokio::test]
    async fn test_inbound_ids_propagate_unchanged() {
        let h = harness(&[]);
        let req = Request::builder()
            .uri("/chat")
            .header("X-Trace-Id", "trace-from-edge")
            .header("X-Request-Id", "req-from-edge")
            .body(Body::empty())
            .unwrap();
        let response = h.app.clone().oneshot(req).await.unwrap();
        assert_eq!(response.headers()[&X_TRACE_ID], "trace-from-edge");
        assert_eq!(response.headers()[&X_REQUEST_ID], "req-from-edge");
        assert_ne!(response.headers()[&X_SPAN_ID], "trace-from-edge");
    }

    #[tokio::test]
    async fn test_single_service_request_completes() {
        let h = harness(&[]);
        h.app.clone().oneshot(request("/chat")).await.unwrap();
        let summaries = h.sink.summaries();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].status, RequestStatus::Success);
        assert!(summaries[0].service_durations.contains_key("api-gateway"));
    }

    #[tokio::test]
    async fn test_waits_for_every_expected_service() {
        let expected = vec!["api-gateway".to_string(), "rag-service".to_string()];
        let h = harness(&expected);
        let req = Request::builder()
            .uri("/chat")
            .header("X-Request-Id", "req-shared")
            .body(Body::empty())
            .unwrap();
        h.app.clone().oneshot(req).await.unwrap();
        assert!(h.sink.summaries().is_empty());
        let state = h.tracker.state("req-shared").unwrap();
        assert!(state.completed_services.contains("api-gateway"));
    }

    #[tokio::test]
    async fn test_failure_report_marks_request_failed() {
        let h = harness(&[]);
        let response = h.app.clone().oneshot(request("/degraded")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body, "try again later".as_bytes());
        assert_eq!(h.sink.summaries()[0].status, RequestStatus::Error);
    }

    #[tokio::test]
    async fn test_panic_becomes_internal_error() {
        let h = harness(&[]);
        let response = h.app.clone().oneshot(request("/panic")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let trace_id = response.headers()[&X_TRACE_ID].to_str().unwrap().to_string();

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"], "Internal server error");
        assert_eq!(body["trace_id"], trace_id.as_str());
        assert_eq!(h.sink.summaries()[0].status, RequestStatus::Error);
    }

    #[tokio::test]
    async fn test_excluded_paths_are_not_traced() {
        let h = harness(&[]);
        let response = h.app.clone().oneshot(request("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response.headers().contains_key(&X_TRACE_ID));
        assert!(h.sink.summaries().is_empty());
    }
}
