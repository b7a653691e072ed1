//! HTTP server setup.
//!
//! # Responsibilities
//! - Assemble the store router or the instrumented sidecar router
//! - Wire up the ambient layers (request timeout, HTTP access logs)
//! - Serve on a listener until the shutdown signal fires
//!
//! # Design Decisions
//! - The store router never carries the instrumentation middleware
//! - Connect info is always available so spans can record the client address

use std::net::SocketAddr;
use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::any;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::http::middleware::{trace_requests, TracingState};
use crate::http::relay::{relay, RelayState};
use crate::store::{self, TraceStore};

/// HTTP server for either service mode.
pub struct HttpServer {
    router: Router,
}

impl HttpServer {
    /// The central trace store. Never instrumented.
    pub fn store(store: TraceStore, request_timeout: Duration) -> Self {
        let router = store::router(store).layer(timeout_layer(StatusCode::REQUEST_TIMEOUT, request_timeout));
        Self::with_access_logs(router)
    }

    /// A relay in front of an upstream service. `tracing` is `None` when the
    /// middleware is disabled by configuration.
    ///
    /// The timeout sits inside the instrumentation so an expired call still
    /// finishes its span, reports its error and echoes the correlation IDs.
    pub fn sidecar(relay_state: RelayState, tracing: Option<TracingState>, request_timeout: Duration) -> Self {
        let router = Router::new()
            .route("/", any(relay))
            .route("/{*path}", any(relay))
            .with_state(relay_state)
            .layer(timeout_layer(StatusCode::GATEWAY_TIMEOUT, request_timeout));
        let router = match tracing {
            Some(state) => instrument(router, state),
            None => router,
        };
        Self::with_access_logs(router)
    }

    fn with_access_logs(router: Router) -> Self {
        Self {
            router: router.layer(TraceLayer::new_for_http()),
        }
    }

    /// The assembled router, for in-process tests.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Serve until `shutdown` fires, then drain in-flight requests.
    pub async fn run(self, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("Shutdown signal received");
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

fn timeout_layer(status: StatusCode, timeout: Duration) -> TimeoutLayer {
    TimeoutLayer::with_status_code(status, timeout)
}

/// Wrap any service router with the instrumentation middleware.
pub fn instrument(router: Router, state: TracingState) -> Router {
    router.layer(axum::middleware::from_fn_with_state(state, trace_requests))
}
