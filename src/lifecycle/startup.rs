//! Startup orchestration for instrumented services.
//!
//! # Responsibilities
//! - Build the telemetry client and the timing tracker from configuration
//! - Start the stale request sweeper
//! - Hand out the middleware state that wires them together
//! - Tear everything down in order on shutdown
//!
//! # Design Decisions
//! - Fail fast: any construction error aborts startup
//! - Completed-request summaries go to the store through the same client

use std::sync::Arc;

use axum::Router;
use tokio::task::JoinHandle;

use super::Shutdown;
use crate::config::MeshConfig;
use crate::error::StartupError;
use crate::http::middleware::TracingState;
use crate::http::server::instrument;
use crate::telemetry::TelemetryClient;
use crate::tracker::{build_tracker, CompletionSink, StaleRequestSweeper, TimingTracker};

/// Telemetry plumbing owned by one service instance.
pub struct ServiceRuntime {
    client: Arc<TelemetryClient>,
    tracker: Arc<dyn TimingTracker>,
    tracing_state: TracingState,
    shutdown: Shutdown,
    sweeper: JoinHandle<()>,
}

impl ServiceRuntime {
    /// Must be called from within a Tokio runtime.
    pub fn start(config: &MeshConfig) -> Result<Self, StartupError> {
        let service = &config.middleware.service_name;
        let client = Arc::new(TelemetryClient::new(&config.telemetry, service)?);
        let tracker = build_tracker(&config.tracker)?;
        let sink: Arc<dyn CompletionSink> = client.clone();

        let shutdown = Shutdown::new();
        let sweeper = StaleRequestSweeper::new(tracker.clone(), sink.clone(), &config.tracker);
        let sweeper = tokio::spawn(sweeper.run(shutdown.subscribe()));

        let tracing_state = TracingState::new(
            &config.middleware,
            &config.tracker.expected_services,
            client.clone(),
            tracker.clone(),
            sink,
        );

        tracing::info!(
            service = %service,
            store_url = %config.telemetry.store_url,
            mode = ?config.telemetry.mode,
            tracker = ?config.tracker.backend,
            "Telemetry runtime started"
        );

        Ok(Self {
            client,
            tracker,
            tracing_state,
            shutdown,
            sweeper,
        })
    }

    pub fn client(&self) -> &Arc<TelemetryClient> {
        &self.client
    }

    pub fn tracker(&self) -> &Arc<dyn TimingTracker> {
        &self.tracker
    }

    /// Middleware state for this service.
    pub fn tracing_state(&self) -> TracingState {
        self.tracing_state.clone()
    }

    /// Wrap a service router with the instrumentation middleware.
    pub fn instrument(&self, router: Router) -> Router {
        instrument(router, self.tracing_state())
    }

    /// Apply the settings that can change without a restart.
    pub fn apply_config(&self, config: &MeshConfig) {
        self.client.set_mode(config.telemetry.mode);
    }

    /// Stop the sweeper and flush queued telemetry.
    pub async fn shutdown(self) {
        self.shutdown.trigger();
        if let Err(e) = self.sweeper.await {
            tracing::warn!(error = %e, "Stale request sweeper ended abnormally");
        }
        self.client.close().await;
        tracing::info!(service = %self.client.service(), "Telemetry runtime stopped");
    }
}
