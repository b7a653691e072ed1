//! trace-mesh
//!
//! ```text
//!                 ┌──────────────────────── service host ───────────────────────┐
//!  caller ──────▶ │ sidecar: middleware (IDs, span, tracker) ──▶ relay ──▶ app │
//!                 │            │                                                │
//!                 │            └─▶ TelemetryClient (bounded queue, best effort) │
//!                 └──────────────────────────────┬──────────────────────────────┘
//!                                                │ POST /traces /errors /logs
//!                                                ▼      /service-metrics
//!                 ┌──────────────────────── trace store ────────────────────────┐
//!                 │ ingestion ──▶ SQLite ──▶ reconstruction / hourly aggregates │
//!                 └─────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use notify::RecommendedWatcher;
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;

use trace_mesh::config::{load_config, ConfigWatcher, MeshConfig};
use trace_mesh::error::StartupError;
use trace_mesh::http::{HttpServer, RelayState};
use trace_mesh::lifecycle::{spawn_signal_handler, ServiceRuntime, Shutdown};
use trace_mesh::observability::{init_logging, init_metrics};
use trace_mesh::store::TraceStore;

#[derive(Parser)]
#[command(name = "trace-mesh", version, about = "Distributed request tracing")]
struct Cli {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Run the central trace store.
    Store,
    /// Run an instrumented relay in front of an upstream service.
    Sidecar,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => MeshConfig::default(),
    };

    init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "trace-mesh starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse::<SocketAddr>() {
            Ok(addr) => init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let shutdown = Shutdown::new();
    spawn_signal_handler(shutdown.clone());

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(
        address = %listener.local_addr()?,
        request_timeout_secs = config.timeouts.request_secs,
        "Listening for connections"
    );
    let request_timeout = Duration::from_secs(config.timeouts.request_secs);

    match cli.mode {
        Mode::Store => {
            let store = TraceStore::open(&config.store)?;
            tracing::info!(database = %config.store.database_path, "Trace store opened");
            HttpServer::store(store, request_timeout)
                .run(listener, shutdown.subscribe())
                .await?;
        }
        Mode::Sidecar => run_sidecar(config, cli.config, listener, shutdown, request_timeout).await?,
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn run_sidecar(
    config: MeshConfig,
    config_path: Option<PathBuf>,
    listener: TcpListener,
    shutdown: Shutdown,
    request_timeout: Duration,
) -> Result<(), StartupError> {
    let upstream = config
        .sidecar
        .upstream_url
        .as_deref()
        .ok_or(StartupError::MissingUpstream)?;
    let relay = RelayState::new(upstream, config.sidecar.max_body_bytes, request_timeout)?;
    tracing::info!(upstream = %relay.upstream(), service = %config.middleware.service_name, "Sidecar relaying");

    let runtime = ServiceRuntime::start(&config)?;
    let tracing_state = config.middleware.enabled.then(|| runtime.tracing_state());
    let server = HttpServer::sidecar(relay, tracing_state, request_timeout);

    // The watcher guard must outlive the server.
    let (_watcher, mut updates) = match config_path.as_deref() {
        Some(path) => watch(path),
        None => (None, None),
    };

    let mut serving = tokio::spawn(server.run(listener, shutdown.subscribe()));
    let served = loop {
        tokio::select! {
            joined = &mut serving => break joined,
            Some(updated) = next_update(&mut updates) => runtime.apply_config(&updated),
        }
    };

    runtime.shutdown().await;
    match served {
        Ok(result) => result?,
        Err(e) => tracing::error!(error = %e, "HTTP server task failed"),
    }
    Ok(())
}

fn watch(path: &Path) -> (Option<RecommendedWatcher>, Option<UnboundedReceiver<MeshConfig>>) {
    let (watcher, updates) = ConfigWatcher::new(path);
    match watcher.run() {
        Ok(guard) => (Some(guard), Some(updates)),
        Err(e) => {
            tracing::warn!(error = %e, "Config watcher unavailable, live reload disabled");
            (None, None)
        }
    }
}

async fn next_update(updates: &mut Option<UnboundedReceiver<MeshConfig>>) -> Option<MeshConfig> {
    match updates {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
