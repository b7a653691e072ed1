//! Shared utilities for the integration tests.
#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use axum::http::{HeaderMap, Uri};
use axum::routing::any;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;

use trace_mesh::config::MeshConfig;
use trace_mesh::http::{HttpServer, RelayState};
use trace_mesh::lifecycle::{ServiceRuntime, Shutdown};
use trace_mesh::store::TraceStore;

pub struct StoreHandle {
    pub addr: SocketAddr,
    pub store: TraceStore,
    shutdown: Shutdown,
}

impl StoreHandle {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

impl Drop for StoreHandle {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

/// Start an in-memory trace store on an ephemeral port.
pub async fn spawn_store() -> StoreHandle {
    let store = TraceStore::open_in_memory().unwrap();
    let server = HttpServer::store(store.clone(), Duration::from_secs(10));
    let (addr, shutdown) = serve(server).await;
    StoreHandle { addr, store, shutdown }
}

pub struct Sidecar {
    pub addr: SocketAddr,
    pub runtime: ServiceRuntime,
    shutdown: Shutdown,
}

impl Sidecar {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub async fn stop(self) {
        self.shutdown.trigger();
        self.runtime.shutdown().await;
    }
}

/// Sidecar settings reporting to `store_url` and relaying to `upstream_url`.
pub fn sidecar_config(service: &str, store_url: &str, upstream_url: &str) -> MeshConfig {
    let mut config = MeshConfig::default();
    config.middleware.service_name = service.to_string();
    config.telemetry.store_url = store_url.to_string();
    config.telemetry.timeout_ms = 500;
    config.telemetry.drain_timeout_ms = 1_000;
    config.sidecar.upstream_url = Some(upstream_url.to_string());
    config
}

pub async fn spawn_sidecar(config: &MeshConfig) -> Sidecar {
    let runtime = ServiceRuntime::start(config).unwrap();
    let upstream = config.sidecar.upstream_url.as_deref().unwrap();
    // Same wiring as the binary: one request timeout for relay and server.
    let request_timeout = Duration::from_secs(config.timeouts.request_secs);
    let relay = RelayState::new(upstream, config.sidecar.max_body_bytes, request_timeout).unwrap();
    let server = HttpServer::sidecar(relay, Some(runtime.tracing_state()), request_timeout);
    let (addr, shutdown) = serve(server).await;
    Sidecar { addr, runtime, shutdown }
}

async fn serve(server: HttpServer) -> (SocketAddr, Shutdown) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = Shutdown::new();
    let signal = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = server.run(listener, signal).await;
    });
    (addr, shutdown)
}

/// An upstream that answers every call with the correlation headers it saw.
pub async fn spawn_echo_upstream() -> SocketAddr {
    async fn echo(headers: HeaderMap, uri: Uri) -> Json<Value> {
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string);
        Json(json!({
            "path": uri.path(),
            "trace_id": header("x-trace-id"),
            "request_id": header("x-request-id"),
            "user_id": header("x-user-id"),
            "session_id": header("x-session-id"),
        }))
    }

    let app = Router::new().route("/", any(echo)).route("/{*path}", any(echo));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

/// An upstream that holds every call for `delay` before answering.
pub async fn spawn_slow_upstream(delay: Duration) -> SocketAddr {
    let app = Router::new().route(
        "/{*path}",
        any(move || async move {
            tokio::time::sleep(delay).await;
            "late"
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

/// An address nothing is listening on.
pub async fn closed_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}

/// Poll `probe` until it yields a value, for at most five seconds.
pub async fn eventually<T, F, Fut>(what: &str, mut probe: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    for _ in 0..50 {
        if let Some(value) = probe().await {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {what}");
}

/// GET a JSON document, `None` unless the status is 200.
pub async fn get_json(client: &reqwest::Client, url: &str) -> Option<Value> {
    let response = client.get(url).send().await.ok()?;
    if !response.status().is_success() {
        return None;
    }
    response.json().await.ok()
}
