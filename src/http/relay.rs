//! Pass-through relay used by `trace-mesh sidecar`.
//!
//! # Responsibilities
//! - Forward every inbound call to the configured upstream unchanged
//! - Carry the correlation headers so the upstream continues the same trace
//! - Strip hop-by-hop headers in both directions
//! - Append the caller to `X-Forwarded-For`
//!
//! # Design Decisions
//! - Bodies are buffered up to `sidecar.max_body_bytes`
//! - An unreachable upstream is a 502 with a failure report, so the
//!   middleware records it as an error span

use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use url::Url;

use crate::correlation::CorrelationContext;
use crate::error::StartupError;
use crate::http::response::FailureReport;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

const HOP_BY_HOP: [HeaderName; 9] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::HOST,
];

/// Upstream target and the client used to reach it.
#[derive(Clone)]
pub struct RelayState {
    http: reqwest::Client,
    upstream: Url,
    max_body_bytes: usize,
}

impl RelayState {
    pub fn new(upstream_url: &str, max_body_bytes: usize, timeout: Duration) -> Result<Self, StartupError> {
        let upstream = Url::parse(upstream_url)
            .map_err(|e| StartupError::InvalidUpstream(format!("{upstream_url}: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(StartupError::RelayClient)?;
        Ok(Self {
            http,
            upstream,
            max_body_bytes,
        })
    }

    pub fn upstream(&self) -> &Url {
        &self.upstream
    }
}

/// Join the inbound path and query onto the upstream base.
fn target_url(base: &Url, uri: &Uri) -> Url {
    let mut target = base.clone();
    let path = format!("{}{}", base.path().trim_end_matches('/'), uri.path());
    target.set_path(&path);
    target.set_query(uri.query());
    target
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove(header::CONTENT_LENGTH);
}

fn append_forwarded_for(headers: &mut HeaderMap, client: Option<SocketAddr>) {
    let Some(addr) = client else {
        return;
    };
    let ip = addr.ip().to_string();
    let value = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.is_empty() => format!("{existing}, {ip}"),
        _ => ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

/// Forward the call to the upstream and hand its response back.
pub async fn relay(State(state): State<RelayState>, ctx: CorrelationContext, req: Request) -> Response {
    let client = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let (parts, body) = req.into_parts();

    let body = match axum::body::to_bytes(body, state.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(request_id = %ctx.request_id, error = %e, "Rejected request body");
            return (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large").into_response();
        }
    };

    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);
    append_forwarded_for(&mut headers, client);
    ctx.inject(&mut headers);

    let target = target_url(&state.upstream, &parts.uri);
    tracing::debug!(
        request_id = %ctx.request_id,
        method = %parts.method,
        target = %target,
        "Relaying request"
    );

    let upstream = state
        .http
        .request(parts.method, target)
        .headers(headers)
        .body(body)
        .send()
        .await;

    let upstream = match upstream {
        Ok(response) => response,
        Err(e) => return upstream_failure(&ctx, e),
    };

    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    strip_hop_by_hop(&mut headers);
    let bytes = match upstream.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => return upstream_failure(&ctx, e),
    };

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn upstream_failure(ctx: &CorrelationContext, err: reqwest::Error) -> Response {
    let error_type = if err.is_timeout() {
        "UpstreamTimeout"
    } else {
        "UpstreamUnavailable"
    };
    tracing::warn!(request_id = %ctx.request_id, error = %err, "Upstream request failed");
    (
        StatusCode::BAD_GATEWAY,
        FailureReport::new(error_type, err.to_string()),
        "Upstream request failed",
    )
        .into_response()
}
