//! Correlation header wire contract.
//!
//! # Responsibilities
//! - Read `X-Trace-Id`, `X-Request-Id`, `X-User-Id`, `X-Session-Id` from inbound calls
//! - Generate whatever is missing (absent header ⇒ fresh value)
//! - Forward the IDs to the next hop and back to the caller
//!
//! # Design Decisions
//! - Present headers are propagated unchanged, never normalised
//! - The span ID is minted per hop and only ever returned to the caller

use std::convert::Infallible;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

use super::ids::{new_request_id, new_span_id, new_trace_id};

pub const X_TRACE_ID: HeaderName = HeaderName::from_static("x-trace-id");
pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
pub const X_SPAN_ID: HeaderName = HeaderName::from_static("x-span-id");
pub const X_USER_ID: HeaderName = HeaderName::from_static("x-user-id");
pub const X_SESSION_ID: HeaderName = HeaderName::from_static("x-session-id");

/// Correlation identifiers for the call currently being handled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationContext {
    pub trace_id: String,
    pub request_id: String,
    pub span_id: String,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
}

impl CorrelationContext {
    /// A context not tied to any inbound call (background jobs, startup errors).
    pub fn detached() -> Self {
        Self {
            trace_id: new_trace_id(),
            request_id: new_request_id(),
            span_id: new_span_id(),
            user_id: None,
            session_id: None,
        }
    }

    /// Build the context for an inbound call, generating missing IDs.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            trace_id: header_value(headers, &X_TRACE_ID).unwrap_or_else(new_trace_id),
            request_id: header_value(headers, &X_REQUEST_ID).unwrap_or_else(new_request_id),
            span_id: new_span_id(),
            user_id: header_value(headers, &X_USER_ID),
            session_id: header_value(headers, &X_SESSION_ID),
        }
    }

    /// Attach the user/session identities known at the edge.
    pub fn with_identity(mut self, user_id: Option<String>, session_id: Option<String>) -> Self {
        self.user_id = user_id.or(self.user_id);
        self.session_id = session_id.or(self.session_id);
        self
    }

    /// The headers an outbound call must carry to continue this trace.
    pub fn outbound_headers(&self) -> Vec<(HeaderName, String)> {
        let mut out = vec![
            (X_TRACE_ID, self.trace_id.clone()),
            (X_REQUEST_ID, self.request_id.clone()),
        ];
        if let Some(user_id) = &self.user_id {
            out.push((X_USER_ID, user_id.clone()));
        }
        if let Some(session_id) = &self.session_id {
            out.push((X_SESSION_ID, session_id.clone()));
        }
        out
    }

    /// Write the outbound correlation headers into an existing header map.
    pub fn inject(&self, headers: &mut HeaderMap) {
        for (name, value) in self.outbound_headers() {
            insert_header(headers, name, &value);
        }
    }

    /// Echo the IDs back to the caller.
    pub fn write_response_headers(&self, headers: &mut HeaderMap) {
        insert_header(headers, X_TRACE_ID, &self.trace_id);
        insert_header(headers, X_REQUEST_ID, &self.request_id);
        insert_header(headers, X_SPAN_ID, &self.span_id);
    }
}

impl Default for CorrelationContext {
    fn default() -> Self {
        Self::detached()
    }
}

/// Handlers can take the context as an extractor. Inside the tracing
/// middleware it is the one the middleware recorded; elsewhere it is built
/// from the request headers.
impl<S> FromRequestParts<S> for CorrelationContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<CorrelationContext>()
            .cloned()
            .unwrap_or_else(|| CorrelationContext::from_headers(&parts.headers)))
    }
}

/// Propagate correlation headers on outbound `reqwest` calls.
pub trait PropagateExt {
    fn propagate(self, ctx: &CorrelationContext) -> Self;
}

impl PropagateExt for reqwest::RequestBuilder {
    fn propagate(self, ctx: &CorrelationContext) -> Self {
        ctx.outbound_headers()
            .into_iter()
            .fold(self, |builder, (name, value)| builder.header(name.as_str(), value))
    }
}

fn header_value(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn insert_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(v) => {
            headers.insert(name, v);
        }
        Err(_) => tracing::debug!(header = %name, "Dropping non-ASCII correlation header"),
    }
}
