//! Response types shared by the store API and the instrumentation middleware.
//!
//! # Responsibilities
//! - Map store errors to HTTP status codes with a `{"detail": ...}` body
//! - Let handlers report a business failure to the middleware without
//!   changing what the caller receives (`FailureReport`)
//! - Build the well-formed 500 returned when a handler panics

use std::any::Any;
use std::convert::Infallible;

use axum::http::StatusCode;
use axum::response::{IntoResponse, IntoResponseParts, Response, ResponseParts};
use axum::Json;
use serde_json::json;

use crate::correlation::CorrelationContext;
use crate::error::StoreError;

/// Store error rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub StoreError);

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self.0 {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::InvalidRecord(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Store request failed");
        }
        (status, Json(json!({ "detail": self.0.to_string() }))).into_response()
    }
}

/// A business failure observed by a handler.
///
/// Attach it to a response (as a response part or extension) and the
/// instrumentation middleware records an error entry and an error span for
/// the call, whatever the status code.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureReport {
    pub error_type: String,
    pub message: String,
    pub stack_trace: Option<String>,
}

impl FailureReport {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            stack_trace: None,
        }
    }

    pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
        self.stack_trace = Some(stack_trace.into());
        self
    }

    /// Describe a caught panic payload.
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "handler panicked".to_string());
        Self::new("Panic", message)
    }

    /// Report for an error status that carried no explicit report.
    pub fn from_status(status: StatusCode) -> Self {
        Self::new(
            format!("HTTP{}", status.as_u16()),
            status.canonical_reason().unwrap_or("server error"),
        )
    }
}

impl IntoResponseParts for FailureReport {
    type Error = Infallible;

    fn into_response_parts(self, mut res: ResponseParts) -> Result<ResponseParts, Self::Error> {
        res.extensions_mut().insert(self);
        Ok(res)
    }
}

/// The 500 returned to the caller when a handler fails without a response.
pub fn internal_error(ctx: &CorrelationContext) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "error": "Internal server error",
            "trace_id": ctx.trace_id,
            "request_id": ctx.request_id,
        })),
    )
        .into_response()
}
