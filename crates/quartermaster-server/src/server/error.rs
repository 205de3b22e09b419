//! Error responses for the HTTP surface.
//!
//! Every handler returns [`ApiError`] on failure. The response body is
//! `{"error": <message>, "kind": <kind>}` where `kind` is the allocator's
//! [`ErrorKind`] in snake case, or `invalid_request` for malformed requests
//! rejected before reaching the allocator.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use quartermaster::ErrorKind;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    /// The allocator refused or failed the call.
    #[error(transparent)]
    Allocator(#[from] quartermaster::Error),

    /// The request was malformed or exceeded a server limit.
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
}

impl ApiError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        use quartermaster::Error;

        match self {
            Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Allocator(err) => match err {
                Error::PoolNotFound { .. } => StatusCode::NOT_FOUND,
                Error::DeadlineExceeded { .. } => StatusCode::GATEWAY_TIMEOUT,
                _ => match err.kind() {
                    ErrorKind::ConfigurationError | ErrorKind::ValidationError => {
                        StatusCode::BAD_REQUEST
                    }
                    ErrorKind::PoolExhausted | ErrorKind::AllocationRetriesExhausted => {
                        StatusCode::CONFLICT
                    }
                    ErrorKind::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
                },
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest { .. } => "invalid_request",
            Self::Allocator(err) => match err.kind() {
                ErrorKind::ConfigurationError => "configuration_error",
                ErrorKind::PoolExhausted => "pool_exhausted",
                ErrorKind::AllocationRetriesExhausted => "allocation_retries_exhausted",
                ErrorKind::StoreUnavailable => "store_unavailable",
                ErrorKind::ValidationError => "validation_error",
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }
        let body = json!({ "error": self.to_string(), "kind": self.kind() });
        (status, Json(body)).into_response()
    }
}
