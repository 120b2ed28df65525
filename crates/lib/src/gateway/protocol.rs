//! Gateway HTTP wire types (health, errors).

use crate::channels::SendErrorKind;
use crate::manager::GatewayError;
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

/// `GET /` body: `{ "runtime", "channel", "mode", "port" }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub runtime: String,
    pub channel: String,
    pub mode: String,
    pub port: u16,
}

/// Error body: `{ "error": message, "kind": "timeout" | "rejected" | ... }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>, kind: &str) -> Self {
        Self {
            error: error.into(),
            kind: kind.to_string(),
        }
    }
}

/// Status and body for a failed API call.
pub fn error_response(err: &GatewayError) -> (StatusCode, ErrorBody) {
    match err {
        GatewayError::NotStarted => (
            StatusCode::SERVICE_UNAVAILABLE,
            ErrorBody::new(err.to_string(), "not_started"),
        ),
        GatewayError::Send(e) => match e.kind() {
            SendErrorKind::Timeout => (
                StatusCode::GATEWAY_TIMEOUT,
                ErrorBody::new(e.to_string(), "timeout"),
            ),
            SendErrorKind::Rejected => (
                StatusCode::BAD_GATEWAY,
                ErrorBody::new(e.to_string(), "rejected"),
            ),
        },
        GatewayError::Config(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorBody::new(err.to_string(), "config"),
        ),
    }
}
