//! Mapping of lifecycle errors onto HTTP responses

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use pairgate_core::Error;
use serde_json::json;
use tracing::warn;

/// Error returned by API handlers
#[derive(Debug)]
pub struct ApiError(pub Error);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            Error::MissingTenantId | Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::NotConnected(_) | Error::TransientDisconnect(_) | Error::Superseded(_) => {
                StatusCode::CONFLICT
            }
            Error::LoggedOut(_) | Error::CredentialsInvalid { .. } => StatusCode::GONE,
            Error::TransportUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!("Request failed: {}", self.0);
        }
        let body = json!({
            "ok": false,
            "error": self.0.code(),
            "message": self.0.to_string(),
            "retryable": self.0.is_retryable(),
        });
        (status, Json(body)).into_response()
    }
}
