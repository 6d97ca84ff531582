//! HTTP error mapping
//!
//! Every handler error becomes `{"error": {"type": ..., "message": ...}}`
//! with a status derived from the authority error kind.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{debug, error};

/// Errors a handler can return.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] stack_auth::Error),

    #[error("missing {0} header")]
    MissingHeader(&'static str),

    #[error("missing x-stack-project-id header")]
    MissingProjectId,

    #[error("invalid server key")]
    InvalidServerKey,

    #[error("server key is not configured")]
    ServerKeyNotConfigured,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        use stack_auth::Error as E;
        match self {
            ApiError::Auth(e) if e.is_unauthenticated() => StatusCode::UNAUTHORIZED,
            ApiError::Auth(E::SessionNotFound(_) | E::LoginCodeUnknown) => StatusCode::NOT_FOUND,
            ApiError::Auth(E::LoginCodeExpired) => StatusCode::GONE,
            ApiError::Auth(E::AlreadyConfirmed) => StatusCode::CONFLICT,
            ApiError::Auth(E::InvalidPrincipal(_) | E::InvalidTtl(_)) => StatusCode::BAD_REQUEST,
            ApiError::Auth(E::KeyUnavailable) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Auth(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::MissingHeader(_) | ApiError::InvalidServerKey => StatusCode::UNAUTHORIZED,
            ApiError::MissingProjectId => StatusCode::BAD_REQUEST,
            ApiError::ServerKeyNotConfigured => StatusCode::FORBIDDEN,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Auth(e) => e.kind(),
            ApiError::MissingHeader(_) => "missing_credentials",
            ApiError::MissingProjectId => "missing_project_id",
            ApiError::InvalidServerKey => "invalid_server_key",
            ApiError::ServerKeyNotConfigured => "server_key_not_configured",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(kind = self.kind(), error = %self, "request failed");
        } else {
            debug!(kind = self.kind(), error = %self, "request rejected");
        }
        let body = serde_json::json!({
            "error": {
                "type": self.kind(),
                "message": self.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}
