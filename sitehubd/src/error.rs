//! Hub error taxonomy and its HTTP mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use shared::types::ErrorBody;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HubError {
    /// Bad, missing or revoked credentials. Never says which part was wrong.
    #[error("authentication failed")]
    Unauthorized,

    #[error("invalid payload: {0}")]
    Validation(String),

    #[error("upstream failure: {0}")]
    Upstream(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, HubError>;

impl HubError {
    /// Machine-readable kind carried in every error body
    pub fn kind(&self) -> &'static str {
        match self {
            HubError::Unauthorized => "authentication_failure",
            HubError::Validation(_) => "validation_failure",
            HubError::Upstream(_) => "upstream_failure",
            HubError::Conflict(_) => "conflict_failure",
            HubError::NotFound(_) => "not_found",
            HubError::Storage(_) => "storage_failure",
            HubError::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            HubError::Unauthorized => StatusCode::UNAUTHORIZED,
            HubError::Validation(_) => StatusCode::BAD_REQUEST,
            HubError::Upstream(_) => StatusCode::BAD_GATEWAY,
            HubError::Conflict(_) => StatusCode::CONFLICT,
            HubError::NotFound(_) => StatusCode::NOT_FOUND,
            HubError::Storage(_) | HubError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(kind = self.kind(), "{}", self);
        }

        // Storage and internal details stay in the log
        let message = match &self {
            HubError::Storage(_) | HubError::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        };

        let body = Json(ErrorBody {
            error: message,
            kind: self.kind().to_string(),
            code: status.as_u16(),
        });

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for HubError {
    fn from(err: anyhow::Error) -> Self {
        HubError::Storage(format!("{:#}", err))
    }
}

impl From<serde_json::Error> for HubError {
    fn from(err: serde_json::Error) -> Self {
        HubError::Validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(HubError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(HubError::Validation("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(HubError::Conflict("x".into()).status(), StatusCode::CONFLICT);
        assert_eq!(HubError::Storage("x".into()).kind(), "storage_failure");
    }

    #[test]
    fn test_unauthorized_message_is_generic() {
        assert_eq!(HubError::Unauthorized.to_string(), "authentication failed");
    }
}
