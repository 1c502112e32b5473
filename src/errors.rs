use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("no credential with available quota")]
    PoolExhausted,

    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("ledger error: {0}")]
    Persistence(anyhow::Error),

    #[error("credential not found")]
    CredentialNotFound,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, code, msg) = match &self {
            AppError::PoolExhausted => (
                StatusCode::SERVICE_UNAVAILABLE,
                "unavailable_error",
                "pool_exhausted",
                "no available API keys".to_string(),
            ),
            AppError::UpstreamUnreachable(e) => (
                StatusCode::BAD_GATEWAY,
                "upstream_error",
                "upstream_unreachable",
                e.clone(),
            ),
            AppError::CredentialNotFound => (
                StatusCode::NOT_FOUND,
                "invalid_request_error",
                "credential_not_found",
                "credential not found".to_string(),
            ),
            AppError::BadRequest(e) => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "bad_request",
                e.clone(),
            ),
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                "invalid_admin_key",
                "invalid or missing admin key".to_string(),
            ),
            AppError::Persistence(e) => {
                tracing::error!("Ledger error: {:#}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:#}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "message": msg,
                "type": error_type,
                "code": code,
            }
        }));

        (status, body).into_response()
    }
}
