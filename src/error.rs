use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Request body too large")]
    PayloadTooLarge,
    #[error("Authorization required")]
    AuthRequired,
    #[error("Invalid or expired token")]
    AuthInvalid,
    #[error("{0} not found")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("No upstream service available")]
    NoUpstreamAvailable,
    #[error("Upstream error: {status} - {message}")]
    Upstream { status: StatusCode, message: String },
    #[error("Stream error: {0}")]
    Stream(String),
    #[error("Internal error: {0}")]
    Internal(String),
    #[error("Request failed: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("JSON serialization/deserialization failed: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("SSE codec error: {0}")]
    SseCodec(#[from] tokio_sse_codec::SseDecodeError),
}

impl AppError {
    /// Maps an upstream non-2xx status into the client-facing error.
    /// 4xx statuses pass through unchanged; everything else becomes 502.
    pub fn upstream(status: StatusCode, message: String) -> Self {
        let status = if status.is_client_error() {
            status
        } else {
            StatusCode::BAD_GATEWAY
        };
        AppError::Upstream { status, message }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            AppError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, "invalid_request_error", message)
            }
            AppError::PayloadTooLarge => (
                StatusCode::PAYLOAD_TOO_LARGE,
                "invalid_request_error",
                "Request body too large".to_string(),
            ),
            AppError::AuthRequired => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                "Authorization header required".to_string(),
            ),
            AppError::AuthInvalid => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                "Invalid or expired token".to_string(),
            ),
            AppError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                "invalid_request_error",
                format!("{what} not found"),
            ),
            AppError::Conflict(message) => (StatusCode::CONFLICT, "invalid_request_error", message),
            AppError::NoUpstreamAvailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "api_error",
                "No upstream service available for this request".to_string(),
            ),
            AppError::Upstream { status, message } => (status, "api_error", message),
            AppError::Stream(message) => {
                error!("Stream error: {message}");
                (StatusCode::INTERNAL_SERVER_ERROR, "api_error", message)
            }
            AppError::Internal(message) => {
                error!("Internal error: {message}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "api_error",
                    "Internal server error".to_string(),
                )
            }
            AppError::Reqwest(err) => {
                error!("Upstream request error: {err}");
                (
                    StatusCode::BAD_GATEWAY,
                    "api_error",
                    format!("Upstream request failed: {err}"),
                )
            }
            AppError::SerdeJson(err) => {
                error!("Serde error: {err}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "api_error",
                    "Internal server error".to_string(),
                )
            }
            AppError::SseCodec(err) => {
                error!("SSE codec error: {err}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "api_error",
                    format!("SSE codec error: {err}"),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "message": message,
                "type": error_type,
            }
        }));

        (status, body).into_response()
    }
}

impl From<AppError> for std::io::Error {
    fn from(error: AppError) -> Self {
        std::io::Error::other(error)
    }
}
