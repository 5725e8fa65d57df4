use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use strum::{Display, EnumString};
use thiserror::Error;

/// Errors surfaced by the admin HTTP surface.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("Internal server error")]
    Internal,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message): (StatusCode, String) = match self {
            AppError::Auth(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            AppError::RateLimited(msg) => (StatusCode::TOO_MANY_REQUESTS, msg),
            AppError::Internal => {
                tracing::error!("internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".into(),
                )
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Coarse error codes carried on the client-visible `error` frame.
///
/// Never leaks verifier or internal details — only this discriminant plus a
/// human-readable message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum ErrorType {
    #[strum(serialize = "AUTHENTICATION_FAILED")]
    #[serde(rename = "AUTHENTICATION_FAILED")]
    AuthenticationFailed,
    #[strum(serialize = "CONNECTION_LIMIT_EXCEEDED")]
    #[serde(rename = "CONNECTION_LIMIT_EXCEEDED")]
    ConnectionLimitExceeded,
    #[strum(serialize = "RATE_LIMIT_EXCEEDED")]
    #[serde(rename = "RATE_LIMIT_EXCEEDED")]
    RateLimitExceeded,
    #[strum(serialize = "INVALID_MESSAGE_FORMAT")]
    #[serde(rename = "INVALID_MESSAGE_FORMAT")]
    InvalidMessageFormat,
    #[strum(serialize = "RECIPIENT_NOT_FOUND")]
    #[serde(rename = "RECIPIENT_NOT_FOUND")]
    RecipientNotFound,
    #[strum(serialize = "ENCRYPTION_ERROR")]
    #[serde(rename = "ENCRYPTION_ERROR")]
    EncryptionError,
    #[strum(serialize = "SERVER_ERROR")]
    #[serde(rename = "SERVER_ERROR")]
    ServerError,
}

/// The `{errorType, message}` frame sent to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorFrame {
    #[serde(rename = "errorType")]
    pub error_type: ErrorType,
    pub message: String,
}

impl ErrorFrame {
    pub fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;

    async fn body_json(body: Body) -> serde_json::Value {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn auth_error_returns_401() {
        let response = AppError::Auth("unauthorized".into()).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn validation_error_returns_400() {
        let response = AppError::Validation("invalid input".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn not_found_error_returns_404() {
        let response = AppError::NotFound("agent not found".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn internal_error_returns_500() {
        let response = AppError::Internal.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn auth_error_body_has_error_key() {
        let response = AppError::Auth("bad token".into()).into_response();
        let json = body_json(response.into_body()).await;
        assert_eq!(json["error"], "bad token");
    }

    #[test]
    fn error_frame_serializes_error_type_as_screaming_snake_case() {
        let frame = ErrorFrame::new(ErrorType::RateLimitExceeded, "slow down");
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["errorType"], "RATE_LIMIT_EXCEEDED");
        assert_eq!(value["message"], "slow down");
    }
}
