//! Gateway Error Taxonomy
//!
//! Every failure that leaves an operation family is classified into one of
//! the kinds below before it reaches the client. Each kind has a stable HTTP
//! status and renders as `{ "error": "<Kind>[.<Variant>]", "message": ... }`.
//!
//! Messages are written for the client; underlying OS or parser errors are
//! logged where they occur and never carried into these variants.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Authentication and authorization failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Authentication required")]
    Unauthenticated,

    #[error("Missing or invalid XSRF token")]
    InvalidXsrf,

    #[error("Access denied")]
    Forbidden,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Too many login attempts")]
    RateLimited,
}

/// Process control failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessError {
    #[error("Process not found")]
    NotFound,

    #[error("Process is already running")]
    AlreadyRunning,

    #[error("Process may not be targeted")]
    Forbidden,

    #[error("Process did not respond in time")]
    Timeout,

    #[error("Process command failed")]
    Failed,
}

/// Certificate management failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CertificateError {
    #[error("Private key does not match the certificate")]
    KeyMismatch,

    #[error("{0}")]
    Invalid(String),

    #[error("No certificate is installed")]
    Missing,

    #[error("Certificate storage failed")]
    IoFailure,
}

/// Configuration store failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Invalid(String),

    #[error("Configuration changed concurrently, try again")]
    WriteConflict,

    #[error("Configuration storage failed")]
    IoFailure,
}

/// Top-level error returned by the request pipeline
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Not found")]
    RouteNotFound,

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Certificate(#[from] CertificateError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Operation timed out")]
    Timeout,

    #[error("Internal error")]
    Internal,
}

impl GatewayError {
    /// Stable error kind reported in the `error` field
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::RouteNotFound => "RouteNotFound",
            GatewayError::Auth(e) => match e {
                AuthError::Unauthenticated => "AuthError.Unauthenticated",
                AuthError::InvalidXsrf => "AuthError.InvalidXsrf",
                AuthError::Forbidden => "AuthError.Forbidden",
                AuthError::InvalidCredentials => "AuthError.InvalidCredentials",
                AuthError::RateLimited => "AuthError.RateLimited",
            },
            GatewayError::UnsupportedOperation(_) => "UnsupportedOperation",
            GatewayError::BadRequest(_) => "BadRequest",
            GatewayError::Process(e) => match e {
                ProcessError::NotFound => "ProcessError.NotFound",
                ProcessError::AlreadyRunning => "ProcessError.AlreadyRunning",
                ProcessError::Forbidden => "ProcessError.Forbidden",
                ProcessError::Timeout => "ProcessError.Timeout",
                ProcessError::Failed => "ProcessError.Failed",
            },
            GatewayError::Certificate(e) => match e {
                CertificateError::KeyMismatch => "CertificateError.KeyMismatch",
                CertificateError::Invalid(_) => "CertificateError.Invalid",
                CertificateError::Missing => "CertificateError.Missing",
                CertificateError::IoFailure => "CertificateError.IOFailure",
            },
            GatewayError::Config(e) => match e {
                ConfigError::NotFound(_) => "ConfigError.NotFound",
                ConfigError::Invalid(_) => "ConfigError.Invalid",
                ConfigError::WriteConflict => "ConfigError.WriteConflict",
                ConfigError::IoFailure => "ConfigError.IOFailure",
            },
            GatewayError::Timeout => "Timeout",
            GatewayError::Internal => "Internal",
        }
    }

    /// HTTP status for this error kind
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::RouteNotFound => StatusCode::NOT_FOUND,
            GatewayError::Auth(e) => match e {
                AuthError::Unauthenticated | AuthError::InvalidCredentials => {
                    StatusCode::UNAUTHORIZED
                }
                AuthError::InvalidXsrf | AuthError::Forbidden => StatusCode::FORBIDDEN,
                AuthError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            },
            GatewayError::UnsupportedOperation(_) | GatewayError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::Process(e) => match e {
                ProcessError::NotFound => StatusCode::NOT_FOUND,
                ProcessError::AlreadyRunning => StatusCode::CONFLICT,
                ProcessError::Forbidden => StatusCode::FORBIDDEN,
                ProcessError::Timeout => StatusCode::GATEWAY_TIMEOUT,
                ProcessError::Failed => StatusCode::BAD_GATEWAY,
            },
            GatewayError::Certificate(e) => match e {
                CertificateError::KeyMismatch | CertificateError::Invalid(_) => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                CertificateError::Missing => StatusCode::NOT_FOUND,
                CertificateError::IoFailure => StatusCode::INTERNAL_SERVER_ERROR,
            },
            GatewayError::Config(e) => match e {
                ConfigError::NotFound(_) => StatusCode::NOT_FOUND,
                ConfigError::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
                ConfigError::WriteConflict => StatusCode::CONFLICT,
                ConfigError::IoFailure => StatusCode::INTERNAL_SERVER_ERROR,
            },
            GatewayError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error response format
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            error: self.kind().to_string(),
            message: self.to_string(),
        });

        (self.status(), body).into_response()
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        GatewayError::from(self).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[test]
    fn test_kinds_are_qualified() {
        assert_eq!(
            GatewayError::from(AuthError::InvalidXsrf).kind(),
            "AuthError.InvalidXsrf"
        );
        assert_eq!(
            GatewayError::from(ProcessError::Forbidden).kind(),
            "ProcessError.Forbidden"
        );
        assert_eq!(
            GatewayError::from(CertificateError::IoFailure).kind(),
            "CertificateError.IOFailure"
        );
        assert_eq!(GatewayError::RouteNotFound.kind(), "RouteNotFound");
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            GatewayError::from(AuthError::Unauthenticated).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GatewayError::from(AuthError::InvalidXsrf).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            GatewayError::from(ConfigError::WriteConflict).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(GatewayError::Timeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            GatewayError::UnsupportedOperation("frobnicate".into()).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn test_error_body_shape() {
        let response = GatewayError::from(CertificateError::KeyMismatch).into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(json["error"], "CertificateError.KeyMismatch");
        assert_eq!(json["message"], "Private key does not match the certificate");
        assert_eq!(json.as_object().unwrap().len(), 2);
    }

    #[test]
    fn test_internal_message_is_generic() {
        assert_eq!(GatewayError::Internal.to_string(), "Internal error");
        assert_eq!(
            GatewayError::from(ConfigError::IoFailure).to_string(),
            "Configuration storage failed"
        );
    }
}
