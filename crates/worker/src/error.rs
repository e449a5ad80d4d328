use axum::{Json, http::StatusCode, response::IntoResponse};
use chanlink_domain::token::TokenError;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not found")]
    NotFound,
    #[error("channel must be re-authorized: {0}")]
    ReauthorizationRequired(String),
    #[error("temporarily unavailable: {0}")]
    Unavailable(String),
    #[error("internal error")]
    Internal,
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::ReauthorizationRequired(_) => StatusCode::CONFLICT,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "validation_error",
            ApiError::NotFound => "not_found",
            ApiError::ReauthorizationRequired(_) => "reauthorization_required",
            ApiError::Unavailable(_) => "unavailable",
            ApiError::Internal => "internal_error",
        }
    }
}

impl From<TokenError> for ApiError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::NotFound => ApiError::NotFound,
            TokenError::Unrecoverable(reason) => ApiError::ReauthorizationRequired(reason),
            TokenError::Validation(message) => ApiError::Validation(message),
            TokenError::InvalidState => ApiError::Validation(err.to_string()),
            TokenError::TemporarilyUnavailable
            | TokenError::ProviderTransient(_)
            | TokenError::Store(_) => ApiError::Unavailable(err.to_string()),
            TokenError::Configuration(message) => {
                tracing::error!(error = %message, "token lifecycle misconfigured");
                ApiError::Internal
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let message = self.to_string();
        let body = ErrorEnvelope {
            error: ErrorBody {
                code: self.error_code(),
                message,
            },
        };
        (status, Json(body)).into_response()
    }
}
