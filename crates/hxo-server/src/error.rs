//! Mapping from orchestrator errors to HTTP responses

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use hxo_core::HxoError;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Core(#[from] HxoError),

    #[error("missing or malformed bearer token")]
    Unauthorized,

    #[error("not permitted: {0}")]
    Forbidden(String),

    #[error("event stream is not enabled")]
    EventsDisabled,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Core(e) => match e {
                HxoError::Validation(_) | HxoError::Partition(_) => {
                    (StatusCode::BAD_REQUEST, "validation")
                }
                HxoError::PlanNotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
                HxoError::InvalidTransition(_) => (StatusCode::CONFLICT, "invalid_transition"),
                HxoError::Unavailable(_) | HxoError::CheckpointIo(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
                }
                HxoError::Disabled => (StatusCode::SERVICE_UNAVAILABLE, "disabled"),
                HxoError::Certification(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "certification")
                }
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
            },
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            ApiError::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden"),
            ApiError::EventsDisabled => (StatusCode::NOT_FOUND, "events_disabled"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            error!("request failed: {}", self);
        }
        let body = ErrorResponse {
            error: self.to_string(),
            code,
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ApiError::from(HxoError::Validation("x".into())), StatusCode::BAD_REQUEST),
            (ApiError::from(HxoError::PlanNotFound("p".into())), StatusCode::NOT_FOUND),
            (ApiError::from(HxoError::Disabled), StatusCode::SERVICE_UNAVAILABLE),
            (
                ApiError::from(HxoError::CheckpointIo("disk".into())),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (ApiError::Unauthorized, StatusCode::UNAUTHORIZED),
            (ApiError::Forbidden("abort".into()), StatusCode::FORBIDDEN),
        ];
        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }
}
