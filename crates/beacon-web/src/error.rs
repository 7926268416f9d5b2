//! Error types for the HTTP API.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use beacon_scheduler::SchedulerError;

/// Errors returned to API clients as `{"error": message}`.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request body or query could not be used.
    #[error("{0}")]
    BadRequest(String),

    /// The request body was larger than allowed.
    #[error("{0}")]
    PayloadTooLarge(String),

    #[error("not found")]
    NotFound,

    #[error("{0}")]
    Conflict(String),

    /// The client exhausted its request budget.
    #[error("too many requests, retry in {retry_after}s")]
    TooManyRequests { retry_after: u64 },

    #[error("internal error")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::Invalid(v) => Self::BadRequest(v.to_string()),
            SchedulerError::TaskNotFound(_) => Self::NotFound,
            SchedulerError::TaskExists(id) => Self::Conflict(format!("task already exists: {id}")),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Internal(detail) = &self {
            error!(error = %detail, "request failed");
        }
        let mut response =
            (self.status(), Json(json!({ "error": self.to_string() }))).into_response();
        if let Self::TooManyRequests { retry_after } = self {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        }
        response
    }
}
