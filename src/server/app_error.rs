use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::IntoResponse,
};
use tracing::warn;

use crate::{event::ValidationError, queue::QueueError, report::ReportError, storage::StoreError};

/// Error type for the REST API.
///
/// This error type is used to convert errors into HTTP responses.
/// The standard error response looks like this:
///
/// ```json
/// {
///     "error": "ERROR_CODE",
///     "message": "Error message",
///     "field": "site_id"
/// }
/// ```
///
/// `field` is only present for validation errors.
#[derive(Debug, thiserror::Error, strum::AsRefStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum AppError {
    #[error("{0}")]
    Validation(ValidationError),

    #[error("{0}")]
    MalformedBody(String),

    #[error("site_id is required")]
    MissingSiteId,

    #[error("date must be YYYY-MM-DD")]
    InvalidDate,

    #[error("queue_error: {0}")]
    QueueUnavailable(String),

    #[error("{0}")]
    Query(String),
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::MalformedBody(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            AppError::MissingSiteId | AppError::InvalidDate => StatusCode::BAD_REQUEST,
            AppError::QueueUnavailable(_) | AppError::Query(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Converts errors into HTTP responses.
impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        // Error code is the enum variant name in SCREAMING_SNAKE_CASE.
        let error_code = self.as_ref();
        let message = self.to_string();
        let status_code = self.status_code();
        let mut json = serde_json::json!({ "error": error_code, "message": message });
        if let AppError::Validation(error) = &self {
            json["field"] = serde_json::Value::from(error.field);
        }

        warn!("Returning error {error_code}: {message}");
        (status_code, Json(json)).into_response()
    }
}

impl From<ValidationError> for AppError {
    fn from(error: ValidationError) -> Self {
        AppError::Validation(error)
    }
}

/// Body that is not JSON, or has fields of the wrong type.
impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::MalformedBody(rejection.body_text())
    }
}

impl From<QueueError> for AppError {
    fn from(error: QueueError) -> Self {
        AppError::QueueUnavailable(error.to_string())
    }
}

impl From<ReportError> for AppError {
    fn from(error: ReportError) -> Self {
        match error {
            ReportError::MissingSiteId => AppError::MissingSiteId,
            ReportError::InvalidDate => AppError::InvalidDate,
            ReportError::Store(error) => AppError::from(error),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(error: StoreError) -> Self {
        AppError::Query(error.to_string())
    }
}
