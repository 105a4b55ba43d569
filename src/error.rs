use crate::db::DbError;
use crate::llm::LlmError;
use crate::storage::StorageError;
use axum::extract::multipart::MultipartError;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("validation failed")]
    Validation(Vec<FieldError>),
    #[error("{0}")]
    BadRequest(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("no API key supplied for provider {0}")]
    MissingApiKey(String),
    #[error("forbidden")]
    Forbidden,
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("expired")]
    Expired,
    #[error("file exceeds the {0} byte limit")]
    PayloadTooLarge(usize),
    #[error("unsupported file type: {0}")]
    UnsupportedMediaType(String),
    #[error("provider error: {0}")]
    Provider(#[from] LlmError),
    #[error("database error: {0}")]
    Database(DbError),
    #[error("storage error: {0}")]
    Storage(StorageError),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    pub fn field(field: &str, message: impl Into<String>) -> Self {
        AppError::Validation(vec![FieldError::new(field, message)])
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized | AppError::MissingApiKey(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Expired => StatusCode::GONE,
            AppError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            AppError::Provider(LlmError::Api { status, .. }) => match *status {
                400..=499 => StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY),
                _ => StatusCode::BAD_GATEWAY,
            },
            AppError::Provider(_) => StatusCode::BAD_GATEWAY,
            AppError::Database(_) | AppError::Storage(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Message shown to the client. Server-side failures stay generic.
    pub fn client_message(&self) -> String {
        match self {
            AppError::Provider(LlmError::Api { message, .. }) => message.clone(),
            AppError::Provider(LlmError::Http(_)) => "provider unreachable".to_string(),
            AppError::Provider(err) => err.to_string(),
            AppError::Database(_) | AppError::Storage(_) | AppError::Internal(_) => {
                "internal server error".to_string()
            }
            other => other.to_string(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Vec<FieldError>>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Internal error: {:#}", self);
        } else {
            tracing::debug!(status = status.as_u16(), "request failed: {}", self);
        }

        let details = match &self {
            AppError::Validation(fields) => Some(fields.clone()),
            _ => None,
        };
        let body = ErrorBody {
            error: self.client_message(),
            details,
        };
        (status, Json(body)).into_response()
    }
}

impl From<DbError> for AppError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(what) => AppError::NotFound(what.to_string()),
            DbError::Conflict(msg) => AppError::Conflict(msg),
            DbError::Invalid(msg) => AppError::BadRequest(msg),
            DbError::Expired(_) => AppError::Expired,
            other => AppError::Database(other),
        }
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(_) => AppError::NotFound("file".to_string()),
            other => AppError::Storage(other),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::field("body", rejection.body_text())
    }
}

impl From<MultipartError> for AppError {
    fn from(err: MultipartError) -> Self {
        AppError::BadRequest(err.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_errors_map_to_statuses() {
        assert_eq!(
            AppError::from(DbError::NotFound("conversation")).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::from(DbError::Conflict("branch exists".into())).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::from(DbError::Invalid("main cannot be deleted".into())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(AppError::from(DbError::Expired("share")).status(), StatusCode::GONE);
        assert_eq!(
            AppError::from(DbError::Poisoned).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_provider_errors_keep_client_statuses() {
        let err = AppError::Provider(LlmError::Api {
            status: 429,
            message: "Rate limit reached".into(),
        });
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.client_message(), "Rate limit reached");

        let err = AppError::Provider(LlmError::Api {
            status: 503,
            message: "overloaded".into(),
        });
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_internal_errors_hide_detail() {
        let err = AppError::Internal("disk on fire".into());
        assert_eq!(err.client_message(), "internal server error");
        assert_eq!(AppError::Expired.client_message(), "expired");
    }
}
