use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel_async::pooled_connection::PoolError;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// A single field-level problem found while validating a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldIssue {
    pub field: String,
    pub message: String,
}

impl FieldIssue {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("validation failed")]
    Validation(Vec<FieldIssue>),

    #[error("email is already registered")]
    DuplicateEmail,

    #[error("username is already taken")]
    DuplicateUsername,

    #[error("invalid email or password")]
    InvalidCredentials,

    #[error("account is disabled")]
    AccountDisabled,

    #[error("authentication required")]
    Unauthenticated,

    #[error("session expired or invalid")]
    InvalidSession,

    #[error("forbidden: {0}")]
    Forbidden(&'static str),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("insufficient stock: {available} available, {requested} requested")]
    InsufficientStock { available: i32, requested: i32 },

    #[error("cannot move from `{from}` to `{to}`")]
    InvalidTransition { from: String, to: String },

    #[error("{0}")]
    Conflict(&'static str),

    #[error("database error: {0}")]
    Database(#[from] DieselError),

    #[error("connection pool error: {0}")]
    Pool(#[from] bb8::RunError<PoolError>),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issues: Option<Vec<FieldIssue>>,
}

impl AppError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        AppError::Validation(vec![FieldIssue::new(field, message)])
    }

    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        AppError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Failures of the infrastructure rather than of the caller's request.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            AppError::Database(_) | AppError::Pool(_) | AppError::Internal(_)
        )
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::InvalidCredentials | AppError::Unauthenticated | AppError::InvalidSession => {
                StatusCode::UNAUTHORIZED
            }
            AppError::Forbidden(_) | AppError::AccountDisabled => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::DuplicateEmail
            | AppError::DuplicateUsername
            | AppError::InsufficientStock { .. }
            | AppError::InvalidTransition { .. }
            | AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Database(_) | AppError::Pool(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Maps unique-constraint races on `users` back to the domain errors the
/// pre-insert checks would have produced.
pub fn map_user_conflict(err: DieselError) -> AppError {
    let duplicate = match &err {
        DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
            match info.constraint_name() {
                Some("users_email_key") => Some(AppError::DuplicateEmail),
                Some("users_username_key") => Some(AppError::DuplicateUsername),
                _ => None,
            }
        }
        _ => None,
    };
    duplicate.unwrap_or(AppError::Database(err))
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match &self {
            AppError::Validation(issues) => ErrorResponse {
                error: self.to_string(),
                issues: Some(issues.clone()),
            },
            _ if self.is_internal() => {
                error!("Request failed: {}", self);
                ErrorResponse {
                    error: "internal server error".to_string(),
                    issues: None,
                }
            }
            _ => ErrorResponse {
                error: self.to_string(),
                issues: None,
            },
        };

        (status, Json(body)).into_response()
    }
}
