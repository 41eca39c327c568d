use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use thiserror::Error;
use tracing::error;
use std::fmt::Display;
use uuid::Uuid;

use crate::api::SetGenericResponse;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database execution error: {0}")]
    DatabaseExecution(#[from] scylla::errors::ExecutionError),

    #[error("Database result error: {0}")]
    DatabaseIntoRows(#[from] scylla::errors::IntoRowsResultError),

    #[error("Database row error: {0}")]
    DatabaseRows(#[from] scylla::errors::RowsError),

    #[error("Database row error: {0}")]
    DatabaseFirstRow(#[from] scylla::errors::MaybeFirstRowError),

    #[error("Database Deserialization error: {0}")]
    DatabaseDeserialization(#[from] scylla::errors::DeserializationError),

    #[error("Database connection error: {0}")]
    DatabaseConnect(#[from] scylla::errors::NewSessionError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    Conflict(String),

    #[error("Session expired")]
    Expired,

    // Unknown email and wrong password both land here.
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Email address has not been validated")]
    EmailNotValidated,

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Granting {access} to user {user_id} failed after {} grants: {source}", .granted.len())]
    PartialGrant {
        user_id: Uuid,
        access: String,
        granted: Vec<String>,
        #[source]
        source: Box<AppError>,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    pub fn not_found(what: impl Display) -> Self {
        AppError::NotFound(what.to_string())
    }

    pub fn conflict(what: impl Display) -> Self {
        AppError::Conflict(what.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, AppError::Conflict(_))
    }

    /// Message that is safe to hand back to an HTTP client.
    pub(crate) fn public_message(&self) -> String {
        match self {
            AppError::NotFound(_)
            | AppError::Conflict(_)
            | AppError::Expired
            | AppError::InvalidCredentials
            | AppError::EmailNotValidated
            | AppError::ValidationFailed(_) => self.to_string(),
            AppError::PartialGrant { access, .. } => format!("Failed to grant {}", access),
            _ => "Internal server error".to_string(),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Expired | AppError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            AppError::EmailNotValidated => StatusCode::FORBIDDEN,
            AppError::ValidationFailed(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        if self.status_code().is_server_error() {
            error!("Request failed: {}", self);
        }
        HttpResponse::build(self.status_code()).json(SetGenericResponse {
            success: false,
            error_message: Some(self.public_message()),
        })
    }
}


pub trait TraceErr<T, E> {
    #[track_caller]
    fn trace_err(self, context: &'static str) -> std::result::Result<T, E>;
    fn trace(self) -> std::result::Result<T, E>;
}

impl<T, E: Display> TraceErr<T, E> for std::result::Result<T, E> {
    #[track_caller]
    fn trace_err(self, context: &'static str) -> std::result::Result<T, E> {
        if let Err(ref e) = self {
            let location = std::panic::Location::caller();
            error!(
                "{}:{}: error in {}: {}",
                location.file(),
                location.line(),
                context,
                e
            );
        }
        self
    }

    #[track_caller]
    fn trace(self) -> std::result::Result<T, E> {
        if let Err(ref e) = self {
            let location = std::panic::Location::caller();
            error!(
                "{}:{}: error: {}",
                location.file(),
                location.line(),
                e
            );
        }
        self
    }

}
