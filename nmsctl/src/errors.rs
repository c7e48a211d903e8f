use crate::db::errors::DbError;
use crate::discovery::DiscoveryError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Invalid request data or business rule violation
    #[error("{message}")]
    BadRequest { message: String },

    /// Requested resource not found
    #[error("{resource} with ID {id} not found")]
    NotFound { resource: String, id: String },

    /// Generic internal service error
    #[error("Failed to {operation}")]
    Internal { operation: String },

    /// Database operation error
    #[error(transparent)]
    Database(#[from] DbError),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),

    /// The resource is in a state that forbids the operation
    #[error("Conflict: {message}")]
    Conflict { message: String },
}

impl Error {
    pub fn not_found(resource: &str, id: impl ToString) -> Self {
        Error::NotFound {
            resource: resource.to_string(),
            id: id.to_string(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Database(db_err) => match db_err {
                DbError::NotFound => StatusCode::NOT_FOUND,
                DbError::UniqueViolation { .. } => StatusCode::CONFLICT,
                DbError::ForeignKeyViolation { .. } => StatusCode::BAD_REQUEST,
                DbError::CheckViolation { .. } => StatusCode::BAD_REQUEST,
                DbError::InvalidState { .. } => StatusCode::CONFLICT,
                DbError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Conflict { .. } => StatusCode::CONFLICT,
        }
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::BadRequest { message } => message.clone(),
            Error::NotFound { resource, id } => format!("{resource} with ID {id} not found"),
            Error::Internal { .. } => "Internal server error".to_string(),
            Error::Database(db_err) => match db_err {
                DbError::NotFound => "Resource not found".to_string(),
                DbError::UniqueViolation { table, .. } => match table.as_deref() {
                    Some("credentials") => "A credential with this name already exists".to_string(),
                    Some("discoveries") => "A discovery with this name already exists".to_string(),
                    Some("monitors") => "This IP is already provisioned".to_string(),
                    _ => "Resource already exists".to_string(),
                },
                DbError::ForeignKeyViolation { table, .. } => match table.as_deref() {
                    Some("discovery_credentials") => "Unknown credential id".to_string(),
                    Some("credentials") => "Credential is still referenced by a discovery or monitor".to_string(),
                    _ => "Invalid reference to related resource".to_string(),
                },
                DbError::CheckViolation { .. } => "Invalid data provided".to_string(),
                DbError::InvalidState { .. } => db_err.to_string(),
                DbError::Other(_) => "Database error occurred".to_string(),
            },
            Error::Other(_) => "Internal server error".to_string(),
            Error::Conflict { message } => message.clone(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Log full error details for debugging - different log levels based on severity
        match &self {
            Error::Database(DbError::Other(_)) | Error::Internal { .. } | Error::Other(_) => {
                tracing::error!("Internal service error: {:#}", self);
            }
            Error::Database(_) => {
                tracing::warn!("Database constraint error: {}", self);
            }
            Error::BadRequest { .. } | Error::NotFound { .. } => {
                tracing::debug!("Client error: {}", self);
            }
            Error::Conflict { .. } => {
                tracing::warn!("Conflict error: {}", self);
            }
        }

        let status = self.status_code();
        (status, axum::response::Json(json!({ "message": self.user_message() }))).into_response()
    }
}

impl From<DiscoveryError> for Error {
    fn from(err: DiscoveryError) -> Self {
        match err {
            DiscoveryError::NotFound(id) => Error::not_found("Discovery", id),
            DiscoveryError::AlreadyRunning(id) => Error::Conflict {
                message: format!("Discovery {id} is already running"),
            },
            DiscoveryError::InvalidTarget { .. } => Error::BadRequest { message: err.to_string() },
            DiscoveryError::Store(e) => Error::Database(e),
        }
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::not_found("Discovery", 4).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            Error::Conflict {
                message: "running".to_string()
            }
            .status_code(),
            StatusCode::CONFLICT
        );
        let invalid_state = Error::Database(DbError::InvalidState {
            entity: "Discovery",
            id: "4".to_string(),
            reason: "status is COMPLETED".to_string(),
        });
        assert_eq!(invalid_state.status_code(), StatusCode::CONFLICT);
        assert_eq!(
            Error::Database(DbError::ForeignKeyViolation {
                constraint: None,
                table: Some("discovery_credentials".to_string()),
                message: String::new(),
            })
            .status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_internal_errors_do_not_leak() {
        let err = Error::Other(anyhow::anyhow!("connection refused to 10.1.1.1:5432"));
        assert_eq!(err.user_message(), "Internal server error");
        let err = Error::Database(DbError::Other(anyhow::anyhow!("syntax error at or near")));
        assert_eq!(err.user_message(), "Database error occurred");
    }
}
