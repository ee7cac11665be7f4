use crate::services::{backend::BackendError, load_balancer::ProxyError};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Failure of a control-plane operation.
///
/// `Validation` and `NotFound` abort before (or instead of) any mutation.
/// `Store` aborts the whole unit of work. `Backend` and `Proxy` are fatal only
/// where the caller propagates them; cleanup paths downgrade them to warnings.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] sqlx::Error),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error("policy `{policy}` holds a value of the wrong shape: {source}")]
    Decode {
        policy: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }
}

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

/// Collapse the service taxonomy into a generic 4xx/5xx. The detailed kind
/// only goes to the log.
impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match &err {
            ServiceError::Validation(_) => {
                tracing::info!(error = %err, "rejected request");
                AppError::bad_request("Bad Request")
            }
            ServiceError::NotFound(_) => {
                tracing::info!(error = %err, "rejected request");
                AppError::not_found("Not Found")
            }
            _ => {
                tracing::error!(error = %err, "request failed");
                AppError::internal("Internal Server Error")
            }
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        ServiceError::from(err).into()
    }
}
