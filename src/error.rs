//! Error types for genq.
//!
//! `NotFound` covers three situations: the task does not exist,
//! the caller may not see it, or the caller's worker no longer holds its lock.
//! A worker receiving it must drop whatever it is doing for that task.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("remote error (HTTP {status}): {message}")]
    Remote { status: u16, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether repeating the same request could succeed.
    ///
    /// Lifecycle and visibility errors are final for the request that caused
    /// them; only infrastructure failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Storage(_) | Error::Http(_) | Error::Io(_) => true,
            Error::Remote { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Stable machine-readable code, shared by the HTTP surface and the
    /// remote adapter so both topologies report errors identically.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::Validation(_) => "validation",
            Error::Unauthorized(_) => "unauthorized",
            _ => "internal",
        }
    }

    /// Rebuild an error from its code and message (inverse of [`Error::code`]).
    pub fn from_code(code: &str, message: String, status: u16) -> Self {
        match code {
            "not_found" => Error::NotFound(message),
            "conflict" => Error::Conflict(message),
            "validation" => Error::Validation(message),
            "unauthorized" => Error::Unauthorized(message),
            _ => Error::Remote { status, message },
        }
    }

    /// The message without the variant prefix added by `Display`.
    pub fn message(&self) -> String {
        match self {
            Error::NotFound(m)
            | Error::Conflict(m)
            | Error::Validation(m)
            | Error::Unauthorized(m)
            | Error::Config(m)
            | Error::Other(m) => m.clone(),
            Error::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
