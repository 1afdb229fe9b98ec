//! Error kinds shared by the HTTP facade and the tool surface.
//!
//! Internals propagate [`anyhow::Error`]; anything the caller can act on is
//! raised as a [`RagError`] inside that chain and recovered at the edge with
//! [`RagError::classify`]. Each kind maps to exactly one HTTP status and one
//! canonical message prefix, so logs and responses correlate.
//!
//! | Kind | Status | Prefix |
//! |------|--------|--------|
//! | `validation` | 400 | `VALIDATION_ERROR` |
//! | `rate_limited` | 429 | `RATE_LIMITED` |
//! | `not_found` | 404 | `NOT_FOUND` |
//! | `backend_unreachable` | 503 | `BACKEND_UNREACHABLE` |
//! | `backend_failed` | 500 | `BACKEND_FAILED` |
//! | `timeout` | 504 | `TIMEOUT` |
//! | `internal` | 500 | `INTERNAL_ERROR` |

use axum::http::StatusCode;
use serde::Serialize;

/// Machine-readable error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    RateLimited,
    NotFound,
    BackendUnreachable,
    BackendFailed,
    Timeout,
    Internal,
}

impl ErrorKind {
    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::BackendUnreachable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::BackendFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Canonical log-correlation prefix.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::RateLimited => "RATE_LIMITED",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::BackendUnreachable => "BACKEND_UNREACHABLE",
            ErrorKind::BackendFailed => "BACKEND_FAILED",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Internal => "INTERNAL_ERROR",
        }
    }
}

/// Errors that leave the core and reach a caller.
#[derive(Debug, thiserror::Error)]
pub enum RagError {
    #[error("VALIDATION_ERROR: {0}")]
    Validation(String),

    #[error("RATE_LIMITED: Rate limit exceeded. Try again in {retry_after_secs} seconds.")]
    RateLimited { retry_after_secs: u64 },

    #[error("NOT_FOUND: {0}")]
    NotFound(String),

    #[error("BACKEND_UNREACHABLE: {0}")]
    BackendUnreachable(String),

    #[error("BACKEND_FAILED: {0}")]
    BackendFailed(String),

    #[error("TIMEOUT: {0}")]
    Timeout(String),

    #[error("INTERNAL_ERROR: {0}")]
    Internal(String),
}

impl RagError {
    pub fn validation(message: impl Into<String>) -> Self {
        RagError::Validation(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RagError::Validation(_) => ErrorKind::Validation,
            RagError::RateLimited { .. } => ErrorKind::RateLimited,
            RagError::NotFound(_) => ErrorKind::NotFound,
            RagError::BackendUnreachable(_) => ErrorKind::BackendUnreachable,
            RagError::BackendFailed(_) => ErrorKind::BackendFailed,
            RagError::Timeout(_) => ErrorKind::Timeout,
            RagError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.kind().status()
    }

    /// The message without its canonical prefix.
    pub fn message(&self) -> String {
        match self {
            RagError::RateLimited { retry_after_secs } => format!(
                "Rate limit exceeded. Try again in {} seconds.",
                retry_after_secs
            ),
            RagError::Validation(m)
            | RagError::NotFound(m)
            | RagError::BackendUnreachable(m)
            | RagError::BackendFailed(m)
            | RagError::Timeout(m)
            | RagError::Internal(m) => m.clone(),
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RagError::BackendUnreachable(_) | RagError::Timeout(_) | RagError::RateLimited { .. }
        )
    }

    /// Recovers the typed error from an `anyhow` chain.
    ///
    /// A `RagError` anywhere in the chain wins. Otherwise `sqlx` pool and
    /// I/O failures mean the store is unreachable, other `sqlx` errors mean
    /// it answered with a failure, and `reqwest` failures are treated the
    /// same way for remote backends. Anything else is internal.
    pub fn classify(err: anyhow::Error) -> RagError {
        let err = match err.downcast::<RagError>() {
            Ok(rag) => return rag,
            Err(err) => err,
        };

        for cause in err.chain() {
            if let Some(rag) = cause.downcast_ref::<RagError>() {
                return rag.clone_shallow();
            }
            if let Some(db) = cause.downcast_ref::<sqlx::Error>() {
                return match db {
                    sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed => RagError::BackendUnreachable(err.to_string()),
                    _ => RagError::BackendFailed(err.to_string()),
                };
            }
            if let Some(http) = cause.downcast_ref::<reqwest::Error>() {
                return if http.is_timeout() {
                    RagError::Timeout(err.to_string())
                } else if http.is_connect() {
                    RagError::BackendUnreachable(err.to_string())
                } else {
                    RagError::BackendFailed(err.to_string())
                };
            }
        }

        RagError::Internal(err.to_string())
    }

    fn clone_shallow(&self) -> RagError {
        match self {
            RagError::Validation(m) => RagError::Validation(m.clone()),
            RagError::RateLimited { retry_after_secs } => RagError::RateLimited {
                retry_after_secs: *retry_after_secs,
            },
            RagError::NotFound(m) => RagError::NotFound(m.clone()),
            RagError::BackendUnreachable(m) => RagError::BackendUnreachable(m.clone()),
            RagError::BackendFailed(m) => RagError::BackendFailed(m.clone()),
            RagError::Timeout(m) => RagError::Timeout(m.clone()),
            RagError::Internal(m) => RagError::Internal(m.clone()),
        }
    }
}
