//! # Error Handling and Result Types
//!
//! This module defines the error taxonomy shared by every backend, the
//! workflow and the sync scheduler.
//!
//! ## Key Types
//!
//! - [`AppError`]: Main error enum covering all failures the core can produce
//! - [`ErrorCode`]: Machine-readable classification with an HTTP-style status
//! - [`AppResult<T>`]: Convenience type alias for Results using `AppError`
//!
//! ## Error Classifications
//!
//! - **Validation Errors** (400): bad or missing metadata, unparseable config
//! - **Conflict** (409): duplicate package identifier, package already stored
//! - **Lock Timeout** (423): the per-package upload lock was not acquired in time
//! - **Backend Unavailable** (503): the instance failed its readiness check
//! - **Auth Errors** (401): rejected or missing credentials
//! - **Not Found** (404): unknown instance, distribution or package
//! - **Internal Errors** (500): anything unexpected; recorded into backend state
//!
//! Callers branch on [`AppError::error_code`] rather than on message text.
//!
//! ## Usage
//!
//! ```rust
//! use privindex_server::error::{AppError, AppResult, ErrorCode};
//!
//! fn check_distrib(distrib: &str) -> AppResult<()> {
//!     if distrib.is_empty() {
//!         return Err(AppError::BadRequest("Cannot generate the distribution name.".to_string()));
//!     }
//!     Ok(())
//! }
//!
//! let err = check_distrib("").unwrap_err();
//! assert_eq!(err.error_code(), ErrorCode::ValidationError);
//! ```

use serde::Serialize;

/// Error code classification for machine-readable error types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ValidationError,
    Conflict,
    LockTimeout,
    BackendUnavailable,
    AuthError,
    NotFound,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "validation_error",
            ErrorCode::Conflict => "conflict",
            ErrorCode::LockTimeout => "lock_timeout",
            ErrorCode::BackendUnavailable => "backend_unavailable",
            ErrorCode::AuthError => "auth_error",
            ErrorCode::NotFound => "not_found",
            ErrorCode::InternalError => "internal_error",
        }
    }

    /// Numeric status an outer HTTP layer should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::ValidationError => 400,
            ErrorCode::Conflict => 409,
            ErrorCode::LockTimeout => 423,
            ErrorCode::BackendUnavailable => 503,
            ErrorCode::AuthError => 401,
            ErrorCode::NotFound => 404,
            ErrorCode::InternalError => 500,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Application-specific error types with error codes
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    LockTimeout(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Internal server error: {0}")]
    InternalError(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AppError {
    /// Get the appropriate error code for this error type
    pub fn error_code(&self) -> ErrorCode {
        match self {
            AppError::BadRequest(_) | AppError::TomlDe(_) => ErrorCode::ValidationError,
            AppError::Conflict(_) => ErrorCode::Conflict,
            AppError::LockTimeout(_) => ErrorCode::LockTimeout,
            AppError::Unavailable(_) => ErrorCode::BackendUnavailable,
            AppError::Unauthorized(_) => ErrorCode::AuthError,
            AppError::NotFound(_) => ErrorCode::NotFound,
            AppError::InternalError(_)
            | AppError::Io(_)
            | AppError::TomlSer(_)
            | AppError::Anyhow(_) => ErrorCode::InternalError,
        }
    }

    /// Whether this failure is part of the expected taxonomy (validation,
    /// conflict, contention, auth, lookup) rather than an unexpected fault.
    pub fn is_expected(&self) -> bool {
        !matches!(self.error_code(), ErrorCode::InternalError)
    }
}

/// Convenient result type for application operations.
pub type AppResult<T> = Result<T, AppError>;
