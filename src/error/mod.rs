//! Error handling for idswap.
//!
//! This module provides:
//! - [`IdError`]: The main error enum for all idswap operations
//! - [`ErrorCode`]: Standardized error codes for machine parsing
//! - [`StructuredError`]: Rich error type with suggestions and context

mod codes;
mod suggestions;

use std::io;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use codes::ErrorCode;
pub use suggestions::suggest_for_error;

/// Main error type for idswap operations.
#[derive(Error, Debug)]
pub enum IdError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Platform unavailable: {0}")]
    PlatformUnavailable(String),

    #[error("Write verification failed: expected {expected}, read back {actual}")]
    WriteVerificationFailed { expected: String, actual: String },

    #[error("Journal unavailable: {0}")]
    JournalUnavailable(String),

    #[error("Backup contention: {0}")]
    BackupContention(String),

    #[error("Revert schedule registration failed: {0}")]
    ScheduleRegistrationFailed(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Operation requires approval: {0}")]
    ApprovalRequired(String),

    #[error("Lock failed: {0}")]
    LockFailed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A failure reported back from the worker thread.
    #[error("{}", .0.message)]
    Job(StructuredError),
}

impl IdError {
    /// Get the error code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::PermissionDenied(_) => ErrorCode::PermissionDenied,
            Self::ResourceNotFound(_) => ErrorCode::ResourceNotFound,
            Self::PlatformUnavailable(_) => ErrorCode::PlatformUnavailable,
            Self::WriteVerificationFailed { .. } => ErrorCode::WriteVerificationFailed,
            Self::JournalUnavailable(_) => ErrorCode::JournalUnavailable,
            Self::BackupContention(_) => ErrorCode::BackupContention,
            Self::ScheduleRegistrationFailed(_) => ErrorCode::ScheduleRegistrationFailed,
            Self::Cancelled(_) => ErrorCode::Cancelled,
            Self::Database(_) => ErrorCode::DatabaseError,
            Self::Io(_) => ErrorCode::IoError,
            Self::Json(_) => ErrorCode::SerializationError,
            Self::Config(_) => ErrorCode::ConfigInvalid,
            Self::ValidationFailed(_) => ErrorCode::ValidationFailed,
            Self::ApprovalRequired(_) => ErrorCode::ApprovalRequired,
            Self::LockFailed(_) => ErrorCode::LockFailed,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Job(err) => err.code,
        }
    }

    /// Get context information for this error as JSON.
    #[must_use]
    pub fn context(&self) -> Option<Value> {
        match self {
            Self::ResourceNotFound(resource) => Some(serde_json::json!({ "resource": resource })),
            Self::WriteVerificationFailed { expected, actual } => {
                Some(serde_json::json!({ "expected": expected, "actual": actual }))
            }
            _ => None,
        }
    }

    /// Convert this error to a structured error.
    #[must_use]
    pub fn to_structured(&self) -> StructuredError {
        match self {
            Self::Job(err) => err.clone(),
            _ => StructuredError::from_id_error(self),
        }
    }
}

/// A structured error with machine-readable code, suggestion, and context.
///
/// This is what crosses the worker channel and what robot mode prints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredError {
    /// The error code (e.g., "PERMISSION_DENIED")
    pub code: ErrorCode,

    /// The numeric error code (e.g., 101)
    pub numeric_code: u16,

    /// Human-readable error message
    pub message: String,

    /// Actionable suggestion for recovery
    pub suggestion: String,

    /// Additional context for debugging
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,

    /// Whether this error is potentially recoverable by the user
    pub recoverable: bool,

    /// Error category (e.g., "mutation", "journal")
    pub category: String,
}

impl StructuredError {
    /// Create a new structured error.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            numeric_code: code.numeric(),
            suggestion: code.suggestion().to_string(),
            context: None,
            recoverable: code.is_recoverable(),
            category: code.category().to_string(),
            code,
            message: message.into(),
        }
    }

    /// Create a structured error from an `IdError`.
    #[must_use]
    pub fn from_id_error(err: &IdError) -> Self {
        let code = err.code();
        let context = err.context();
        let suggestion = suggest_for_error(code, context.as_ref());

        Self {
            code,
            numeric_code: code.numeric(),
            message: err.to_string(),
            suggestion,
            context,
            recoverable: code.is_recoverable(),
            category: code.category().to_string(),
        }
    }

    /// Add context to this error.
    #[must_use]
    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self.suggestion = suggest_for_error(self.code, self.context.as_ref());
        self
    }

    /// Set a custom suggestion.
    #[must_use]
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = suggestion.into();
        self
    }
}

impl std::fmt::Display for StructuredError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl From<IdError> for StructuredError {
    fn from(err: IdError) -> Self {
        Self::from_id_error(&err)
    }
}

impl From<&IdError> for StructuredError {
    fn from(err: &IdError) -> Self {
        Self::from_id_error(err)
    }
}

/// Result type alias using `IdError`.
pub type Result<T> = std::result::Result<T, IdError>;
