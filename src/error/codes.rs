//! Standardized error codes for machine-parseable output.
//!
//! Error codes follow a numeric taxonomy:
//! - 1xx: Identifier mutation errors
//! - 2xx: Journal and storage errors
//! - 3xx: Config errors
//! - 4xx: Revert scheduling errors
//! - 8xx: Validation and locking errors
//! - 9xx: Internal errors

use serde::{Deserialize, Serialize};

/// Standardized error codes for robot mode output and worker events.
///
/// Each variant maps to a numeric code (e.g., `PermissionDenied` -> E101).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // ========================================
    // Mutation errors (1xx)
    // ========================================
    /// E101: The process lacks the privilege required to write the resource
    PermissionDenied,
    /// E102: The target resource (adapter, key, value) could not be resolved
    ResourceNotFound,
    /// E103: The platform backend is not available on this system
    PlatformUnavailable,
    /// E104: The write was accepted but the read-back did not match
    WriteVerificationFailed,
    /// E105: The request was cancelled before any live write started
    Cancelled,

    // ========================================
    // Journal errors (2xx)
    // ========================================
    /// E201: The journal could not record a load-bearing entry
    JournalUnavailable,
    /// E202: Snapshot copy was blocked by contention
    BackupContention,
    /// E203: Database operation failed
    DatabaseError,
    /// E204: Serialization/deserialization failed
    SerializationError,
    /// E205: File operation failed
    IoError,

    // ========================================
    // Config errors (3xx)
    // ========================================
    /// E301: Config file has invalid syntax or values
    ConfigInvalid,

    // ========================================
    // Revert scheduling errors (4xx)
    // ========================================
    /// E401: Neither startup mechanism accepted the revert trigger
    ScheduleRegistrationFailed,

    // ========================================
    // Validation/lock errors (8xx)
    // ========================================
    /// E801: Input validation failed
    ValidationFailed,
    /// E802: Operation requires explicit approval
    ApprovalRequired,
    /// E851: Another instance holds the journal lock
    LockFailed,

    // ========================================
    // Internal errors (9xx)
    // ========================================
    /// E905: Generic not found (catch-all)
    NotFound,
}

impl ErrorCode {
    /// Get the numeric error code (e.g., `PermissionDenied` -> 101).
    #[must_use]
    pub const fn numeric(&self) -> u16 {
        match self {
            Self::PermissionDenied => 101,
            Self::ResourceNotFound => 102,
            Self::PlatformUnavailable => 103,
            Self::WriteVerificationFailed => 104,
            Self::Cancelled => 105,

            Self::JournalUnavailable => 201,
            Self::BackupContention => 202,
            Self::DatabaseError => 203,
            Self::SerializationError => 204,
            Self::IoError => 205,

            Self::ConfigInvalid => 301,

            Self::ScheduleRegistrationFailed => 401,

            Self::ValidationFailed => 801,
            Self::ApprovalRequired => 802,
            Self::LockFailed => 851,

            Self::NotFound => 905,
        }
    }

    /// Get the error code as a formatted string (e.g., "E101").
    #[must_use]
    pub fn code_string(&self) -> String {
        format!("E{}", self.numeric())
    }

    /// Get the default suggestion for this error code.
    #[must_use]
    pub const fn suggestion(&self) -> &'static str {
        match self {
            Self::PermissionDenied => "Run idswap from an elevated (administrator) shell",
            Self::ResourceNotFound => "Run `idswap inventory` to list active adapters and check the target exists",
            Self::PlatformUnavailable => "This backend is unavailable here. Use `--config` with `platform.backend = \"simulated\"` to rehearse",
            Self::WriteVerificationFailed => "The platform accepted the write but reports another value. Run `idswap restore` and retry",
            Self::Cancelled => "The request was cancelled before any write. Re-run it when ready",
            Self::JournalUnavailable => "Check that the journal directory is writable. No resource was modified",
            Self::BackupContention => "The journal was busy. The backup fell back to a logical export; retry if it still failed",
            Self::DatabaseError => "Run `idswap backup list` and restore a known-good journal with `idswap backup restore`",
            Self::SerializationError => "A stored setting could not be decoded. Inspect it with `idswap status`",
            Self::IoError => "File operation failed. Check the path exists and permissions are correct",
            Self::ConfigInvalid => "Check TOML syntax in the config file and the IDSWAP_* environment variables",
            Self::ScheduleRegistrationFailed => "Run `idswap revert regenerate` from an elevated shell, or `idswap restore` now",
            Self::ValidationFailed => "Review the arguments and try again",
            Self::ApprovalRequired => "Repeat the command with --approve",
            Self::LockFailed => "Another idswap process is running. Wait for it to exit or remove a stale lock file",
            Self::NotFound => "The requested item was not found. Check the path or identifier",
        }
    }

    /// Check if this error is potentially recoverable by the user.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::PermissionDenied
            | Self::ResourceNotFound
            | Self::PlatformUnavailable
            | Self::Cancelled
            | Self::JournalUnavailable
            | Self::BackupContention
            | Self::IoError
            | Self::ConfigInvalid
            | Self::ScheduleRegistrationFailed
            | Self::ValidationFailed
            | Self::ApprovalRequired
            | Self::LockFailed
            | Self::NotFound => true,

            Self::WriteVerificationFailed | Self::DatabaseError | Self::SerializationError => false,
        }
    }

    /// Get the error category name.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self.numeric() / 100 {
            1 => "mutation",
            2 => "journal",
            3 => "config",
            4 => "revert",
            8 => "validation",
            9 => "internal",
            _ => "unknown",
        }
    }

    /// Iterate over all error codes.
    pub fn all() -> impl Iterator<Item = Self> {
        [
            Self::PermissionDenied,
            Self::ResourceNotFound,
            Self::PlatformUnavailable,
            Self::WriteVerificationFailed,
            Self::Cancelled,
            Self::JournalUnavailable,
            Self::BackupContention,
            Self::DatabaseError,
            Self::SerializationError,
            Self::IoError,
            Self::ConfigInvalid,
            Self::ScheduleRegistrationFailed,
            Self::ValidationFailed,
            Self::ApprovalRequired,
            Self::LockFailed,
            Self::NotFound,
        ]
        .into_iter()
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_error_code_numeric() {
        assert_eq!(ErrorCode::PermissionDenied.numeric(), 101);
        assert_eq!(ErrorCode::JournalUnavailable.numeric(), 201);
        assert_eq!(ErrorCode::ScheduleRegistrationFailed.numeric(), 401);
        assert_eq!(ErrorCode::NotFound.numeric(), 905);
    }

    #[test]
    fn test_numeric_codes_are_unique() {
        let mut seen = HashSet::new();
        for code in ErrorCode::all() {
            assert!(seen.insert(code.numeric()), "duplicate code {code:?}");
        }
    }

    #[test]
    fn test_all_codes_have_suggestions_and_categories() {
        for code in ErrorCode::all() {
            assert!(!code.suggestion().is_empty(), "{code:?} has no suggestion");
            assert_ne!(code.category(), "unknown", "{code:?} has no category");
        }
    }

    #[test]
    fn test_error_code_serialization() {
        let json = serde_json::to_string(&ErrorCode::WriteVerificationFailed).unwrap();
        assert_eq!(json, "\"WRITE_VERIFICATION_FAILED\"");
        let back: ErrorCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ErrorCode::WriteVerificationFailed);
    }

    #[test]
    fn test_error_code_display() {
        assert_eq!(format!("{}", ErrorCode::BackupContention), "E202");
    }

    #[test]
    fn test_category_assignment() {
        assert_eq!(ErrorCode::ResourceNotFound.category(), "mutation");
        assert_eq!(ErrorCode::DatabaseError.category(), "journal");
        assert_eq!(ErrorCode::ConfigInvalid.category(), "config");
        assert_eq!(ErrorCode::ScheduleRegistrationFailed.category(), "revert");
    }
}
