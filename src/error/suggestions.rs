//! Context-aware error suggestions.
//!
//! Complements the static suggestions in the `codes` module with hints that
//! name the adapter, setting, or path involved.

use serde_json::Value;

use super::codes::ErrorCode;

/// Generate a context-aware suggestion for an error.
pub fn suggest_for_error(code: ErrorCode, context: Option<&Value>) -> String {
    match code {
        ErrorCode::ResourceNotFound => suggest_resource_not_found(context),
        ErrorCode::WriteVerificationFailed => suggest_verification_failed(context),
        ErrorCode::LockFailed => suggest_lock_failed(context),
        ErrorCode::ConfigInvalid => suggest_config_invalid(context),
        _ => code.suggestion().to_string(),
    }
}

fn field<'a>(context: Option<&'a Value>, key: &str) -> Option<&'a str> {
    context.and_then(|c| c.get(key)).and_then(Value::as_str)
}

fn suggest_resource_not_found(context: Option<&Value>) -> String {
    match field(context, "resource") {
        Some(resource) => format!(
            "'{resource}' could not be resolved. Run `idswap inventory` to list active adapters; \
             adapters are matched by stable id, so a removed or renamed adapter will not be found"
        ),
        None => ErrorCode::ResourceNotFound.suggestion().to_string(),
    }
}

fn suggest_verification_failed(context: Option<&Value>) -> String {
    match (field(context, "expected"), field(context, "actual")) {
        (Some(expected), Some(actual)) => format!(
            "Wrote {expected} but read back {actual}. Some drivers ignore address overrides; \
             run `idswap restore` to return to the journaled original"
        ),
        _ => ErrorCode::WriteVerificationFailed.suggestion().to_string(),
    }
}

fn suggest_lock_failed(context: Option<&Value>) -> String {
    match field(context, "lock_path") {
        Some(path) => format!(
            "Another idswap process holds {path}. If no such process is running, delete the file and retry"
        ),
        None => ErrorCode::LockFailed.suggestion().to_string(),
    }
}

fn suggest_config_invalid(context: Option<&Value>) -> String {
    match field(context, "config_key") {
        Some(key) => format!("Check the value of `{key}` in config.toml or its IDSWAP_* override"),
        None => ErrorCode::ConfigInvalid.suggestion().to_string(),
    }
}
