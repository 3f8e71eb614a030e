use chrono::{DateTime, Utc};
use colored::Colorize;
use serde::Serialize;

use crate::error::{ErrorCode, IdError, Result, StructuredError};
use crate::mutator::MutationOutcome;

#[derive(Serialize)]
pub struct RobotResponse<T> {
    pub status: RobotStatus,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub data: T,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RobotStatus {
    Ok,
    /// Rich error with structured information
    Error {
        code: ErrorCode,
        numeric_code: u16,
        message: String,
        suggestion: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        context: Option<serde_json::Value>,
        recoverable: bool,
        category: String,
    },
    /// Some steps of a batch failed.
    Partial { completed: usize, failed: usize },
}

impl From<StructuredError> for RobotStatus {
    fn from(err: StructuredError) -> Self {
        Self::Error {
            code: err.code,
            numeric_code: err.numeric_code,
            message: err.message,
            suggestion: err.suggestion,
            context: err.context,
            recoverable: err.recoverable,
            category: err.category,
        }
    }
}

pub fn robot_ok<T: Serialize>(data: T) -> RobotResponse<T> {
    RobotResponse {
        status: RobotStatus::Ok,
        timestamp: Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        data,
        warnings: Vec::new(),
    }
}

/// `Ok` when every outcome succeeded, otherwise `Partial`.
pub fn robot_outcomes<T: Serialize>(data: T, outcomes: &[MutationOutcome]) -> RobotResponse<T> {
    let failed = outcomes.iter().filter(|o| !o.success).count();
    let mut response = robot_ok(data);
    if failed > 0 {
        response.status = RobotStatus::Partial {
            completed: outcomes.len() - failed,
            failed,
        };
    }
    response
}

pub fn robot_error_structured(err: &IdError) -> RobotResponse<serde_json::Value> {
    RobotResponse {
        status: err.to_structured().into(),
        timestamp: Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        data: serde_json::Value::Null,
        warnings: Vec::new(),
    }
}

pub fn emit_robot<T: Serialize>(response: &RobotResponse<T>) -> Result<()> {
    emit_json(response)
}

pub fn emit_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value)?;
    println!("{payload}");
    Ok(())
}

pub struct HumanLayout {
    lines: Vec<String>,
    key_width: usize,
}

impl Default for HumanLayout {
    fn default() -> Self {
        Self::new()
    }
}

impl HumanLayout {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            lines: Vec::new(),
            key_width: 20,
        }
    }

    pub fn title(&mut self, text: &str) -> &mut Self {
        self.lines.push(text.bold().to_string());
        self.lines.push(String::new());
        self
    }

    pub fn section(&mut self, text: &str) -> &mut Self {
        self.lines.push(text.bold().to_string());
        self.lines.push("-".repeat(text.len().max(3)));
        self
    }

    pub fn kv(&mut self, key: &str, value: &str) -> &mut Self {
        let padded = format!("{key:width$}", width = self.key_width);
        self.lines.push(format!("{} {value}", padded.dimmed()));
        self
    }

    pub fn bullet(&mut self, text: &str) -> &mut Self {
        self.lines.push(format!("- {text}"));
        self
    }

    pub fn blank(&mut self) -> &mut Self {
        self.lines.push(String::new());
        self
    }

    pub fn push_line(&mut self, line: impl Into<String>) -> &mut Self {
        self.lines.push(line.into());
        self
    }

    #[must_use]
    pub fn build(self) -> String {
        self.lines.join("\n")
    }
}

pub fn emit_human(layout: HumanLayout) {
    println!("{}", layout.build());
}

/// One line per outcome: mark, class item, before → after, message.
pub fn outcome_line(outcome: &MutationOutcome) -> String {
    let mark = if outcome.success {
        "✓".green()
    } else {
        "✗".red()
    };
    let before = outcome.before.as_deref().unwrap_or("-");
    let after = outcome.after.as_deref().unwrap_or("-");
    let target = outcome
        .resource
        .as_deref()
        .map_or_else(String::new, |r| format!(" [{r}]"));
    let mut line = format!("{mark} {}{target}: {before} → {after}", outcome.item.bold());
    if !outcome.success {
        line.push_str(&format!(" ({})", outcome.message));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(success: bool) -> MutationOutcome {
        MutationOutcome {
            category: "network".to_string(),
            item: "mac_address".to_string(),
            resource: Some("GUID-1".to_string()),
            success,
            before: Some("AA:BB:CC:11:22:33".to_string()),
            after: success.then(|| "02:11:22:33:44:55".to_string()),
            message: if success { "updated" } else { "access denied" }.to_string(),
            error: None,
            record_id: None,
        }
    }

    #[test]
    fn robot_error_structured_includes_all_fields() {
        let err = IdError::PermissionDenied("mac_address requires elevation".into());
        let json = serde_json::to_value(robot_error_structured(&err)).unwrap();
        let status = &json["status"]["error"];
        assert_eq!(status["code"], "PERMISSION_DENIED");
        assert_eq!(status["numeric_code"], err.code().numeric());
        assert!(status["message"].as_str().unwrap().contains("elevation"));
        assert!(!status["suggestion"].as_str().unwrap().is_empty());
        assert!(json["data"].is_null());
    }

    #[test]
    fn robot_ok_has_envelope() {
        let json = serde_json::to_value(robot_ok(serde_json::json!({"count": 2}))).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(json["data"]["count"], 2);
        assert!(json.get("warnings").is_none());
    }

    #[test]
    fn robot_outcomes_reports_partial() {
        let outcomes = vec![outcome(true), outcome(false)];
        let json = serde_json::to_value(robot_outcomes(&outcomes, &outcomes)).unwrap();
        assert_eq!(json["status"]["partial"]["completed"], 1);
        assert_eq!(json["status"]["partial"]["failed"], 1);
    }

    #[test]
    fn outcome_line_shows_failure_reason() {
        colored::control::set_override(false);
        let line = outcome_line(&outcome(false));
        assert!(line.contains("mac_address [GUID-1]"));
        assert!(line.contains("(access denied)"));
        assert!(outcome_line(&outcome(true)).contains("→ 02:11:22:33:44:55"));
    }
}
