//! Progress reporting for the idswap CLI
//!
//! Adapts to where output goes:
//! - TTY mode: animated spinners and progress bars
//! - Non-TTY mode: simple line-by-line output
//! - Robot mode: JSON progress events to stderr
//! - Quiet mode: no output
//!
//! Worker events are rendered through [`ProgressReporter::worker_observer`].

use std::io::IsTerminal;
use std::time::Duration;

use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use crate::worker::WorkerEvent;

/// Progress output mode based on terminal capabilities and user preferences
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressMode {
    Tty,
    NonTty,
    Robot,
    Quiet,
}

impl ProgressMode {
    #[must_use]
    pub fn detect(robot_mode: bool, quiet: bool) -> Self {
        if quiet {
            Self::Quiet
        } else if robot_mode {
            Self::Robot
        } else if std::io::stderr().is_terminal() {
            Self::Tty
        } else {
            Self::NonTty
        }
    }

    #[must_use]
    pub const fn has_output(&self) -> bool {
        !matches!(self, Self::Quiet)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressEventType {
    Start,
    Status,
    Update,
    Complete,
    Error,
}

/// JSON progress event for robot mode
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub event_type: &'static str,
    pub event: ProgressEventType,
    pub operation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: String,
}

impl ProgressEvent {
    fn new(event: ProgressEventType, operation: &str) -> Self {
        Self {
            event_type: "progress",
            event,
            operation: operation.to_string(),
            percent: None,
            message: None,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    const fn with_percent(mut self, percent: u8) -> Self {
        self.percent = Some(percent);
        self
    }

    fn with_message(mut self, message: &str) -> Self {
        self.message = Some(message.to_string());
        self
    }

    fn emit(&self) {
        if let Ok(json) = serde_json::to_string(self) {
            eprintln!("{json}");
        }
    }
}

pub struct ProgressReporter {
    mode: ProgressMode,
}

impl ProgressReporter {
    #[must_use]
    pub fn new(robot_mode: bool, quiet: bool) -> Self {
        Self::with_mode(ProgressMode::detect(robot_mode, quiet))
    }

    #[must_use]
    pub const fn with_mode(mode: ProgressMode) -> Self {
        Self { mode }
    }

    #[must_use]
    pub const fn mode(&self) -> ProgressMode {
        self.mode
    }

    /// Percentage bar for one operation (0..=100).
    pub fn progress(&self, msg: &str) -> ProgressHandle {
        match self.mode {
            ProgressMode::Quiet => ProgressHandle::Noop,
            ProgressMode::Robot => {
                ProgressEvent::new(ProgressEventType::Start, msg).emit();
                ProgressHandle::Robot {
                    operation: msg.to_string(),
                }
            }
            ProgressMode::NonTty => {
                eprintln!("[idswap] {msg}...");
                ProgressHandle::NonTty {
                    operation: msg.to_string(),
                }
            }
            ProgressMode::Tty => {
                let pb = ProgressBar::new(100);
                if let Ok(style) = ProgressStyle::default_bar()
                    .template("{spinner:.cyan} {msg} [{bar:40.cyan/blue}] {pos}%")
                {
                    pb.set_style(style.progress_chars("█▓▒░"));
                }
                pb.set_message(msg.to_string());
                pb.enable_steady_tick(Duration::from_millis(100));
                ProgressHandle::Tty(pb)
            }
        }
    }

    /// Render worker events for `operation` onto a fresh handle.
    pub fn worker_observer(&self, operation: &str) -> (ProgressHandle, impl FnMut(&WorkerEvent)) {
        let handle = self.progress(operation);
        let sink = handle.clone();
        let observer = move |event: &WorkerEvent| match event {
            WorkerEvent::Status { message, .. } => sink.status(message),
            WorkerEvent::Progress { percent, .. } => sink.set_percent(*percent),
            WorkerEvent::Completed { .. } => {}
        };
        (handle, observer)
    }

    pub fn warn(&self, msg: &str) {
        match self.mode {
            ProgressMode::Quiet => {}
            ProgressMode::Robot => {
                let event = serde_json::json!({
                    "type": "warning",
                    "message": msg,
                    "timestamp": Utc::now().to_rfc3339(),
                });
                if let Ok(json) = serde_json::to_string(&event) {
                    eprintln!("{json}");
                }
            }
            ProgressMode::NonTty | ProgressMode::Tty => {
                eprintln!("[idswap] WARN: {msg}");
            }
        }
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new(false, false)
    }
}

/// Handle for updating or finishing a progress indicator
#[derive(Clone)]
pub enum ProgressHandle {
    Tty(ProgressBar),
    NonTty { operation: String },
    Robot { operation: String },
    Noop,
}

impl ProgressHandle {
    pub fn set_percent(&self, percent: u8) {
        match self {
            Self::Tty(pb) => pb.set_position(u64::from(percent.min(100))),
            Self::Robot { operation } => {
                ProgressEvent::new(ProgressEventType::Update, operation)
                    .with_percent(percent)
                    .emit();
            }
            Self::NonTty { .. } | Self::Noop => {}
        }
    }

    pub fn status(&self, msg: &str) {
        match self {
            Self::Tty(pb) => pb.set_message(msg.to_string()),
            Self::Robot { operation } => {
                ProgressEvent::new(ProgressEventType::Status, operation)
                    .with_message(msg)
                    .emit();
            }
            Self::NonTty { .. } => eprintln!("[idswap] {msg}"),
            Self::Noop => {}
        }
    }

    pub fn finish_with_message(&self, msg: &str) {
        match self {
            Self::Tty(pb) => pb.finish_with_message(format!("✓ {msg}")),
            Self::Robot { operation } => {
                ProgressEvent::new(ProgressEventType::Complete, operation)
                    .with_message(msg)
                    .emit();
            }
            Self::NonTty { .. } => eprintln!("[idswap] ✓ {msg}"),
            Self::Noop => {}
        }
    }

    pub fn abandon_with_message(&self, msg: &str) {
        match self {
            Self::Tty(pb) => pb.abandon_with_message(format!("✗ {msg}")),
            Self::Robot { operation } => {
                ProgressEvent::new(ProgressEventType::Error, operation)
                    .with_message(msg)
                    .emit();
            }
            Self::NonTty { operation } => eprintln!("[idswap] ✗ {operation}: {msg}"),
            Self::Noop => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quiet_wins_over_robot() {
        assert_eq!(ProgressMode::detect(true, true), ProgressMode::Quiet);
        assert_eq!(ProgressMode::detect(true, false), ProgressMode::Robot);
        assert!(!ProgressMode::Quiet.has_output());
    }

    #[test]
    fn test_progress_event_serialization() {
        let event = ProgressEvent::new(ProgressEventType::Update, "backup").with_percent(40);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["event"], "update");
        assert_eq!(json["percent"], 40);
        assert!(json.get("message").is_none());
    }

    #[test]
    fn test_quiet_observer_ignores_events() {
        let reporter = ProgressReporter::with_mode(ProgressMode::Quiet);
        let (handle, mut observer) = reporter.worker_observer("mutate");
        observer(&WorkerEvent::Progress {
            job_id: 1,
            percent: 50,
        });
        assert!(matches!(handle, ProgressHandle::Noop));
    }
}
