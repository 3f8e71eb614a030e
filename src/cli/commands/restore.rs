//! idswap restore - put every recorded original back.

use colored::Colorize;

use crate::app::AppContext;
use crate::cli::output::{emit_human, emit_robot, outcome_line, robot_outcomes, HumanLayout};
use crate::error::{IdError, Result};
use crate::worker::{Job, JobResult};

use super::mutate::revert_line;

pub fn run(ctx: &mut AppContext) -> Result<()> {
    let JobResult::Restore(summary) = ctx.run_job(Job::RestoreAll, "restoring originals")? else {
        return Err(IdError::ValidationFailed("unexpected worker result".to_string()));
    };

    if ctx.robot_mode {
        return emit_robot(&robot_outcomes(&summary, &summary.report.outcomes));
    }
    if ctx.quiet {
        return Ok(());
    }

    let mut layout = HumanLayout::new();
    layout.title("Restore");
    if summary.report.outcomes.is_empty() {
        layout.push_line("Nothing to restore.");
    }
    for outcome in &summary.report.outcomes {
        layout.push_line(outcome_line(outcome));
    }
    layout.blank();
    let headline = if summary.report.all_succeeded() {
        summary.summary.green()
    } else {
        summary.summary.yellow()
    };
    layout.kv("Result", &headline.to_string());
    if let Some(revert) = &summary.revert {
        layout.kv("Boot revert", &revert_line(revert));
    }
    if let Some(err) = &summary.revert_error {
        layout.kv("Revert error", &err.message);
    }
    emit_human(layout);
    Ok(())
}
