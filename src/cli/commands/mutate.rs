//! idswap mutate / plan

use clap::Args;
use colored::Colorize;

use crate::app::AppContext;
use crate::cli::output::{emit_human, emit_robot, outcome_line, robot_outcomes, HumanLayout};
use crate::error::{IdError, Result};
use crate::mutator::MutationOptions;
use crate::revert::RevertState;
use crate::worker::{Job, JobResult};

use super::parse_classes;

#[derive(Args, Debug)]
pub struct MutateArgs {
    /// Identifier classes: mac, guid, ip
    pub classes: Vec<String>,

    /// Reporting override field to fake (e.g. BIOS.SerialNumber); repeatable
    #[arg(long = "override", value_name = "FIELD")]
    pub overrides: Vec<String>,

    /// Adapter stable id (default: first active adapter)
    #[arg(long)]
    pub adapter: Option<String>,

    /// Explicit new value instead of a generated one (single class only)
    #[arg(long)]
    pub value: Option<String>,
}

#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Identifier classes: mac, guid, ip
    pub classes: Vec<String>,

    #[arg(long = "override", value_name = "FIELD")]
    pub overrides: Vec<String>,

    #[arg(long)]
    pub adapter: Option<String>,
}

pub fn run(ctx: &mut AppContext, args: &MutateArgs) -> Result<()> {
    let classes = parse_classes(&args.classes, &args.overrides)?;
    if classes.is_empty() {
        return Err(IdError::ValidationFailed(
            "nothing to mutate; name a class or pass --override".to_string(),
        ));
    }
    if args.value.is_some() && classes.len() > 1 {
        return Err(IdError::ValidationFailed(
            "--value applies to exactly one class".to_string(),
        ));
    }
    let options = MutationOptions {
        adapter: args.adapter.clone(),
        value: args.value.clone(),
    };

    let result = ctx.run_job(Job::Mutate { classes, options }, "mutating identifiers")?;
    let JobResult::Batch(summary) = result else {
        return Err(IdError::ValidationFailed("unexpected worker result".to_string()));
    };

    if ctx.robot_mode {
        return emit_robot(&robot_outcomes(&summary, &summary.outcomes));
    }
    if ctx.quiet {
        return Ok(());
    }

    let mut layout = HumanLayout::new();
    layout.title("Mutation");
    for outcome in &summary.outcomes {
        layout.push_line(outcome_line(outcome));
    }
    layout.blank();
    let headline = if summary.cancelled {
        format!("{} (cancelled)", summary.summary).yellow()
    } else if summary.outcomes.iter().all(|o| o.success) {
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
        layout.kv("Hint", &err.suggestion);
    }
    emit_human(layout);
    Ok(())
}

pub fn run_plan(ctx: &mut AppContext, args: &PlanArgs) -> Result<()> {
    let classes = parse_classes(&args.classes, &args.overrides)?;
    if classes.is_empty() {
        return Err(IdError::ValidationFailed(
            "nothing to plan; name a class or pass --override".to_string(),
        ));
    }
    let options = MutationOptions {
        adapter: args.adapter.clone(),
        value: None,
    };
    let outcomes = ctx.orchestrator_mut()?.plan(&classes, &options);

    if ctx.robot_mode {
        return emit_robot(&robot_outcomes(&outcomes, &outcomes));
    }
    let mut layout = HumanLayout::new();
    layout.title("Dry run (nothing written)");
    for outcome in &outcomes {
        layout.push_line(outcome_line(outcome));
    }
    emit_human(layout);
    Ok(())
}

pub(crate) fn revert_line(state: &RevertState) -> String {
    match state {
        RevertState::NoPendingRevert => "none pending".to_string(),
        RevertState::PendingRevert {
            script,
            registered,
            ..
        } => {
            let trigger = registered.map_or_else(
                || "not registered".to_string(),
                |kind| format!("{kind:?}"),
            );
            format!("pending ({trigger}) {}", script.display())
        }
    }
}
