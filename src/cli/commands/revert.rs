//! idswap revert - inspect or drive the boot-time revert.

use clap::{Args, Subcommand};

use crate::app::AppContext;
use crate::cli::output::{emit_human, emit_robot, robot_ok, HumanLayout};
use crate::error::{IdError, Result};
use crate::mutator::IpConfig;
use crate::revert::RevertCommand;

use super::mutate::revert_line;

#[derive(Args, Debug)]
pub struct RevertArgs {
    #[command(subcommand)]
    pub command: RevertSubcommand,
}

#[derive(Subcommand, Debug)]
pub enum RevertSubcommand {
    /// Show the pending revert plan and its trigger
    Show,
    /// Rebuild the script from current originals and re-register it
    Regenerate,
    /// Execute the pending revert now instead of at the next boot
    Run,
}

pub fn run(ctx: &mut AppContext, args: &RevertArgs) -> Result<()> {
    match args.command {
        RevertSubcommand::Show => run_show(ctx),
        RevertSubcommand::Regenerate => run_regenerate(ctx),
        RevertSubcommand::Run => run_now(ctx),
    }
}

fn run_show(ctx: &AppContext) -> Result<()> {
    let orchestrator = ctx.orchestrator()?;
    let state = orchestrator.revert_state();
    let plan = if state.is_pending() {
        Some(orchestrator.scheduler().load_plan()?)
    } else {
        None
    };

    if ctx.robot_mode {
        return emit_robot(&robot_ok(serde_json::json!({
            "state": state,
            "trigger": orchestrator.scheduler().trigger_command(),
            "plan": plan,
        })));
    }

    let mut layout = HumanLayout::new();
    layout
        .title("Boot revert")
        .kv("State", &revert_line(&state))
        .kv("Task", orchestrator.scheduler().task_name());
    if let Some(plan) = plan {
        layout
            .kv("Trigger", &orchestrator.scheduler().trigger_command())
            .kv("Settle delay", &format!("{} ms", plan.settle_delay_ms))
            .blank()
            .section("Commands");
        for command in &plan.commands {
            layout.bullet(&describe(command));
        }
    }
    emit_human(layout);
    Ok(())
}

fn run_regenerate(ctx: &mut AppContext) -> Result<()> {
    let state = ctx.orchestrator_mut()?.regenerate_revert()?;
    if ctx.robot_mode {
        return emit_robot(&robot_ok(&state));
    }
    if !ctx.quiet {
        println!("Boot revert: {}", revert_line(&state));
    }
    Ok(())
}

fn run_now(ctx: &mut AppContext) -> Result<()> {
    let orchestrator = ctx.orchestrator_mut()?;
    if !orchestrator.revert_state().is_pending() {
        return Err(IdError::NotFound("no pending revert".to_string()));
    }
    let report = orchestrator.run_pending_revert()?;

    if ctx.robot_mode {
        return emit_robot(&robot_ok(&report));
    }
    if !ctx.quiet {
        println!("Applied {} revert commands.", report.applied);
        for failure in &report.failures {
            println!("  failed: {failure}");
        }
        if report.completed {
            println!("Revert complete; originals cleared and trigger removed.");
        } else {
            println!("Revert incomplete; the script stays registered for the next boot.");
        }
    }
    Ok(())
}

fn describe(command: &RevertCommand) -> String {
    match command {
        RevertCommand::SetValue { path, name, value } => format!("set {path}\\{name} = {value}"),
        RevertCommand::DeleteValue { path, name } => format!("delete {path}\\{name}"),
        RevertCommand::SetAdapterValue {
            stable_id,
            name,
            value: Some(value),
        } => format!("set {name} = {value} on adapter {stable_id}"),
        RevertCommand::SetAdapterValue {
            stable_id,
            name,
            value: None,
        } => format!("remove {name} from adapter {stable_id}"),
        RevertCommand::RestoreIp {
            stable_id,
            config: IpConfig::Dhcp,
        } => format!("enable DHCP on adapter {stable_id}"),
        RevertCommand::RestoreIp {
            stable_id,
            config: IpConfig::Static { ip, mask, .. },
        } => format!("set {ip}/{mask} on adapter {stable_id}"),
        RevertCommand::MarkCompleted { marker } => format!("write marker {}", marker.display()),
        RevertCommand::Unregister { name } => format!("unregister trigger {name}"),
        RevertCommand::RemoveSelf { script } => format!("delete {}", script.display()),
    }
}
