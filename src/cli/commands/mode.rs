//! idswap mode - switch between ephemeral and permanent.

use clap::Args;

use crate::app::AppContext;
use crate::cli::output::{emit_robot, robot_ok};
use crate::error::{IdError, Result};
use crate::mutator::SpoofMode;
use crate::worker::{Job, JobResult};

use super::mutate::revert_line;

#[derive(Args, Debug)]
pub struct ModeArgs {
    /// ephemeral (revert at next boot) or permanent
    pub mode: SpoofMode,
}

pub fn run(ctx: &mut AppContext, args: &ModeArgs) -> Result<()> {
    let JobResult::Mode(revert) = ctx.run_job(
        Job::SetMode { mode: args.mode },
        &format!("switching to {} mode", args.mode),
    )?
    else {
        return Err(IdError::ValidationFailed("unexpected worker result".to_string()));
    };

    if ctx.robot_mode {
        return emit_robot(&robot_ok(serde_json::json!({
            "mode": args.mode,
            "revert": revert,
        })));
    }
    if !ctx.quiet {
        println!("Mode: {}", args.mode);
        println!("Boot revert: {}", revert_line(&revert));
    }
    Ok(())
}
