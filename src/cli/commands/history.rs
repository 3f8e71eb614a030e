//! idswap stats / history / prune

use clap::Args;
use colored::Colorize;

use crate::app::AppContext;
use crate::cli::output::{emit_human, emit_robot, robot_ok, HumanLayout};
use crate::error::Result;

#[derive(Args, Debug)]
pub struct HistoryArgs {
    /// Maximum number of entries to show
    #[arg(long, default_value = "20")]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct PruneArgs {
    /// Retention window in days (default: journal.retention_days)
    #[arg(long)]
    pub days: Option<u32>,
}

pub fn run_stats(ctx: &mut AppContext) -> Result<()> {
    let stats = ctx.orchestrator()?.statistics()?;
    if ctx.robot_mode {
        return emit_robot(&robot_ok(&stats));
    }

    let mut layout = HumanLayout::new();
    layout
        .title("Mutation statistics")
        .kv("Total", &stats.total.to_string())
        .kv("Succeeded", &stats.succeeded.to_string())
        .kv("Failed", &stats.failed.to_string());
    if !stats.per_category.is_empty() {
        layout.blank().section("Per category");
        for (category, counts) in &stats.per_category {
            layout.kv(
                category,
                &format!("{} ({} ok, {} failed)", counts.total, counts.succeeded, counts.failed),
            );
        }
    }
    emit_human(layout);
    Ok(())
}

pub fn run(ctx: &mut AppContext, args: &HistoryArgs) -> Result<()> {
    let records = ctx.orchestrator()?.history(args.limit)?;
    if ctx.robot_mode {
        return emit_robot(&robot_ok(serde_json::json!({
            "count": records.len(),
            "mutations": records,
        })));
    }

    if records.is_empty() {
        println!("No mutations recorded.");
        return Ok(());
    }
    for record in records {
        let mark = if record.success { "✓".green() } else { "✗".red() };
        let mut line = format!(
            "{mark} {}  {}/{}  {} → {}",
            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            record.category,
            record.item,
            record.original_value.as_deref().unwrap_or("-"),
            record.new_value.as_deref().unwrap_or("-"),
        );
        if let Some(error) = &record.error {
            line.push_str(&format!("  ({})", error.dimmed()));
        }
        println!("{line}");
    }
    Ok(())
}

pub fn run_prune(ctx: &mut AppContext, args: &PruneArgs) -> Result<()> {
    let orchestrator = ctx.orchestrator()?;
    let days = args
        .days
        .unwrap_or(orchestrator.config().journal.retention_days);
    let removed = orchestrator.prune(Some(days))?;
    if ctx.robot_mode {
        return emit_robot(&robot_ok(serde_json::json!({
            "removed": removed,
            "retention_days": days,
        })));
    }
    if !ctx.quiet {
        println!("Removed {removed} journal entries older than {days} days.");
    }
    Ok(())
}
