//! idswap backup - snapshot and restore the journal.

use std::path::PathBuf;

use clap::{Args, Subcommand};

use crate::app::AppContext;
use crate::cli::output::{emit_human, emit_robot, robot_ok, HumanLayout};
use crate::error::{IdError, Result};
use crate::storage::BackupRecord;
use crate::worker::{Job, JobResult};

use super::mutate::revert_line;

#[derive(Args, Debug)]
pub struct BackupArgs {
    #[command(subcommand)]
    pub command: BackupCommand,
}

#[derive(Subcommand, Debug)]
pub enum BackupCommand {
    /// Create a new backup of the journal
    Create(BackupCreateArgs),
    /// List recorded backups
    List(BackupListArgs),
    /// Replace the journal with a backup
    Restore(BackupRestoreArgs),
}

#[derive(Args, Debug)]
pub struct BackupCreateArgs {
    /// Integrity-check the backup and record per-table row counts
    #[arg(long)]
    pub verify: bool,
}

#[derive(Args, Debug)]
pub struct BackupListArgs {
    /// Maximum number of backups to show
    #[arg(long, default_value = "20")]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct BackupRestoreArgs {
    /// Backup file to restore
    pub path: Option<PathBuf>,

    /// Restore the most recent backup
    #[arg(long)]
    pub latest: bool,

    /// Apply restore (required)
    #[arg(long)]
    pub approve: bool,
}

pub fn run(ctx: &mut AppContext, args: &BackupArgs) -> Result<()> {
    match &args.command {
        BackupCommand::Create(create) => run_create(ctx, create),
        BackupCommand::List(list) => run_list(ctx, list),
        BackupCommand::Restore(restore) => run_restore(ctx, restore),
    }
}

fn run_create(ctx: &mut AppContext, args: &BackupCreateArgs) -> Result<()> {
    let JobResult::Backup(record) = ctx.run_job(
        Job::Backup {
            verify: args.verify,
        },
        "backing up journal",
    )?
    else {
        return Err(IdError::ValidationFailed("unexpected worker result".to_string()));
    };

    if ctx.robot_mode {
        return emit_robot(&robot_ok(&record));
    }
    if ctx.quiet {
        return Ok(());
    }
    let mut layout = HumanLayout::new();
    layout.title("Backup created");
    push_record(&mut layout, &record);
    if let Some(counts) = &record.row_counts {
        layout.blank().section("Rows");
        for (table, count) in counts {
            layout.kv(table, &count.to_string());
        }
    }
    emit_human(layout);
    Ok(())
}

fn run_list(ctx: &AppContext, args: &BackupListArgs) -> Result<()> {
    let backups = ctx.orchestrator()?.list_backups(args.limit)?;

    if ctx.robot_mode {
        return emit_robot(&robot_ok(serde_json::json!({
            "count": backups.len(),
            "backups": backups,
        })));
    }

    if backups.is_empty() {
        println!("No backups found.");
        return Ok(());
    }

    println!("Backups:");
    for backup in backups {
        let verified = if backup.row_counts.is_some() {
            " verified"
        } else {
            ""
        };
        println!(
            "  {}  {}  {} bytes  {}{verified}",
            backup.created_at.to_rfc3339(),
            backup.file_path.display(),
            backup.size_bytes,
            backup.method.as_str(),
        );
    }
    Ok(())
}

fn run_restore(ctx: &mut AppContext, args: &BackupRestoreArgs) -> Result<()> {
    if !args.approve {
        return Err(IdError::ApprovalRequired(
            "backup restore requires --approve".to_string(),
        ));
    }

    let path = match (&args.path, args.latest) {
        (Some(path), false) => path.clone(),
        (None, true) => ctx
            .orchestrator()?
            .list_backups(1)?
            .into_iter()
            .next()
            .map(|b| b.file_path)
            .ok_or_else(|| IdError::NotFound("no backups recorded".to_string()))?,
        (Some(_), true) => {
            return Err(IdError::ValidationFailed(
                "cannot use both a path and --latest".to_string(),
            ));
        }
        (None, false) => {
            return Err(IdError::ValidationFailed(
                "restore requires a backup path or --latest".to_string(),
            ));
        }
    };
    if !path.is_file() {
        return Err(IdError::NotFound(format!("backup {}", path.display())));
    }

    let revert = ctx.orchestrator_mut()?.restore_backup(&path)?;

    if ctx.robot_mode {
        return emit_robot(&robot_ok(serde_json::json!({
            "restored": path,
            "revert": revert,
        })));
    }
    if ctx.quiet {
        return Ok(());
    }
    let mut layout = HumanLayout::new();
    layout.title("Journal restored");
    layout.kv("From", &path.display().to_string());
    layout.kv("Boot revert", &revert_line(&revert));
    emit_human(layout);
    Ok(())
}

fn push_record(layout: &mut HumanLayout, record: &BackupRecord) {
    layout
        .kv("Path", &record.file_path.display().to_string())
        .kv("Created", &record.created_at.to_rfc3339())
        .kv("Size", &format!("{} bytes", record.size_bytes))
        .kv("Method", record.method.as_str())
        .kv("Tables", &record.included_tables.join(", "));
}
