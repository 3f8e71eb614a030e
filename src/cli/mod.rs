//! CLI module - Command-line interface definitions and handlers
//!
//! Uses clap v4 with derive macros for argument parsing.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub mod commands;
pub mod output;
pub mod progress;

/// idswap - journaled, reversible identifier mutation
#[derive(Parser, Debug)]
#[command(name = "idswap")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Emit one JSON document per command on stdout
    #[arg(long, global = true)]
    pub robot: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file path (default: <config_dir>/idswap/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Change identifiers (mac, guid, ip, or a reporting override field)
    Mutate(commands::mutate::MutateArgs),

    /// Show what `mutate` would change without writing anything
    Plan(commands::mutate::PlanArgs),

    /// Restore every recorded original value
    Restore,

    /// Back up, list, or restore the journal
    Backup(commands::backup::BackupArgs),

    /// Mutation counts per category
    Stats,

    /// Recent journal entries, newest first
    History(commands::history::HistoryArgs),

    /// Session, mode, originals and revert state
    Status,

    /// Switch between ephemeral and permanent mode
    Mode(commands::mode::ModeArgs),

    /// Active adapters and hardware metadata as reported
    Inventory,

    /// Delete journal entries older than the retention window
    Prune(commands::history::PruneArgs),

    /// Inspect or drive the boot-time revert
    Revert(commands::revert::RevertArgs),
}
