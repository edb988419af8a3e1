//! Command-line interface.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Which role this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Enumerate work items and enqueue them
    Producer,
    /// Dequeue and run tasks to completion
    Consumer,
}

/// Autonomous coding-agent runtime.
#[derive(Debug, Parser)]
#[command(name = "agentd", version, about = "Issue-driven autonomous coding agent")]
pub struct Cli {
    /// Role: producer or consumer; omit to run both sequentially
    #[arg(long, value_enum)]
    pub mode: Option<Mode>,

    /// Config file path (default: .agentd.yml, then the user config dir)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Log level override (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(long)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Maintenance commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Remove task containers older than the stale threshold
    CleanupStale,
}
