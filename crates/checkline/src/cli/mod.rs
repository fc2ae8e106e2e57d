//! Command-line interface for checkline.
//!
//! This module provides the CLI structure for the `checkline` binary.

mod commands;
mod input;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use commands::{
    ConfigCommand, DeleteCommand, ListCommand, RetryCommand, StatusCommand, SubmitCommand,
    TimelineCommand,
};
pub use input::{ChecklistInput, ItemInput};

/// checkline - Offline-first inspection checklists
///
/// Queues finalized inspection checklists with their photos on this device
/// and delivers them to the records service once it is reachable.
#[derive(Debug, Parser)]
#[command(name = "checkline")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Acting principal recorded on the timeline
    #[arg(long, global = true, value_name = "PRINCIPAL")]
    pub actor: Option<String>,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Finalize a filled-in checklist and queue it
    Submit(SubmitCommand),

    /// Show queue status
    Status(StatusCommand),

    /// List queued submissions
    List(ListCommand),

    /// Deliver queued submissions now
    Sync,

    /// Keep delivering in the background until interrupted
    Watch,

    /// Requeue a submission that ran out of retries
    Retry(RetryCommand),

    /// Delete a queued submission
    Delete(DeleteCommand),

    /// Show a submission's timeline
    Timeline(TimelineCommand),

    /// View or validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Get the verbosity level based on flags.
    #[must_use]
    pub fn verbosity(&self) -> crate::logging::Verbosity {
        if self.quiet {
            crate::logging::Verbosity::Quiet
        } else {
            match self.verbose {
                0 => crate::logging::Verbosity::Normal,
                1 => crate::logging::Verbosity::Verbose,
                _ => crate::logging::Verbosity::Trace,
            }
        }
    }
}
