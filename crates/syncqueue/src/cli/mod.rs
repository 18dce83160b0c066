//! Command-line interface for syncqueue.
//!
//! This module provides the CLI structure for the `syncq` binary.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use commands::{
    ClearCommand, ConfigCommand, EnqueueCommand, KindArg, ProgressCommand, StatusCommand,
};

/// syncq - Offline-resilient write queue
///
/// Records writes locally, syncs them to the document store when the network
/// is available, and retries failures with backoff.
#[derive(Debug, Parser)]
#[command(name = "syncq")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only report warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Behave as if the network were down
    #[arg(long, global = true)]
    pub offline: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Queue a write
    Enqueue(EnqueueCommand),

    /// Show queue status
    Status(StatusCommand),

    /// Drain the queue now
    Sync,

    /// Drop every pending write
    Clear(ClearCommand),

    /// Manage onboarding progress
    #[command(subcommand)]
    Progress(ProgressCommand),

    /// View or validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Get the verbosity level based on flags.
    #[must_use]
    pub fn verbosity(&self) -> crate::logging::Verbosity {
        crate::logging::Verbosity::from_flags(self.verbose, self.quiet)
    }
}
