//! CLI command definitions.
//!
//! This module defines the structure of all CLI subcommands.

use std::path::PathBuf;

use clap::{Args, Subcommand, ValueEnum};

use crate::item::OperationKind;

/// Enqueue command arguments.
#[derive(Debug, Args)]
pub struct EnqueueCommand {
    /// Kind of write to queue
    #[arg(short, long, value_enum)]
    pub kind: KindArg,

    /// Remote document the write targets
    #[arg(short, long)]
    pub entity: String,

    /// JSON payload for save writes
    #[arg(short, long)]
    pub payload: Option<String>,

    /// Failed attempts allowed before the write is dropped
    #[arg(short, long)]
    pub max_retries: Option<u32>,
}

/// Status command arguments.
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Clear command arguments.
#[derive(Debug, Args)]
pub struct ClearCommand {
    /// Skip confirmation
    #[arg(short, long)]
    pub yes: bool,
}

/// Onboarding progress commands.
#[derive(Debug, Subcommand)]
pub enum ProgressCommand {
    /// Save progress locally and queue it for sync
    Save {
        /// Entity the progress belongs to
        #[arg(short, long)]
        entity: String,

        /// Step the user is on
        #[arg(short, long)]
        step: u32,

        /// Completed step names (repeatable)
        #[arg(long = "completed", value_name = "STEP")]
        completed: Vec<String>,

        /// Profile fields as a JSON object
        #[arg(short, long)]
        profile: Option<String>,
    },

    /// Show locally saved progress
    Show {
        /// Entity the progress belongs to
        #[arg(short, long)]
        entity: String,

        /// Also show the remote document
        #[arg(short, long)]
        remote: bool,
    },

    /// Clear progress locally and queue a remote delete
    Clear {
        /// Entity the progress belongs to
        #[arg(short, long)]
        entity: String,
    },
}

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show the configuration file path
    Path,

    /// Validate configuration
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

/// Operation kind argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KindArg {
    /// Merge a progress snapshot into the remote document
    Save,
    /// Replace the remote document with a tombstone
    Clear,
}

impl From<KindArg> for OperationKind {
    fn from(arg: KindArg) -> Self {
        match arg {
            KindArg::Save => Self::SaveProgress,
            KindArg::Clear => Self::ClearProgress,
        }
    }
}
