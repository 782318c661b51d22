//! CLI command definitions (§10.5)
//!
//! The thinnest possible caller of the library's public API — argument
//! parsing only, no business logic.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "takt", about = "Multi-agent piece orchestration runtime", version)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the scheduler against the task manifest
    Run {
        /// Worker pool size; overrides the configured concurrency
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Manage the task manifest
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },

    /// Validate a piece descriptor
    Piece {
        #[command(subcommand)]
        command: PieceCommand,
    },

    /// Manage facets (personas, policies, knowledge, instructions)
    Facet {
        #[command(subcommand)]
        command: FacetCommand,
    },
}

#[derive(Subcommand)]
pub enum TaskCommand {
    /// Add a new task to the manifest
    Add {
        name: String,
        content: String,
        #[arg(long, default_value = "default")]
        piece: String,
    },

    /// List every task in the manifest
    List,

    /// Return a failed/error task to pending
    Requeue { name: String },

    /// Re-run a completed task
    Rerun { name: String },
}

#[derive(Subcommand)]
pub enum PieceCommand {
    /// Load and validate a piece descriptor without running it
    Validate { reference: String },
}

#[derive(Subcommand)]
pub enum FacetCommand {
    /// Copy a built-in facet into the project or user layer
    Eject {
        facet_type: String,
        name: String,
        #[arg(long)]
        user: bool,
    },
}
