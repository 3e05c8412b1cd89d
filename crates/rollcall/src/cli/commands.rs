//! CLI command definitions.

use std::path::PathBuf;

use clap::{Args, Subcommand, ValueEnum};

/// Arguments for recording one attendance mark.
#[derive(Debug, Args)]
pub struct MarkCommand {
    /// Still frame to attach (JPEG, PNG, WebP or GIF)
    #[arg(short, long, value_name = "FILE")]
    pub image: PathBuf,

    /// Latitude in decimal degrees
    #[arg(long, requires = "lon", allow_negative_numbers = true)]
    pub lat: Option<f64>,

    /// Longitude in decimal degrees
    #[arg(long, requires = "lat", allow_negative_numbers = true)]
    pub lon: Option<f64>,

    /// Student id (looked up from the server when omitted and online)
    #[arg(short, long)]
    pub student_id: Option<String>,

    /// Queue locally without probing the network
    #[arg(long)]
    pub offline: bool,

    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Arguments for an immediate or deferred sync.
#[derive(Debug, Args)]
pub struct SyncCommand {
    /// Leave a durable request for the running service instead of syncing now
    #[arg(short, long)]
    pub defer: bool,

    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Arguments for listing the queue.
#[derive(Debug, Args)]
pub struct PendingCommand {
    /// Show at most this many records
    #[arg(short, long)]
    pub limit: Option<usize>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    pub format: OutputFormat,
}

/// Status command arguments.
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
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

/// Output format for commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Plain text output
    #[default]
    Plain,
    /// Formatted table
    Table,
    /// JSON output
    Json,
}
