//! CLI command definitions for the `pil` ops binary

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// piloop - self-improvement loop coordinator ops
#[derive(Parser)]
#[command(
    name = "pil",
    about = "Inspect and manage the pi loop coordinator runtime",
    version
)]
pub struct Cli {
    /// Override the runtime root (default: ~/.pi/runtime)
    #[arg(long, global = true)]
    pub runtime_root: Option<PathBuf>,

    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// Output format for inspection commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Show registry summary and this host's parallelism math
    Status {
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// List live instances
    Instances {
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Write the stop signal for a project's active run
    Stop {
        /// Project directory (default: current directory)
        #[arg(long)]
        project: Option<PathBuf>,
    },

    /// Remove dead instances, stale queue states and expired locks
    Cleanup,

    /// Print the resolved layered configuration
    Config {
        #[arg(short, long, default_value = "json")]
        format: OutputFormat,
    },
}
