//! Command-line interface built on clap.
//!
//! Defines [`Cli`] with one subcommand per job operation and the global
//! flags (--config, --jobs-dir, --json, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// viki: run named jobs of shell steps, stopping at the first failure.
#[derive(Debug, Parser)]
#[command(name = "viki", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file (defaults to ./viki.toml when present).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Job registry directory, overriding the configuration.
    #[arg(long, global = true)]
    pub jobs_dir: Option<PathBuf>,

    /// Print raw JSON responses.
    #[arg(long, global = true, default_value_t = false)]
    pub json: bool,

    /// Enable debug logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List all jobs.
    List,

    /// Show a job's configuration record.
    Get { name: String },

    /// Create a job from flags or from a JSON definition file.
    Create {
        name: String,

        #[arg(long, short)]
        description: Option<String>,

        /// Shell step; repeat to add more, in execution order.
        #[arg(long = "step", short = 's')]
        steps: Vec<String>,

        /// JSON file holding `description` and `steps`.
        #[arg(long, conflicts_with_all = ["description", "steps"])]
        file: Option<PathBuf>,
    },

    /// Change a job's description or steps, keeping its run counters.
    Update {
        name: String,

        #[arg(long, short)]
        description: Option<String>,

        /// Replacement step list; repeat for each step.
        #[arg(long = "step", short = 's')]
        steps: Vec<String>,
    },

    /// Delete a job and all of its history.
    Delete { name: String },

    /// Run a job's steps in order.
    Run { name: String },

    /// Print the cumulative output log of a job.
    Output { name: String },
}
