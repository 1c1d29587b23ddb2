//! Command-line interface definitions using clap derive API.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Assistant plugin orchestrator CLI
#[derive(Parser)]
#[command(name = "assistant-cli")]
#[command(about = "Routes natural-language requests to permission-gated plugins")]
#[command(version)]
pub struct Cli {
    /// Extra configuration file layered over the defaults
    #[arg(short, long, global = true)]
    pub settings: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Interactive conversation on stdin
    Chat {
        /// User id; defaults to `agent.default_user`
        #[arg(short, long)]
        user: Option<String>,
    },
    /// Handle one request and print the JSON response
    Ask {
        #[arg(short, long)]
        user: Option<String>,

        /// Request text
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },
    /// List loaded plugins and their handler bindings
    Plugins,
    /// Run a batch job from configuration file
    Run {
        /// Path to the batch configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
}
