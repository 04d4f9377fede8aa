//! Command-line interface for routewarden
//!
//! Uses clap with derive for type-safe CLI parsing

use clap::{ArgAction, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

/// routewarden - health checks that announce and withdraw BGP routes
#[derive(Parser)]
#[command(name = "routewarden")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path (.toml or .json)
    #[arg(short, long, default_value = "routewarden.toml", global = true)]
    pub config: PathBuf,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Supervise all checks and write route commands to the control channel
    Run,

    /// Validate configuration and show the routes each check would announce
    Check {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Run one probe for a check and print the outcome
    Probe {
        /// Check name
        check: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts
    Completion {
        /// Shell to generate completion for
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Generate shell completion scripts
    pub fn generate_completion(shell: Shell) {
        let mut cmd = Self::command();
        clap_complete::generate(shell, &mut cmd, "routewarden", &mut std::io::stdout());
    }
}
