//! This module defines the command-line interface for the application using `clap`.
//!
//! It provides a `Cli` struct that represents the parsed command-line arguments,
//! and a `Commands` enum that represents the available subcommands and their
//! options.
//!
//! # Examples
//!
//! Parsing command-line arguments:
//!
//! ```no_run
//! use clap::Parser;
//! use llm_relay::commands::{Cli, Commands};
//!
//! let cli = Cli::parse();
//! match cli.command {
//!     Commands::Serve => { /* start the backend */ }
//!     Commands::Chat { .. } => { /* open the dashboard */ }
//!     Commands::Init => { /* write default files */ }
//! }
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Represents the parsed command-line arguments.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, propagate_version = true, color = clap::ColorChoice::Always)]
pub struct Cli {
    /// Configuration file; defaults to `config.yaml` in the platform config directory.
    #[arg(short, long, global = true, env = "LLM_RELAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// The parsed subcommand and its options.
    #[command(subcommand)]
    pub command: Commands,
}

/// Represents the available subcommands and their options.
#[derive(Subcommand, Debug)]
#[command(about, long_about = None, color = clap::ColorChoice::Always)]
pub enum Commands {
    /// Run the relay backend.
    #[clap(name = "serve", alias = "s")]
    Serve,

    /// Open the terminal dashboard against a running backend.
    ///
    /// This subcommand can be invoked with either 'c' or 'chat'.
    #[clap(name = "chat", alias = "c")]
    Chat {
        /// Session to start in.
        #[arg(name = "session", short = 's')]
        session: Option<String>,

        /// Prompt template under `llm_chat`.
        #[arg(name = "template", short = 't', default_value = "default")]
        template: String,
    },

    /// Write a default `config.yaml` and `prompt_templates.yaml`.
    Init,
}
