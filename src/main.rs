//! Main module for the LLM Relay CLI application (llm-relay).
//!
//! This module parses the command line, loads the configuration, sets up logging and
//! dispatches to the backend, the dashboard, or initialization.
//!
//! # Examples
//!
//! Initializing the configuration and prompt templates:
//!
//! ```sh
//! llm-relay init
//! ```
//!
//! Running the backend, then chatting with it from another terminal:
//!
//! ```sh
//! llm-relay serve
//! llm-relay chat -s work
//! ```

use clap::Parser;
use llm_relay::{
    commands::{Cli, Commands},
    config::{self, RelayConfig},
    config_dir, dashboard, server, template,
};
use once_cell::sync::OnceCell;
use std::{
    error::Error,
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

static TRACING: OnceCell<()> = OnceCell::new();

/// Install the global subscriber once. `RUST_LOG` wins over `log_level`.
fn init_tracing(log_level: &str) {
    TRACING.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .or_else(|_| log_level.parse::<EnvFilter>())
            .unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    });
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config_path = match cli.config {
        Some(path) => path,
        None => config_dir()?.join("config.yaml"),
    };

    match cli.command {
        Commands::Init => {
            init_tracing("info");
            init(&config_path)?;
        }
        Commands::Serve => {
            let relay_config = load(&config_path)?;
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(server::serve(relay_config))?;
        }
        Commands::Chat { session, template } => {
            let relay_config = load(&config_path)?;
            dashboard::run(&relay_config, session, &template)?;
        }
    }

    Ok(())
}

/// Load the configuration, start logging, and anchor a relative `templates_path` at the
/// configuration file's directory.
fn load(config_path: &Path) -> Result<RelayConfig, Box<dyn Error>> {
    let path_str = config_path
        .to_str()
        .ok_or("configuration path is not valid UTF-8")?;
    let mut relay_config = config::load_config(path_str)?;
    init_tracing(&relay_config.log_level);
    debug!("Config loaded from {}", config_path.display());

    relay_config.templates_path =
        template::anchor_templates_path(&relay_config.templates_path, config_path)?;
    Ok(relay_config)
}

/// Write a default configuration and prompt template file next to each other.
///
/// Existing files are left untouched.
///
/// # Errors
///
/// Returns an error if the directory cannot be created or a file cannot be written.
fn init(config_path: &Path) -> Result<(), Box<dyn Error>> {
    let dir = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    info!("Creating config directory: {}", dir.display());
    fs::create_dir_all(&dir)?;

    let relay_config = RelayConfig::default();
    write_if_missing(config_path, &serde_yaml::to_string(&relay_config)?)?;

    let templates_path = dir.join(&relay_config.templates_path);
    write_if_missing(
        &templates_path,
        &serde_yaml::to_string(&template::default_templates())?,
    )?;

    Ok(())
}

fn write_if_missing(path: &Path, content: &str) -> Result<(), Box<dyn Error>> {
    if path.exists() {
        info!("Keeping existing file: {}", path.display());
        return Ok(());
    }
    info!("Creating file: {}", path.display());
    fs::write(path, content)?;
    Ok(())
}
