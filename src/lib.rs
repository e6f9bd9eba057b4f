//! # LLM Relay (library root)
//!
//! A chat relay between a terminal dashboard and OpenAI compatible providers:
//! - An axum backend with `POST /chat` streaming answers as newline-delimited JSON
//!   (`server`).
//! - SQLite persistence of conversations and messages through scoped sessions
//!   (`db`, `models`, `repository`, `schema`).
//! - A streaming request client with bounded retries, usable with or without a
//!   runtime (`client`).
//! - Model invocation on top of async-openai (`llm`).
//! - The terminal dashboard with slash commands (`dashboard`).
//! - CLI parsing, configuration and prompt templates (`commands`, `config`, `template`).
//!
//! Data flows dashboard → [`client::ApiRequest`] → `/chat` → [`llm::ChatModel`] →
//! provider, and tokens flow back along the same path.
//!
//! ## Configuration layout
//! `config.yaml` and `prompt_templates.yaml` live in the per-platform config directory
//! returned by [`config_dir`], e.g.:
//!
//! - macOS: `~/Library/Application Support/com.llm-relay.llm-relay`
//! - Linux (XDG): `~/.config/llm-relay`
//! - Windows: `C:\Users\<you>\AppData\Roaming\llm-relay\llm-relay\config`
//!
//! ## Modules
//! - [`client`], [`commands`], [`config`], [`dashboard`], [`db`], [`llm`], [`models`],
//!   [`repository`], [`schema`], [`schemas`], [`server`], [`template`]

use directories::ProjectDirs;
use std::error::Error;

pub mod client;
pub mod commands;
pub mod config;
pub mod dashboard;
pub mod db;
pub mod llm;
pub mod models;
pub mod repository;
pub mod schema;
pub mod schemas;
pub mod server;
pub mod template;

/// Return the per-platform configuration directory used by the relay.
///
/// This uses [`directories::ProjectDirs`] with the application triple
/// `("com", "llm-relay", "llm-relay")`.
///
/// The directory is **not** created by this function; callers that need it should
/// create it with `fs::create_dir_all`.
///
/// # Errors
/// Returns an error if the platform configuration directory cannot be determined
/// (which is rare but possible in heavily sandboxed environments).
///
/// # Examples
/// ```rust
/// let cfg = llm_relay::config_dir().expect("has a config dir");
/// println!("config at {}", cfg.display());
/// ```
pub fn config_dir() -> Result<std::path::PathBuf, Box<dyn Error>> {
    let proj_dirs = ProjectDirs::from("com", "llm-relay", "llm-relay")
        .ok_or("Unable to determine config directory")?;
    let config_dir = proj_dirs.config_dir().to_path_buf();

    Ok(config_dir)
}
