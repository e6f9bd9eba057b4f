//! This module provides functionality for loading and handling the relay's configuration.
//!
//! It defines the [`RelayConfig`] struct, which holds every setting the backend and the
//! dashboard need, and a [`load_config`] function to load it from a YAML file.
//!
//! The configuration is read **once** at process start and shared read-only (usually as
//! `Arc<RelayConfig>`). Prompt templates are the one exception: they live in their own
//! file and are re-read on demand by [`crate::template`].
//!
//! # Examples
//!
//! Loading the configuration from a file:
//!
//! ```no_run
//! use llm_relay::config::{RelayConfig, load_config};
//!
//! let config_file_path = "/path/to/config.yaml";
//! let config: RelayConfig = load_config(config_file_path).unwrap();
//! println!("{:?}", config);
//! ```

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, env, error::Error, fs, time::Duration};

use tracing::*;

/// Name of the environment variable consulted for providers without an `api_key`.
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Connection settings for one OpenAI compatible provider.
///
/// Missing values stay `None`; nothing at this layer checks that a provider is usable.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct ProviderConfig {
    /// The model identifier sent to the provider.
    pub model_name: String,

    /// The base URL of the provider API, e.g. `https://api.openai.com/v1`.
    pub api_base_url: String,

    /// The API key used to authenticate requests.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Optional HTTP(S) proxy for requests to this provider.
    #[serde(default)]
    pub openai_proxy: Option<String>,

    /// Provider default temperature.
    #[serde(default)]
    pub temperature: Option<f32>,

    /// Provider default token ceiling.
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

/// Represents the relay's configuration.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct RelayConfig {
    /// Key into `online_llm_model` used when a request names an unknown model.
    pub model_provider: String,

    /// Known providers, keyed by provider name (`openai-api`, ...).
    pub online_llm_model: BTreeMap<String, ProviderConfig>,

    /// Model names offered to clients; the first one is the default.
    pub llm_models: Vec<String>,

    /// Default sampling temperature.
    pub temperature: f32,

    /// Default number of past turns sent along with a query.
    pub history_len: i32,

    /// Default token ceiling for answers; `None` leaves it to the provider.
    #[serde(default)]
    pub max_tokens: Option<u32>,

    // SQLite database path or URL
    pub database_url: String,

    // Address the backend binds to
    pub bind_address: String,

    // Base URL the dashboard uses to reach the backend
    pub api_address: String,

    // Timeout for dashboard -> backend requests
    pub http_timeout_secs: u64,

    // Prompt template file; relative paths resolve against the config directory
    pub templates_path: String,

    // tracing filter used when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    // Log full error source chains
    #[serde(default)]
    pub log_verbose: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        let mut online_llm_model = BTreeMap::new();
        online_llm_model.insert(
            "openai-api".to_string(),
            ProviderConfig {
                model_name: "gpt-3.5-turbo".to_string(),
                api_base_url: "https://api.openai.com/v1".to_string(),
                api_key: None,
                openai_proxy: None,
                temperature: Some(0.0),
                max_tokens: None,
            },
        );

        Self {
            model_provider: "openai-api".to_string(),
            online_llm_model,
            llm_models: vec!["gpt-3.5-turbo".to_string()],
            temperature: 0.0,
            history_len: 3,
            max_tokens: None,
            database_url: "llm_relay.db".to_string(),
            bind_address: "127.0.0.1:7861".to_string(),
            api_address: "http://127.0.0.1:7861".to_string(),
            http_timeout_secs: 300,
            templates_path: "prompt_templates.yaml".to_string(),
            log_level: default_log_level(),
            log_verbose: false,
        }
    }
}

impl RelayConfig {
    /// Look up the provider serving `model_name`.
    ///
    /// A provider matches when its `model_name` equals the request's model or its key
    /// equals it. Otherwise the default `model_provider` entry is returned, which may
    /// itself be absent.
    pub fn model_config(&self, model_name: &str) -> Option<&ProviderConfig> {
        self.online_llm_model
            .iter()
            .find(|(key, provider)| provider.model_name == model_name || *key == model_name)
            .map(|(_, provider)| provider)
            .or_else(|| self.online_llm_model.get(&self.model_provider))
    }

    /// The first advertised model, used when a request does not name one.
    pub fn default_model(&self) -> &str {
        self.llm_models
            .first()
            .map(String::as_str)
            .unwrap_or("gpt-3.5-turbo")
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Fill missing provider keys from `OPENAI_API_KEY`.
    pub fn apply_env(&mut self) {
        if let Ok(key) = env::var(API_KEY_ENV) {
            for provider in self.online_llm_model.values_mut() {
                if provider.api_key.as_deref().is_none_or(str::is_empty) {
                    provider.api_key = Some(key.clone());
                }
            }
        }
    }
}

/// Loads the relay's configuration from a YAML file.
///
/// A `.env` file in the working directory, if any, is loaded first so that
/// `OPENAI_API_KEY` can come from there.
///
/// # Parameters
///
/// - `file`: The path to the YAML configuration file.
///
/// # Returns
///
/// - `Ok(RelayConfig)`: The loaded configuration.
/// - `Err(Box<dyn Error>)`: An error occurred while reading the file or parsing the YAML.
pub fn load_config(file: &str) -> Result<RelayConfig, Box<dyn Error>> {
    debug!("Loading config: {}", file);
    let _ = dotenvy::dotenv();
    let content = fs::read_to_string(file)?;
    let mut config: RelayConfig = serde_yaml::from_str(&content)?;
    config.apply_env();
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const VALID: &str = r#"
model_provider: "openai-api"
online_llm_model:
  openai-api:
    model_name: "gpt-3.5-turbo"
    api_base_url: "https://api.openai.com/v1"
    api_key: "example_api_key"
    temperature: 0
  local:
    model_name: "mistral-7b"
    api_base_url: "http://localhost:5001/v1"
llm_models: ["gpt-3.5-turbo", "mistral-7b"]
temperature: 0.7
history_len: 3
database_url: "relay.db"
bind_address: "127.0.0.1:7861"
api_address: "http://127.0.0.1:7861"
http_timeout_secs: 60
templates_path: "prompt_templates.yaml"
"#;

    #[test]
    fn test_load_config_valid_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "{VALID}").unwrap();

        let config = load_config(temp_file.path().to_str().unwrap());

        assert!(config.is_ok());
        let config = config.unwrap();
        assert_eq!(config.model_provider, "openai-api");
        assert_eq!(config.online_llm_model.len(), 2);
        assert_eq!(config.llm_models[0], "gpt-3.5-turbo");
        assert_eq!(config.temperature, 0.7);
        assert_eq!(config.history_len, 3);
        assert_eq!(config.database_url, "relay.db");
        assert_eq!(config.http_timeout(), Duration::from_secs(60));
        assert_eq!(config.log_level, "info");
        assert!(!config.log_verbose);
    }

    #[test]
    fn test_load_config_invalid_file() {
        let config = load_config("non/existent/path");
        assert!(config.is_err());
    }

    #[test]
    fn test_load_config_invalid_format() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, r#"invalid: config: format"#).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap());
        assert!(config.is_err());
    }

    #[test]
    fn test_model_config_lookup() {
        let config: RelayConfig = serde_yaml::from_str(VALID).unwrap();

        let local = config.model_config("mistral-7b").unwrap();
        assert_eq!(local.api_base_url, "http://localhost:5001/v1");
        assert_eq!(local.api_key, None);

        let by_key = config.model_config("local").unwrap();
        assert_eq!(by_key.model_name, "mistral-7b");

        // Unknown models fall back to the default provider.
        let fallback = config.model_config("unknown-model").unwrap();
        assert_eq!(fallback.model_name, "gpt-3.5-turbo");
    }

    #[test]
    fn test_model_config_absent_provider() {
        let config = RelayConfig {
            model_provider: "azure-api".to_string(),
            online_llm_model: BTreeMap::new(),
            ..RelayConfig::default()
        };
        assert!(config.model_config("gpt-3.5-turbo").is_none());
    }

    #[test]
    fn test_default_round_trips_through_yaml() {
        let yaml = serde_yaml::to_string(&RelayConfig::default()).unwrap();
        let parsed: RelayConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, RelayConfig::default());
        assert_eq!(parsed.default_model(), "gpt-3.5-turbo");
    }
}
