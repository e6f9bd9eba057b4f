//! # Prompt templates
//!
//! Prompt templates are grouped by chat type and name:
//!
//! ```yaml
//! llm_chat:
//!   default: "{{ input }}"
//!   with_history: |
//!     The following is a friendly conversation between a human and an AI.
//!     Current conversation:
//!     {{ history }}
//!     Human: {{ input }}
//!     AI:
//! ```
//!
//! Templates are the one piece of configuration that may change while the server runs:
//! [`get_prompt_template`] re-reads the file on every call, so edits are picked up by
//! the next request without a restart.
//!
//! Rendering uses [minijinja](https://docs.rs/minijinja) with two variables:
//! `input` (the user's query) and `history` (prior turns rendered as `Human:`/`AI:` lines).
//!
//! ## Behavior notes
//! - The CLI anchors a relative `templates_path` at the configuration file's directory
//!   ([`anchor_templates_path`]). Anything still relative resolves against
//!   [`crate::config_dir()`].
//! - The loader logs the resolved path with `tracing::info!` to help diagnose missing/invalid
//!   files.

use minijinja::{Environment, context};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    error::Error,
    fs, io,
    path::{Path, PathBuf},
};

/// Chat type -> template name -> template source.
pub type PromptTemplates = BTreeMap<String, BTreeMap<String, String>>;

/// One prior turn as sent by clients: `{"role": "user" | "assistant", "content": "..."}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, utoipa::ToSchema)]
pub struct History {
    pub role: String,
    pub content: String,
}

impl History {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// The templates written by `llm-relay init`.
pub fn default_templates() -> PromptTemplates {
    let mut llm_chat = BTreeMap::new();
    llm_chat.insert("default".to_string(), "{{ input }}".to_string());
    llm_chat.insert(
        "with_history".to_string(),
        "The following is a friendly conversation between a human and an AI. \
         The AI is talkative and provides lots of specific details from its context. \
         If the AI does not know the answer to a question, it truthfully says it does not know.\n\n\
         Current conversation:\n\
         {{ history }}\n\
         Human: {{ input }}\n\
         AI:"
            .to_string(),
    );

    let mut templates = PromptTemplates::new();
    templates.insert(crate::models::LLM_CHAT.to_string(), llm_chat);
    templates
}

/// Resolve `templates_path` against the config directory when it is relative.
pub fn resolve_templates_path(templates_path: &str) -> Result<PathBuf, Box<dyn Error>> {
    let path = Path::new(templates_path);
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(crate::config_dir()?.join(path))
    }
}

/// Anchor a relative `templates_path` at the directory of `config_path`.
///
/// The result is absolute, so [`resolve_templates_path`] leaves it alone.
pub fn anchor_templates_path(templates_path: &str, config_path: &Path) -> io::Result<String> {
    let path = Path::new(templates_path);
    if path.is_absolute() {
        return Ok(templates_path.to_string());
    }
    let config_path = std::path::absolute(config_path)?;
    let dir = config_path.parent().unwrap_or(config_path.as_path());
    Ok(dir.join(path).to_string_lossy().into_owned())
}

/// Read and parse the whole template file.
pub fn load_templates(path: &Path) -> Result<PromptTemplates, Box<dyn Error>> {
    tracing::info!("Loading prompt templates: {}", path.display());

    let content = fs::read_to_string(path)?;
    let templates: PromptTemplates = serde_yaml::from_str(&content)?;
    Ok(templates)
}

/// Fetch one template, re-reading the file first.
///
/// Returns `Ok(None)` when the file is fine but has no `chat_type`/`name` entry.
pub fn get_prompt_template(
    path: &Path,
    chat_type: &str,
    name: &str,
) -> Result<Option<String>, Box<dyn Error>> {
    let templates = load_templates(path)?;
    Ok(templates
        .get(chat_type)
        .and_then(|by_name| by_name.get(name))
        .cloned())
}

/// Render prior turns the way the `with_history` template expects them.
pub fn format_history(history: &[History]) -> String {
    history
        .iter()
        .map(|h| {
            let speaker = match h.role.as_str() {
                "assistant" | "ai" => "AI",
                "system" => "System",
                _ => "Human",
            };
            format!("{speaker}: {}", h.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Render `template` with `input` and the formatted `history`.
pub fn render_prompt(
    template: &str,
    input: &str,
    history: &[History],
) -> Result<String, minijinja::Error> {
    let env = Environment::new();
    env.render_str(
        template,
        context! {
            input => input,
            history => format_history(history),
        },
    )
}

/// Whether `template` renders the `history` variable itself.
///
/// Templates that do not reference it get the prior turns as separate chat messages.
pub fn uses_history(template: &str) -> bool {
    let env = Environment::new();
    env.template_from_str(template)
        .map(|t| t.undeclared_variables(false).contains("history"))
        .unwrap_or(false)
}
