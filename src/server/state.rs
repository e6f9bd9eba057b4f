//! Shared application state injected into every handler.

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::RelayConfig;
use crate::db::Database;
use crate::template::resolve_templates_path;

#[derive(Clone, Debug)]
pub struct AppState {
    /// Read-only settings, loaded once at startup.
    pub config: Arc<RelayConfig>,
    pub db: Database,
    /// Prompt template file, re-read on every chat request.
    pub templates_path: PathBuf,
}

impl AppState {
    pub fn new(config: RelayConfig, db: Database, templates_path: PathBuf) -> Self {
        Self {
            config: Arc::new(config),
            db,
            templates_path,
        }
    }

    /// Open the configured database, creating tables as needed.
    pub fn from_config(config: RelayConfig) -> Result<Self, Box<dyn Error>> {
        let db = Database::new(config.database_url.clone());
        db.init_schema()?;
        let templates_path = resolve_templates_path(&config.templates_path)?;
        Ok(Self::new(config, db, templates_path))
    }
}
