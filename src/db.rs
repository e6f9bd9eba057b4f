//! # Scoped database sessions
//!
//! Every unit of work against the relay's SQLite database goes through
//! [`Database::with_session`]: a fresh connection is opened, the closure runs inside a
//! single transaction, and the connection is dropped on every exit path.
//!
//! - `Ok` from the closure commits and hands the value back.
//! - `Err` rolls back and returns the closure's error untouched.
//!
//! [`Database::run`] is the async entry point used by request handlers. It moves the
//! unit of work onto tokio's blocking pool, so the commit is a suspension point for the
//! handler instead of a stall for the whole runtime.
//!
//! ```no_run
//! use llm_relay::db::{Database, DbError};
//! use llm_relay::repository::{add_message_to_db, NewMessageArgs};
//!
//! # fn demo() -> Result<(), DbError> {
//! let db = Database::new("relay.db");
//! db.init_schema()?;
//! let id = db.with_session(|conn| {
//!     add_message_to_db(conn, NewMessageArgs::new("", "llm_chat", "hello"))
//! })?;
//! println!("stored message {id}");
//! # Ok(()) }
//! ```

use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use thiserror::Error;
use tracing::debug;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS conversation (
    id VARCHAR(32) PRIMARY KEY NOT NULL,
    name VARCHAR(50) NOT NULL DEFAULT '',
    chat_type VARCHAR(50) NOT NULL DEFAULT '',
    create_time TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
CREATE TABLE IF NOT EXISTS message (
    id VARCHAR(32) PRIMARY KEY NOT NULL,
    conversation_id VARCHAR(32) NOT NULL DEFAULT '',
    chat_type VARCHAR(50) NOT NULL DEFAULT '',
    query VARCHAR(4096) NOT NULL DEFAULT '',
    response VARCHAR(4096) NOT NULL DEFAULT '',
    meta_data TEXT NOT NULL DEFAULT '{}',
    feedback_score INTEGER NOT NULL DEFAULT -1,
    feedback_reason VARCHAR(255) NOT NULL DEFAULT '',
    create_time TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS ix_message_conversation_id ON message (conversation_id);
"#;

/// Errors raised while acquiring a session or running a unit of work.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("unable to open database: {0}")]
    Connection(#[from] ConnectionError),

    #[error("database query failed: {0}")]
    Query(#[from] diesel::result::Error),

    #[error("database task did not complete: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Handle to the relay database.
///
/// Holds only the connection URL; connections are opened per unit of work and are
/// never shared between callers.
#[derive(Debug, Clone)]
pub struct Database {
    url: String,
}

impl Database {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Create the `conversation` and `message` tables if they are missing.
    pub fn init_schema(&self) -> Result<(), DbError> {
        let mut conn = SqliteConnection::establish(&self.url)?;
        conn.batch_execute(SCHEMA_SQL)?;
        debug!(database_url = %self.url, "schema ready");
        Ok(())
    }

    /// Run `f` inside one transaction on a freshly acquired connection.
    ///
    /// Commits when `f` returns `Ok`, rolls back when it returns `Err`. The error is
    /// passed through unchanged. The connection is released before this returns,
    /// whatever the outcome.
    pub fn with_session<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T, E>,
        E: From<diesel::result::Error> + From<ConnectionError>,
    {
        let mut conn = SqliteConnection::establish(&self.url)?;
        conn.batch_execute("PRAGMA busy_timeout = 5000;")?;
        let result = conn.transaction(f);
        if result.is_err() {
            debug!(database_url = %self.url, "unit of work rolled back");
        }
        result
    }

    /// Async form of [`Database::with_session`], executed on the blocking pool.
    pub async fn run<T, F>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T, DbError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_session(f)).await?
    }
}
