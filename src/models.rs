//! # Database models
//!
//! Data structures that map to the relay's SQLite schema via **Diesel**.
//!
//! - [`Conversation`]: a chat thread, created on the first message of a session.
//! - [`Message`]: one record per turn (query + response) within a conversation.
//!
//! Reads and writes are split: the `Queryable` structs carry the DB-assigned
//! `create_time`, while the `New*` structs leave it to the column default.
//!
//! ## Diesel expectations
//!
//! The tables are created by [`crate::db::Database::init_schema`] and described in
//! [`crate::schema`]. `message.conversation_id` is a plain indexed column, not a
//! foreign key: a message may reference a conversation row that was never written.
//!
//! ## Basic usage
//!
//! ```no_run
//! use diesel::prelude::*;
//! use llm_relay::schema::message;
//! use llm_relay::models::{Message, NewMessage};
//!
//! # fn demo(conn: &mut SqliteConnection) -> Result<(), Box<dyn std::error::Error>> {
//! let msg: Message = diesel::insert_into(message::table)
//!     .values(&NewMessage {
//!         id: "5f0c0d7a8d7e4a43b3a1d9c0e3f1a2b4".into(),
//!         conversation_id: "1234".into(),
//!         chat_type: "llm_chat".into(),
//!         query: "hello".into(),
//!         response: String::new(),
//!         meta_data: "{}".into(),
//!     })
//!     .returning(Message::as_returning())
//!     .get_result(conn)?;
//! # Ok(()) }
//! ```

use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::Serialize;

/// Discriminator written to `chat_type` for plain LLM conversations.
pub const LLM_CHAT: &str = "llm_chat";

/// A chat thread.
///
/// ### Table
/// - `conversation`
#[derive(Queryable, Identifiable, Selectable, Serialize, Debug, Clone, PartialEq)]
#[diesel(table_name = crate::schema::conversation)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Conversation {
    /// 32 hex characters, caller-supplied or generated.
    pub id: String,
    /// Display label; not unique.
    pub name: String,
    /// Conversation kind, currently always [`LLM_CHAT`].
    pub chat_type: String,
    /// Set by the database at insertion.
    pub create_time: NaiveDateTime,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::conversation)]
pub struct NewConversation {
    pub id: String,
    pub name: String,
    pub chat_type: String,
}

/// One turn in a conversation.
///
/// ### Table
/// - `message`
///
/// ### Notes
/// - `response` is empty until the turn completes and the chat endpoint
///   writes the streamed answer back.
/// - `meta_data` holds a JSON object serialized as text; use
///   [`Message::meta_data_json`] to read it.
/// - `feedback_score` is `-1` until the user rates the answer.
#[derive(Queryable, Identifiable, Selectable, Serialize, Debug, Clone, PartialEq)]
#[diesel(table_name = crate::schema::message)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub chat_type: String,
    pub query: String,
    pub response: String,
    pub meta_data: String,
    pub feedback_score: i32,
    pub feedback_reason: String,
    pub create_time: NaiveDateTime,
}

impl Message {
    /// Parse `meta_data`, falling back to an empty object when the stored text is not JSON.
    pub fn meta_data_json(&self) -> serde_json::Value {
        serde_json::from_str(&self.meta_data)
            .unwrap_or_else(|_| serde_json::Value::Object(Default::default()))
    }
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::message)]
pub struct NewMessage {
    pub id: String,
    pub conversation_id: String,
    pub chat_type: String,
    pub query: String,
    pub response: String,
    pub meta_data: String,
}
