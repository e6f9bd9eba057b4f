//! # Message repository
//!
//! Units of work over the `conversation` and `message` tables. Every function takes a
//! live connection and is meant to run inside [`crate::db::Database::with_session`] or
//! [`crate::db::Database::run`], which own the transaction boundary.
//!
//! Identifiers are 128-bit random tokens rendered as 32 lowercase hex characters.
//! They are generated whenever the caller leaves one empty.

use diesel::dsl::sql;
use diesel::prelude::*;
use diesel::sql_types::BigInt;
use serde_json::Value;
use tracing::debug;

use crate::db::DbError;
use crate::models::{Conversation, Message, NewConversation, NewMessage};
use crate::schema::{conversation, message};

const MAX_TEXT_CHARS: usize = 4096;
const MAX_NAME_CHARS: usize = 50;
const MAX_REASON_CHARS: usize = 255;

/// A fresh 32-character hex identifier.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Arguments for [`add_message_to_db`].
#[derive(Debug, Clone, Default)]
pub struct NewMessageArgs {
    /// Owning conversation; generated when empty.
    pub conversation_id: String,
    pub chat_type: String,
    pub query: String,
    pub response: String,
    /// Caller-chosen message id; generated when `None` or empty.
    pub message_id: Option<String>,
    pub meta_data: Option<Value>,
}

impl NewMessageArgs {
    pub fn new(
        conversation_id: impl Into<String>,
        chat_type: impl Into<String>,
        query: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            chat_type: chat_type.into(),
            query: query.into(),
            ..Default::default()
        }
    }
}

/// Insert one message row and return its id.
pub fn add_message_to_db(
    conn: &mut SqliteConnection,
    args: NewMessageArgs,
) -> Result<String, DbError> {
    let message_id = args
        .message_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(new_id);
    let conversation_id = if args.conversation_id.is_empty() {
        new_id()
    } else {
        args.conversation_id
    };
    let meta_data = args
        .meta_data
        .unwrap_or_else(|| Value::Object(Default::default()))
        .to_string();

    let new_message = NewMessage {
        id: message_id,
        conversation_id,
        chat_type: args.chat_type,
        query: truncate(&args.query, MAX_TEXT_CHARS),
        response: truncate(&args.response, MAX_TEXT_CHARS),
        meta_data,
    };

    let stored: Message = diesel::insert_into(message::table)
        .values(&new_message)
        .returning(Message::as_returning())
        .get_result(conn)?;

    debug!(message_id = %stored.id, conversation_id = %stored.conversation_id, "message stored");
    Ok(stored.id)
}

/// Ensure a conversation row exists and return its id.
///
/// An existing row with the same id is left as is; conversations are never mutated.
pub fn add_conversation_to_db(
    conn: &mut SqliteConnection,
    chat_type: &str,
    name: &str,
    conversation_id: Option<&str>,
) -> Result<String, DbError> {
    let id = conversation_id
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(new_id);

    let existing: Option<Conversation> = conversation::table
        .find(id.as_str())
        .select(Conversation::as_select())
        .first(conn)
        .optional()?;

    if existing.is_none() {
        diesel::insert_into(conversation::table)
            .values(&NewConversation {
                id: id.clone(),
                name: truncate(name, MAX_NAME_CHARS),
                chat_type: chat_type.to_string(),
            })
            .execute(conn)?;
        debug!(conversation_id = %id, "conversation created");
    }

    Ok(id)
}

/// Write the completed response (and optionally replace the metadata) of a message.
///
/// Returns `None` when no message has `message_id`.
pub fn update_message(
    conn: &mut SqliteConnection,
    message_id: &str,
    response: Option<&str>,
    meta_data: Option<&Value>,
) -> Result<Option<String>, DbError> {
    let Some(current) = get_message_by_id(conn, message_id)? else {
        return Ok(None);
    };

    let response = response
        .map(|r| truncate(r, MAX_TEXT_CHARS))
        .unwrap_or(current.response);
    let meta_data = meta_data
        .map(Value::to_string)
        .unwrap_or(current.meta_data);

    diesel::update(message::table.find(message_id))
        .set((
            message::response.eq(response),
            message::meta_data.eq(meta_data),
        ))
        .execute(conn)?;

    Ok(Some(message_id.to_string()))
}

pub fn get_message_by_id(
    conn: &mut SqliteConnection,
    message_id: &str,
) -> Result<Option<Message>, DbError> {
    let found = message::table
        .find(message_id)
        .select(Message::as_select())
        .first(conn)
        .optional()?;
    Ok(found)
}

/// Record the user's rating of an answer.
pub fn feedback_message_to_db(
    conn: &mut SqliteConnection,
    message_id: &str,
    feedback_score: i32,
    feedback_reason: &str,
) -> Result<Option<String>, DbError> {
    let updated = diesel::update(message::table.find(message_id))
        .set((
            message::feedback_score.eq(feedback_score),
            message::feedback_reason.eq(truncate(feedback_reason, MAX_REASON_CHARS)),
        ))
        .execute(conn)?;

    Ok((updated > 0).then(|| message_id.to_string()))
}

/// The last `limit` answered messages of a conversation, oldest first.
pub fn filter_message(
    conn: &mut SqliteConnection,
    conversation_id: &str,
    limit: i64,
) -> Result<Vec<Message>, DbError> {
    let mut messages: Vec<Message> = message::table
        .filter(message::conversation_id.eq(conversation_id))
        .filter(message::response.ne(""))
        .order(sql::<BigInt>("message.rowid").desc())
        .limit(limit)
        .select(Message::as_select())
        .load(conn)?;
    messages.reverse();
    Ok(messages)
}
