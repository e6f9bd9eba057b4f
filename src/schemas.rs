//! Wire types shared by the backend routes and the request client.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::template::History;

/// Standard envelope for non-streaming responses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct BaseResponse<T> {
    /// API status code; `200` means success.
    pub code: u16,
    /// API status message.
    pub msg: String,
    /// Payload, if any.
    pub data: Option<T>,
}

impl<T> BaseResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: 200,
            msg: "success".to_string(),
            data: Some(data),
        }
    }

    pub fn error(code: u16, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
            data: None,
        }
    }
}

fn default_history_len() -> i32 {
    -1
}

fn default_stream() -> bool {
    true
}

fn default_prompt_name() -> String {
    "default".to_string()
}

/// Request body for `POST /chat`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct ChatRequest {
    /// The user's input.
    pub query: String,
    /// Conversation to attach the turn to; generated when empty.
    #[serde(default)]
    pub conversation_id: String,
    /// Number of persisted turns to load as history; `<= 0` uses `history` instead.
    #[serde(default = "default_history_len")]
    pub history_len: i32,
    /// Prior turns supplied by the client.
    #[serde(default)]
    pub history: Vec<History>,
    /// Stream tokens as they arrive instead of one final object.
    #[serde(default = "default_stream")]
    pub stream: bool,
    /// Model to use; empty picks the first configured model.
    #[serde(default)]
    pub model_name: String,
    /// Sampling temperature; `None` keeps the provider default.
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Token ceiling; `None` keeps the provider default.
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Template name under `llm_chat`.
    #[serde(default = "default_prompt_name")]
    pub prompt_name: String,
}

impl ChatRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            conversation_id: String::new(),
            history_len: default_history_len(),
            history: Vec::new(),
            stream: default_stream(),
            model_name: String::new(),
            temperature: None,
            max_tokens: None,
            prompt_name: default_prompt_name(),
        }
    }
}

/// One streamed piece of an answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct ChatChunk {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

/// Error marker carried inside a stream: `{"code": 500, "msg": "..."}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct ErrorRecord {
    pub code: u16,
    pub msg: String,
}

impl ErrorRecord {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            code: 500,
            msg: msg.into(),
        }
    }
}

/// Request body for `POST /chat/feedback`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct FeedbackRequest {
    pub message_id: String,
    /// User rating; higher is better.
    pub score: i32,
    #[serde(default)]
    pub reason: String,
}

/// Payload of `POST /message` and `POST /chat/feedback`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct MessageIdData {
    pub message_id: String,
}
