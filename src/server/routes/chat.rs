//! Chat routes.
//!
//! `POST /chat` records the turn, renders the prompt, and relays the model's answer as
//! newline-delimited JSON. Each line is `{"text": ..., "message_id": ...}`. A provider
//! fault ends the body with one `{"code": 500, "msg": ...}` line.
//!
//! The provider call runs in a spawned producer task that feeds an mpsc channel. The
//! response body drains that channel. The producer persists the final (or partial)
//! answer before closing the channel, so a client that has read the whole body can rely
//! on the stored response.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures::{Stream, StreamExt, stream};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use utoipa::OpenApi;

use crate::db::Database;
use crate::llm::{ChatModel, LlmError, get_chat_model};
use crate::models::LLM_CHAT;
use crate::repository::{
    NewMessageArgs, add_conversation_to_db, add_message_to_db, feedback_message_to_db,
    filter_message, new_id, update_message,
};
use crate::schemas::{
    BaseResponse, ChatChunk, ChatRequest, ErrorRecord, FeedbackRequest, MessageIdData,
};
use crate::server::error::ServerError;
use crate::server::state::AppState;
use crate::template::{History, get_prompt_template, render_prompt, uses_history};

const CHANNEL_CAPACITY: usize = 64;
const NDJSON: &str = "application/x-ndjson";

#[derive(OpenApi)]
#[openapi(
    paths(chat, chat_feedback),
    components(schemas(ChatRequest, ChatChunk, ErrorRecord, FeedbackRequest, History))
)]
pub struct ChatApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/chat", post(chat))
        .route("/chat/feedback", post(chat_feedback))
}

/// Run `fut` and signal `done` when it finishes, fails, or unwinds.
pub async fn wrap_done<F, T, E>(fut: F, done: CancellationToken)
where
    F: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let _guard = done.drop_guard();
    if let Err(err) = fut.await {
        error!("Caught exception: {err}");
    }
}

fn ndjson_line<T: Serialize>(value: &T) -> Option<String> {
    match serde_json::to_string(value) {
        Ok(mut line) => {
            line.push('\n');
            Some(line)
        }
        Err(err) => {
            error!("failed to encode stream record: {err}");
            None
        }
    }
}

/// Drain the producer channel, then wait once for its completion signal.
fn drain(
    rx: mpsc::Receiver<String>,
    done: CancellationToken,
) -> impl Stream<Item = Result<String, Infallible>> {
    stream::unfold((rx, done), |(mut rx, done)| async move {
        match rx.recv().await {
            Some(line) => Some((Ok(line), (rx, done))),
            None => {
                done.cancelled().await;
                None
            }
        }
    })
}

/// Everything the producer task needs, detached from the request.
struct Turn {
    model: ChatModel,
    prompt: String,
    history: Vec<History>,
    message_id: String,
}

async fn relay_answer(
    turn: Turn,
    db: Database,
    tx: mpsc::Sender<String>,
) -> Result<(), ServerError> {
    let Turn {
        model,
        prompt,
        history,
        message_id,
    } = turn;
    let mut answer = String::new();

    let outcome: Result<(), LlmError> = async {
        if model.streaming {
            let mut tokens = model.stream(prompt, &history).await?;
            while let Some(token) = tokens.next().await {
                let token = token?;
                answer.push_str(&token);
                let chunk = ChatChunk {
                    text: token,
                    message_id: Some(message_id.clone()),
                };
                let Some(line) = ndjson_line(&chunk) else {
                    continue;
                };
                if tx.send(line).await.is_err() {
                    debug!(%message_id, "client went away; stopping relay");
                    break;
                }
            }
        } else {
            answer = model.invoke(prompt, &history).await?;
            let chunk = ChatChunk {
                text: answer.clone(),
                message_id: Some(message_id.clone()),
            };
            if let Some(line) = ndjson_line(&chunk) {
                let _ = tx.send(line).await;
            }
        }
        Ok(())
    }
    .await;

    if let Err(err) = outcome {
        error!(%message_id, "{err}");
        let record = ErrorRecord::internal(err.to_string());
        if let Some(line) = ndjson_line(&record) {
            let _ = tx.send(line).await;
        }
    }

    let id = message_id.clone();
    db.run(move |conn| update_message(conn, &id, Some(&answer), None))
        .await?;
    info!(%message_id, "answer stored");
    Ok(())
}

/// Chat with the configured model.
#[utoipa::path(
    post,
    path = "/chat",
    tag = "chat",
    request_body = ChatRequest,
    responses(
        (status = 200, description = "Newline-delimited JSON chunks", body = ChatChunk, content_type = "application/x-ndjson"),
        (status = 404, description = "Unknown prompt template"),
        (status = 500, description = "Model not configured or backend error"),
    )
)]
pub async fn chat(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatRequest>,
) -> Result<Response, ServerError> {
    let model_name = if req.model_name.is_empty() {
        state.config.default_model().to_string()
    } else {
        req.model_name.clone()
    };
    debug!(model = %model_name, prompt_name = %req.prompt_name, stream = req.stream, "chat request");

    let template = get_prompt_template(&state.templates_path, LLM_CHAT, &req.prompt_name)
        .map_err(|e| ServerError::Internal(format!("failed to load prompt templates: {e}")))?
        .ok_or_else(|| {
            ServerError::NotFound(format!("prompt template '{}' not found", req.prompt_name))
        })?;

    if state.config.model_config(&model_name).is_none() {
        return Err(ServerError::ModelUnavailable(format!(
            "model '{model_name}' is not configured"
        )));
    }
    let model = get_chat_model(
        &state.config,
        &model_name,
        req.temperature,
        req.max_tokens,
        req.stream,
    )?;

    let load_history = !req.conversation_id.is_empty() && req.history_len > 0;
    let history: Vec<History> = if load_history {
        let conversation_id = req.conversation_id.clone();
        let history_len = i64::from(req.history_len);
        state
            .db
            .run(move |conn| filter_message(conn, &conversation_id, history_len))
            .await?
            .into_iter()
            .flat_map(|m| [History::new("user", m.query), History::new("assistant", m.response)])
            .collect()
    } else {
        req.history
    };

    // Nothing is stored for a turn whose prompt cannot be rendered.
    let prompt = render_prompt(&template, &req.query, &history)
        .map_err(|e| ServerError::Internal(format!("failed to render prompt: {e}")))?;
    // History already inlined by the template is not sent twice.
    let history = if uses_history(&template) {
        Vec::new()
    } else {
        history
    };

    let conversation_id = if req.conversation_id.is_empty() {
        new_id()
    } else {
        req.conversation_id
    };
    let query = req.query;
    let message_id = state
        .db
        .run(move |conn| {
            add_conversation_to_db(conn, LLM_CHAT, "", Some(&conversation_id))?;
            add_message_to_db(conn, NewMessageArgs::new(&conversation_id, LLM_CHAT, query))
        })
        .await?;

    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let done = CancellationToken::new();
    let turn = Turn {
        model,
        prompt,
        history,
        message_id,
    };
    tokio::spawn(wrap_done(
        relay_answer(turn, state.db.clone(), tx),
        done.clone(),
    ));

    Ok((
        [(header::CONTENT_TYPE, NDJSON)],
        Body::from_stream(drain(rx, done)),
    )
        .into_response())
}

/// Rate a stored answer.
#[utoipa::path(
    post,
    path = "/chat/feedback",
    tag = "chat",
    request_body = FeedbackRequest,
    responses(
        (status = 200, description = "Feedback stored", body = BaseResponse<MessageIdData>),
        (status = 404, description = "Unknown message id"),
    )
)]
pub async fn chat_feedback(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FeedbackRequest>,
) -> Result<Json<BaseResponse<MessageIdData>>, ServerError> {
    let FeedbackRequest {
        message_id,
        score,
        reason,
    } = req;
    let id = message_id.clone();
    let updated = state
        .db
        .run(move |conn| feedback_message_to_db(conn, &id, score, &reason))
        .await?;

    match updated {
        Some(message_id) => {
            info!(%message_id, score, "feedback stored");
            Ok(Json(BaseResponse::success(MessageIdData { message_id })))
        }
        None => Err(ServerError::NotFound(format!(
            "message '{message_id}' not found"
        ))),
    }
}
