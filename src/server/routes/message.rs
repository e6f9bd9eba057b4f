//! Demo write endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use tracing::info;
use utoipa::OpenApi;

use crate::models::LLM_CHAT;
use crate::repository::{NewMessageArgs, add_message_to_db};
use crate::schemas::{BaseResponse, MessageIdData};
use crate::server::error::ServerError;
use crate::server::state::AppState;

const DEMO_CONVERSATION_ID: &str = "1234";
const DEMO_QUERY: &str = "test query";

#[derive(OpenApi)]
#[openapi(paths(add_message), components(schemas(MessageIdData)))]
pub struct MessageApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/message", post(add_message))
}

/// Store a fixed sample message and return its id.
#[utoipa::path(
    post,
    path = "/message",
    tag = "message",
    responses(
        (status = 200, description = "Sample message stored", body = BaseResponse<MessageIdData>),
        (status = 500, description = "Database error"),
    )
)]
pub async fn add_message(
    State(state): State<Arc<AppState>>,
) -> Result<Json<BaseResponse<MessageIdData>>, ServerError> {
    let message_id = state
        .db
        .run(|conn| {
            add_message_to_db(
                conn,
                NewMessageArgs::new(DEMO_CONVERSATION_ID, LLM_CHAT, DEMO_QUERY),
            )
        })
        .await?;

    info!(%message_id, "demo message stored");
    Ok(Json(BaseResponse::success(MessageIdData { message_id })))
}
