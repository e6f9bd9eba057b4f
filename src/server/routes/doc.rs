use std::sync::Arc;

use axum::Router;
use axum::response::Redirect;
use axum::routing::get;
use utoipa::OpenApi;

use crate::server::routes::{chat, message};
use crate::server::state::AppState;

#[derive(OpenApi)]
#[openapi(info(
    title = "llm-relay",
    description = "Chat relay between a dashboard and OpenAI compatible providers",
    version = "0.1.0"
))]
pub struct ApiDoc;

pub fn get_docs() -> utoipa::openapi::OpenApi {
    let mut root = ApiDoc::openapi();
    root.merge(chat::ChatApi::openapi());
    root.merge(message::MessageApi::openapi());
    root
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/", get(document))
}

/// Redirect the bare root to the Swagger UI.
pub async fn document() -> Redirect {
    Redirect::temporary("/docs")
}
