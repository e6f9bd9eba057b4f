//! Axum router construction.
//!
//! [`build`] assembles the complete application router:
//! - `GET /` redirecting to the Swagger UI at `/docs`
//! - `POST /chat` and `POST /chat/feedback`
//! - `POST /message`
//! - request tracing and permissive CORS

pub mod chat;
pub mod doc;
pub mod message;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa_swagger_ui::SwaggerUi;

use crate::server::state::AppState;

/// Build the complete [`Router`] for the relay.
pub fn build(state: AppState) -> Router {
    let state = Arc::new(state);

    Router::new()
        .merge(doc::router())
        .merge(chat::router())
        .merge(message::router())
        .merge(SwaggerUi::new("/docs").url("/openapi.json", doc::get_docs()))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
