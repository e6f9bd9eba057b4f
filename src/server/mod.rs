//! # Relay backend
//!
//! An axum application exposing the chat endpoint, the demo write endpoint and the
//! feedback endpoint, with Swagger UI at `/docs`.
//!
//! [`serve`] binds the configured address and runs until CTRL+C or SIGTERM. Open
//! streams are allowed to finish before the process exits.

pub mod error;
pub mod routes;
pub mod state;

use std::error::Error;

use tracing::{info, warn};

use crate::config::RelayConfig;
pub use routes::build;
pub use state::AppState;

/// Run the backend until a shutdown signal arrives.
pub async fn serve(config: RelayConfig) -> Result<(), Box<dyn Error>> {
    let addr = config.bind_address.clone();
    let state = AppState::from_config(config)?;
    info!(
        database_url = %state.db.url(),
        templates = %state.templates_path.display(),
        "relay state ready"
    );

    let app = build(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("llm-relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; starting graceful shutdown");
}
