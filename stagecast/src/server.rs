//! HTTP server assembly

use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use stagecast_core::Config;
use stagecast_signaling::{ws_handler, SignalingState};

/// Build the application router: the signaling endpoint plus liveness.
pub fn build_router(state: SignalingState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// Serve until ctrl-c.
pub async fn serve(config: &Config, state: SignalingState) -> anyhow::Result<()> {
    let address = config.listen_address();
    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!(address = %address, "signaling server listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("signaling server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}

/// Convenience used by `main` and tests to assemble the shared state.
#[must_use]
pub fn signaling_state(
    config: &Config,
    services: Arc<stagecast_signaling::GatewayServices>,
) -> SignalingState {
    SignalingState {
        services,
        max_message_bytes: config.server.max_message_bytes,
    }
}
