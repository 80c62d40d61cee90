use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    routing::{get, post},
    Json, Router,
};
use tokio::net::TcpListener;

use super::batcher::BatchQueue;
use super::input::{self, ServiceError};
use crate::model::Label;

/// Largest accepted request, a generous multiple of one 1024x128 F32 input
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Builds the service routes on top of a running batch worker
pub fn router(queue: BatchQueue) -> Router {
    Router::new()
        .route("/", post(label))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(queue)
}

/// Serves `router` on `listener` until Ctrl-C
///
/// # Errors
/// Returns error if the server fails
pub async fn serve_on(listener: TcpListener, router: Router) -> std::io::Result<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutting down"),
        Err(e) => {
            tracing::warn!(error = %e, "failed to listen for Ctrl-C, serving until killed");
            std::future::pending::<()>().await;
        }
    }
}

async fn label(State(queue): State<BatchQueue>, body: Bytes) -> Result<Json<Label>, ServiceError> {
    let size = body.len();
    let input = tokio::task::spawn_blocking(move || input::prepare(&body))
        .await
        .map_err(|e| ServiceError::Inference(format!("input preparation failed: {e}")))??;

    let label = queue.submit(input).await?;
    tracing::debug!(size, %label, "request labelled");

    Ok(Json(label))
}

async fn health() -> &'static str {
    "ok"
}
