//! Builds the axum `Router` wiring every recognized vendor path prefix to
//! the single shared handler; [`crate::handler::proxy_handler`] itself
//! dispatches on the path to determine the vendor dialect.

use crate::handler::proxy_handler;
use crate::state::AppState;
use axum::routing::any;
use axum::Router;
use std::sync::Arc;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/messages", any(proxy_handler))
        .route("/v1/messages/{*rest}", any(proxy_handler))
        .route("/v1/chat/completions", any(proxy_handler))
        .route("/v1/responses", any(proxy_handler))
        .route("/v1/models", any(proxy_handler))
        .route("/v1/models/{*rest}", any(proxy_handler))
        .route("/v1/embeddings", any(proxy_handler))
        .route("/v1/images/{*rest}", any(proxy_handler))
        .route("/v1beta/models/{*rest}", any(proxy_handler))
        .with_state(state)
}
