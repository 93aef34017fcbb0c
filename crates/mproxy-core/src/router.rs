use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use crate::handler;
use crate::service::Service;

/// The public API surface: one route per dialect plus model discovery.
pub fn api_router(service: Arc<Service>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(handler::chat_completions))
        .route("/v1/messages", post(handler::messages))
        .route("/v1/responses", post(handler::responses))
        .route("/v1/models", get(handler::list_models))
        .with_state(service)
}
