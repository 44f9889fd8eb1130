pub mod health;
pub mod messages;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

/// Build the proxy's router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/messages", post(messages::handle_messages))
        .route(
            "/v1/messages/count_tokens",
            post(messages::handle_count_tokens),
        )
        .route("/health", get(health::health_handler))
        .with_state(state)
}
