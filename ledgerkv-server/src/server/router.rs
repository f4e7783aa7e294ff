use super::handlers::{self, AppState};
use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

/// Create the Axum router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route(
            "/v1/keys/{key}",
            get(handlers::key_get)
                .put(handlers::key_put)
                .delete(handlers::key_delete),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
