//! HTTP front door: device protocol endpoints and the operator API.

mod device;
mod error;
mod operator;
mod state;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use tower_http::trace::TraceLayer;

pub use error::ApiError;
pub use operator::Operator;
pub use state::AppState;

/// Build the full application router.
pub fn router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(device::router())
        .nest("/api", operator::router())
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
