pub mod cli;
pub mod config;
pub mod handlers;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{AppState, echo, health_check, join};

pub fn router(state: AppState) -> Router {
    let prefix = state.config().prefix.clone();
    let mut routes = Router::new()
        .route("/health", get(health_check))
        .route(&format!("/{prefix}/echo/:tag"), post(echo));
    if state.config().portal_slots > 0 {
        routes = routes.route(&format!("/{prefix}/join/:slot"), post(join));
    }
    routes
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
