//! Route definitions for the web server

use crate::{handlers, AppState};
use axum::{
    routing::{get, post},
    Router,
};

/// Create API routes
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route(
            "/session",
            post(handlers::login).delete(handlers::logout),
        )
        .route("/session/state", get(handlers::session_state))
        .route("/session/platform", post(handlers::switch_platform))
}
