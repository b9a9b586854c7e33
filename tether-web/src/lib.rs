//! Tether Web Server
//!
//! HTTP surface for the session core: the session cookie, the per-request
//! session context loader, and the login / logout / state / platform-switch
//! endpoints.

pub mod auth;
pub mod cookie;
pub mod handlers;
pub mod identity;
pub mod middleware;
pub mod routes;
pub mod server;
pub mod state;
pub mod sync_client;

// Re-export main types
pub use auth::{CurrentSession, OptionalSession};
pub use cookie::SessionCookieManager;
pub use identity::{IdentityProvider, StaticIdentityProvider};
pub use middleware::RequestSession;
pub use server::TetherServer;
pub use state::AppState;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json, Router,
};
use serde_json::json;
use tether_core::{LogFormat, LoggingConfig, TetherConfig, TetherError};
use tether_session::SessionError;
use tower_http::trace::TraceLayer;
use tracing::error;

/// Create the main application router
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .nest("/api", routes::api_routes())
        .fallback(handlers::not_found)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::session_context,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Configuration for the web server
#[derive(Debug, Clone)]
pub struct WebConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Enable development mode
    pub dev_mode: bool,
    /// Database URL (optional, overrides `storage.database_url`)
    pub database_url: Option<String>,
    /// Session core settings
    pub tether: TetherConfig,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            dev_mode: false,
            database_url: None,
            tether: TetherConfig::default(),
        }
    }
}

impl WebConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("TETHER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: std::env::var("TETHER_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .unwrap_or(8080),
            dev_mode: std::env::var("TETHER_DEV_MODE")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .unwrap_or(false),
            database_url: std::env::var("DATABASE_URL").ok(),
            tether: TetherConfig::default().apply_env(),
        }
    }

    /// Get the server address
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The database URL in effect, if any
    pub fn effective_database_url(&self) -> Option<&str> {
        self.database_url
            .as_deref()
            .or(self.tether.storage.database_url.as_deref())
    }
}

/// Error types for the web server
#[derive(thiserror::Error, Debug)]
pub enum WebError {
    #[error("Server error: {0}")]
    Server(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Core(#[from] TetherError),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for web operations
pub type WebResult<T> = Result<T, WebError>;

impl WebError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Self::Session(e) => match e {
                SessionError::NotFound => (StatusCode::UNAUTHORIZED, "session_not_found"),
                SessionError::Unauthorized { .. } => (StatusCode::UNAUTHORIZED, "unauthorized"),
                SessionError::Forbidden { .. } => (StatusCode::FORBIDDEN, "forbidden"),
                SessionError::Conflict { .. } => (StatusCode::CONFLICT, "conflict"),
                SessionError::TransientStore(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable")
                }
                SessionError::Validation { .. } => (StatusCode::BAD_REQUEST, "validation_error"),
            },
            Self::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            Self::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden"),
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            Self::Core(e) if e.is_recoverable() => {
                (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable")
            }
            Self::Server(_) | Self::Serialization(_) | Self::Core(_) | Self::Config(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        }
    }
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        let message = if status.is_server_error() {
            error!(error = %self, status = status.as_u16(), "Request failed");
            match status {
                StatusCode::SERVICE_UNAVAILABLE => {
                    "Session store temporarily unavailable, please retry".to_string()
                }
                _ => "Internal server error".to_string(),
            }
        } else {
            self.to_string()
        };

        (status, Json(json!({ "error": code, "message": message }))).into_response()
    }
}

/// Initialize logging for the web server
///
/// `base` comes from the loaded configuration; level and format are the
/// command line overrides.
pub fn init_logging(
    base: LoggingConfig,
    level: &str,
    json_output: bool,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = LoggingConfig {
        level: level.to_string(),
        format: if json_output { LogFormat::Json } else { base.format },
        filter_directives: vec![
            format!("tether_web={}", level),
            format!("tether_session={}", level),
            "tower_http=debug".to_string(),
        ],
        ..base
    };
    tether_core::init_logging(&config)
}
