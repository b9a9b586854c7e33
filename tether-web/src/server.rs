//! Tether Web Server
//!
//! Main web server implementation using Axum.

use crate::{create_app, AppState, WebConfig, WebError, WebResult};
use axum::serve;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// Main Tether server
pub struct TetherServer {
    config: WebConfig,
    state: AppState,
}

impl TetherServer {
    /// Create a new Tether server
    pub async fn new(config: WebConfig) -> WebResult<Self> {
        let state = AppState::new(config.clone()).await?;

        Ok(Self { config, state })
    }

    /// Create a server around an existing state
    pub fn with_state(config: WebConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// Start the web server and run until Ctrl+C
    pub async fn start(self) -> WebResult<()> {
        let address = self.config.address();

        info!("Starting Tether Web Server");
        info!("Development mode: {}", self.config.dev_mode);

        let listener = TcpListener::bind(&address)
            .await
            .map_err(WebError::Server)?;

        info!("Server listening on http://{}", address);

        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on a bound listener until `shutdown` resolves
    ///
    /// The cleanup scheduler runs for the lifetime of the server and is
    /// stopped after in-flight requests drain.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> WebResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cleanup = if self.state.tether().cleanup.enabled {
            Some(self.state.cleanup_scheduler().start())
        } else {
            warn!("Session cleanup disabled; expired rows will only be rejected on read");
            None
        };

        let app = create_app(self.state.clone());

        let result = serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await;

        if let Some(handle) = cleanup {
            handle.shutdown().await;
        }

        if let Err(e) = result {
            error!("Server error: {}", e);
            return Err(WebError::Server(e));
        }

        info!("Server shut down gracefully");
        Ok(())
    }

    /// Get server configuration
    pub fn config(&self) -> &WebConfig {
        &self.config
    }

    /// Get application state
    pub fn state(&self) -> &AppState {
        &self.state
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Builder for TetherServer
pub struct TetherServerBuilder {
    config: WebConfig,
}

impl TetherServerBuilder {
    /// Create a new server builder
    pub fn new() -> Self {
        Self {
            config: WebConfig::default(),
        }
    }

    /// Start from an existing configuration
    pub fn from_config(config: WebConfig) -> Self {
        Self { config }
    }

    /// Set the server host
    pub fn host<S: Into<String>>(mut self, host: S) -> Self {
        self.config.host = host.into();
        self
    }

    /// Set the server port
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Enable development mode
    pub fn dev_mode(mut self, dev_mode: bool) -> Self {
        self.config.dev_mode = dev_mode;
        self
    }

    /// Set database URL
    pub fn database_url<S: Into<String>>(mut self, database_url: S) -> Self {
        self.config.database_url = Some(database_url.into());
        self
    }

    /// Build the server
    pub async fn build(self) -> WebResult<TetherServer> {
        TetherServer::new(self.config).await
    }
}

impl Default for TetherServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_server_creation_in_dev_mode() {
        let config = WebConfig {
            dev_mode: true,
            ..WebConfig::default()
        };
        let server = TetherServer::new(config).await;
        assert!(server.is_ok());
    }

    #[test]
    fn test_server_builder() {
        let builder = TetherServerBuilder::new()
            .host("localhost")
            .port(3000)
            .dev_mode(true);

        assert_eq!(builder.config.host, "localhost");
        assert_eq!(builder.config.port, 3000);
        assert!(builder.config.dev_mode);
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown_signal() {
        let config = WebConfig {
            dev_mode: true,
            ..WebConfig::default()
        };
        let server = TetherServer::new(config).await.unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let result = server.serve(listener, async {}).await;
        assert!(result.is_ok());
    }
}
