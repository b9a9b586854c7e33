//! HTTP state probe used by tab heartbeats

use crate::handlers::SessionStateResponse;
use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use std::time::Duration;
use tether_session::sync::{ProbeError, ProbeOutcome, StateProbe};
use tracing::debug;

/// Path of the state-query endpoint relative to the server root
pub const STATE_PATH: &str = "/api/session/state";

/// Polls `GET /api/session/state` with the tab's session cookie
#[derive(Debug, Clone)]
pub struct HttpStateProbe {
    client: Client,
    url: String,
    cookie: Option<String>,
}

impl HttpStateProbe {
    /// `base_url` is the server root, e.g. `http://127.0.0.1:8080`
    pub fn new(base_url: &str) -> Result<Self, ProbeError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ProbeError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            url: format!("{}{}", base_url.trim_end_matches('/'), STATE_PATH),
            cookie: None,
        })
    }

    /// Send `name=value` as the session cookie
    pub fn with_session_cookie(mut self, name: &str, value: &str) -> Self {
        self.cookie = Some(format!("{}={}", name, value));
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl StateProbe for HttpStateProbe {
    async fn probe(&self) -> Result<ProbeOutcome, ProbeError> {
        let mut request = self.client.get(&self.url);
        if let Some(cookie) = &self.cookie {
            request = request.header(header::COOKIE, cookie);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProbeError::Transport(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Ok(ProbeOutcome::Unauthenticated);
        }
        if !status.is_success() {
            debug!(status = status.as_u16(), "State probe got non-success status");
            return Err(ProbeError::Status(status.as_u16()));
        }

        let body: SessionStateResponse = response
            .json()
            .await
            .map_err(|e| ProbeError::Decode(e.to_string()))?;

        match (body.authenticated, body.session) {
            (true, Some(snapshot)) => Ok(ProbeOutcome::Authenticated(snapshot)),
            (true, None) => Err(ProbeError::Decode(
                "authenticated response without session fields".to_string(),
            )),
            (false, _) => Ok(ProbeOutcome::Unauthenticated),
        }
    }
}
