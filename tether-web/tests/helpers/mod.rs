//! Shared harness for the HTTP tests
#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, HeaderMap, Method, Request, StatusCode},
    Router,
};
use chrono::{DateTime, Utc};
use http_body_util::BodyExt;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tether_core::{storage_error, FingerprintPolicy, RetryConfig, TetherResult};
use tether_session::{
    AuditLog, MemoryAuditSink, MemoryPlatformDirectory, MemorySessionBackend, ServerSecret,
    SessionBackend, SessionId, SessionRecord, SessionStore, StoreSettings, UserId,
};
use tether_web::{create_app, AppState, StaticIdentityProvider, WebConfig};
use tower::ServiceExt;

/// Platforms 7 and 9 belong to alice (42); platform 55 belongs to bob (99)
pub const PLATFORMS: &[(i64, i64)] = &[(7, 42), (9, 42), (55, 99)];

pub const CHROME_WINDOWS: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0 Safari/537.36";
pub const FIREFOX_LINUX: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0";

/// Memory backend that can be switched off to simulate an unreachable store
#[derive(Default)]
pub struct SwitchableBackend {
    inner: MemorySessionBackend,
    down: AtomicBool,
}

impl SwitchableBackend {
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn gate(&self) -> TetherResult<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(storage_error!("connection refused", "switchable_backend"));
        }
        Ok(())
    }
}

#[async_trait]
impl SessionBackend for SwitchableBackend {
    async fn insert(&self, record: &SessionRecord) -> TetherResult<()> {
        self.gate()?;
        self.inner.insert(record).await
    }

    async fn load(&self, session_id: &SessionId) -> TetherResult<Option<SessionRecord>> {
        self.gate()?;
        self.inner.load(session_id).await
    }

    async fn compare_and_swap(&self, expected: u64, record: &SessionRecord) -> TetherResult<bool> {
        self.gate()?;
        self.inner.compare_and_swap(expected, record).await
    }

    async fn delete_invalid(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> TetherResult<Vec<SessionRecord>> {
        self.gate()?;
        self.inner.delete_invalid(now, limit).await
    }

    async fn health_check(&self) -> TetherResult<()> {
        self.gate()
    }
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

impl TestResponse {
    /// Value of the session cookie in `Set-Cookie`, if the response sets it
    pub fn session_cookie(&self, name: &str) -> Option<String> {
        let prefix = format!("{}=", name);
        self.headers
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .find(|value| value.starts_with(&prefix))
            .map(|value| {
                value[prefix.len()..]
                    .split(';')
                    .next()
                    .unwrap_or_default()
                    .to_string()
            })
    }

    pub fn raw_set_cookie(&self) -> Vec<String> {
        self.headers
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .map(str::to_string)
            .collect()
    }
}

pub struct TestApp {
    pub state: AppState,
    pub app: Router,
    pub backend: Arc<SwitchableBackend>,
    pub platforms: Arc<MemoryPlatformDirectory>,
    pub audit: Arc<MemoryAuditSink>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_policy(FingerprintPolicy::Warn)
    }

    pub fn with_policy(policy: FingerprintPolicy) -> Self {
        let mut config = WebConfig::default();
        config.tether.session.fingerprint_policy = policy;

        let backend = Arc::new(SwitchableBackend::default());
        let platforms = Arc::new(MemoryPlatformDirectory::with_platforms(PLATFORMS));
        let audit = Arc::new(MemoryAuditSink::new());

        let store = SessionStore::new(
            backend.clone(),
            platforms.clone(),
            Arc::new(AuditLog::new(audit.clone())),
            StoreSettings::from(&config.tether.session),
        );

        let identity = StaticIdentityProvider::new()
            .with_params(argon2::Params::new(8, 1, 1, None).unwrap())
            .with_user("alice", "secret", UserId(42))
            .with_user("bob", "hunter2", UserId(99));

        let mut state = AppState::from_parts(
            config,
            store,
            &ServerSecret::from_bytes(b"test-secret-test-secret-test-sec"),
            Arc::new(identity),
        );
        state.retry = RetryConfig::none();

        Self {
            app: create_app(state.clone()),
            state,
            backend,
            platforms,
            audit,
        }
    }

    pub fn cookie_name(&self) -> String {
        self.state.cookies.name().to_string()
    }

    pub async fn send(
        &self,
        method: Method,
        uri: &str,
        cookie: Option<&str>,
        extra_headers: &[(&str, &str)],
        body: Option<Value>,
    ) -> TestResponse {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, format!("{}={}", self.cookie_name(), cookie));
        }
        for (name, value) in extra_headers {
            builder = builder.header(*name, *value);
        }

        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };

        TestResponse {
            status,
            headers,
            body,
        }
    }

    /// Log in and return (cookie value, csrf token)
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        platform_id: Option<i64>,
        user_agent: &str,
    ) -> (String, String) {
        let response = self
            .send(
                Method::POST,
                "/api/session",
                None,
                &[("User-Agent", user_agent)],
                Some(serde_json::json!({
                    "username": username,
                    "password": password,
                    "platform_id": platform_id,
                })),
            )
            .await;
        assert_eq!(response.status, StatusCode::OK, "login failed: {}", response.body);

        let cookie = response
            .session_cookie(&self.cookie_name())
            .expect("login must set the session cookie");
        let csrf = response.body["csrf_token"]
            .as_str()
            .expect("login must return an integrity token")
            .to_string();
        (cookie, csrf)
    }

    pub async fn state(&self, cookie: &str, user_agent: &str) -> TestResponse {
        self.send(
            Method::GET,
            "/api/session/state",
            Some(cookie),
            &[("User-Agent", user_agent)],
            None,
        )
        .await
    }
}
