//! HTTP handlers for the session endpoints

use crate::{
    auth::{CurrentSession, OptionalSession},
    AppState, WebError, WebResult,
};
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
    Extension,
};
use axum_extra::extract::cookie::CookieJar;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tether_session::sync::SessionSnapshot;
use tether_session::{PlatformId, RequestAttributes, SessionContext, SyncState};
use tracing::info;

/// Header carrying the integrity token on state-changing requests
pub const CSRF_HEADER: &str = "X-CSRF-Token";

/// Body of `GET /api/session/state`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStateResponse {
    pub authenticated: bool,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csrf_token: Option<String>,
    /// How often tabs should poll this endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_secs: Option<u64>,
}

impl SessionStateResponse {
    pub fn anonymous() -> Self {
        Self {
            authenticated: false,
            session: None,
            csrf_token: None,
            heartbeat_interval_secs: None,
        }
    }

    pub fn heartbeat_interval(&self) -> Option<std::time::Duration> {
        self.heartbeat_interval_secs.map(std::time::Duration::from_secs)
    }

    fn for_context(state: &AppState, ctx: &SessionContext) -> Self {
        Self {
            authenticated: true,
            session: Some(SessionSnapshot::from_context(ctx, state.store.now())),
            csrf_token: Some(state.integrity.issue(&ctx.session_id)),
            heartbeat_interval_secs: Some(state.config.tether.sync.heartbeat_interval_secs),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub platform_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct SwitchRequest {
    pub platform_id: i64,
    #[serde(default)]
    pub csrf_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SwitchResponse {
    pub session: SessionStateResponse,
    pub sync: SyncState,
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> WebResult<Json<Value>> {
    state.store.health_check().await?;

    Ok(Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now(),
        "version": env!("CARGO_PKG_VERSION"),
    })))
}

/// Session state endpoint
///
/// Always 200: anonymous callers get `{"authenticated": false}`.
pub async fn session_state(
    State(state): State<AppState>,
    OptionalSession(session): OptionalSession,
) -> Json<SessionStateResponse> {
    Json(match session {
        Some(ctx) => SessionStateResponse::for_context(&state, &ctx),
        None => SessionStateResponse::anonymous(),
    })
}

/// Login endpoint
///
/// A previous session cookie is rotated out rather than reused.
pub async fn login(
    State(state): State<AppState>,
    Extension(attrs): Extension<RequestAttributes>,
    jar: CookieJar,
    Json(request): Json<LoginRequest>,
) -> WebResult<impl IntoResponse> {
    let user_id = state
        .identity
        .authenticate(&request.username, &request.password)
        .await
        .ok_or_else(|| WebError::Unauthorized("invalid credentials".to_string()))?;

    let previous = state.cookies.extract(&jar);
    let session_id = state
        .store
        .migrate(
            previous.as_ref(),
            user_id,
            request.platform_id.map(PlatformId),
            state.fingerprints.compute(&attrs),
        )
        .await?;
    let ctx = state.store.get(&session_id).await?;

    info!(user_id = %user_id, session = %session_id.tag(), "User logged in");

    let jar = state.cookies.attach(jar, &session_id);
    Ok((jar, Json(SessionStateResponse::for_context(&state, &ctx))))
}

/// Logout endpoint
pub async fn logout(
    State(state): State<AppState>,
    OptionalSession(session): OptionalSession,
    jar: CookieJar,
) -> WebResult<impl IntoResponse> {
    if let Some(ctx) = session {
        state.store.invalidate(&ctx.session_id).await?;
        info!(user_id = %ctx.user_id, session = %ctx.session_id.tag(), "User logged out");
    }

    Ok((state.cookies.clear(jar), StatusCode::NO_CONTENT))
}

/// Platform switch endpoint
///
/// The integrity token is checked against the session id the loader resolved
/// for this request.
pub async fn switch_platform(
    State(state): State<AppState>,
    CurrentSession(ctx): CurrentSession,
    headers: HeaderMap,
    Json(request): Json<SwitchRequest>,
) -> WebResult<Json<SwitchResponse>> {
    let token = headers
        .get(CSRF_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or(request.csrf_token)
        .ok_or_else(|| WebError::Forbidden("missing integrity token".to_string()))?;

    if !state.integrity.verify(&ctx.session_id, &token) {
        return Err(WebError::Forbidden("integrity token rejected".to_string()));
    }

    let updated = state
        .switcher
        .switch(&ctx.session_id, PlatformId(request.platform_id), ctx.user_id)
        .await?;

    let response = SessionStateResponse::for_context(&state, &updated);
    let sync = SyncState::from_context(&updated, state.store.now());

    Ok(Json(SwitchResponse {
        session: response,
        sync,
    }))
}

/// Fallback for unknown routes
pub async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "not_found", "message": "Resource not found" })),
    )
}
