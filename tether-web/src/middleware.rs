//! Session context loader
//!
//! Runs once per request: reads the session cookie, resolves it through the
//! store, checks the fingerprint, slides the idle window and leaves an
//! immutable [`RequestSession`] in the request extensions for handlers.

use crate::{AppState, WebError};
use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::CookieJar;
use futures::FutureExt;
use std::net::{IpAddr, SocketAddr};
use tether_core::retry_async;
use tether_session::{RequestAttributes, SessionContext, SessionError};
use tracing::{debug, warn};

/// Session state resolved for the current request
#[derive(Debug, Clone, PartialEq)]
pub enum RequestSession {
    Authenticated(SessionContext),
    Anonymous,
}

impl RequestSession {
    pub fn context(&self) -> Option<&SessionContext> {
        match self {
            Self::Authenticated(ctx) => Some(ctx),
            Self::Anonymous => None,
        }
    }
}

const STATIC_PREFIXES: &[&str] = &["/static/", "/assets/"];
const STATIC_EXTENSIONS: &[&str] = &[
    ".css", ".js", ".map", ".png", ".jpg", ".jpeg", ".gif", ".svg", ".ico", ".webp", ".woff",
    ".woff2", ".ttf",
];

/// Requests that never need a session and must not hit the store
pub fn is_static_path(path: &str) -> bool {
    path == "/favicon.ico"
        || STATIC_PREFIXES.iter().any(|prefix| path.starts_with(prefix))
        || STATIC_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

/// Client address: first `X-Forwarded-For` entry, then `X-Real-IP`, then the peer
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<IpAddr> {
    if let Some(forwarded) = headers.get("X-Forwarded-For") {
        if let Ok(forwarded_str) = forwarded.to_str() {
            if let Some(first_ip) = forwarded_str.split(',').next() {
                if let Ok(ip) = first_ip.trim().parse() {
                    return Some(ip);
                }
            }
        }
    }

    if let Some(real_ip) = headers.get("X-Real-IP") {
        if let Ok(ip_str) = real_ip.to_str() {
            if let Ok(ip) = ip_str.trim().parse() {
                return Some(ip);
            }
        }
    }

    peer.map(|addr| addr.ip())
}

pub fn request_attributes(request: &Request) -> RequestAttributes {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    RequestAttributes::new(
        request
            .headers()
            .get(axum::http::header::USER_AGENT)
            .and_then(|ua| ua.to_str().ok())
            .map(str::to_string),
        client_ip(request.headers(), peer),
    )
}

/// Session context middleware
pub async fn session_context(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let attrs = request_attributes(&request);
    request.extensions_mut().insert(attrs.clone());

    if is_static_path(request.uri().path()) {
        request.extensions_mut().insert(RequestSession::Anonymous);
        return next.run(request).await;
    }

    let Some(session_id) = state.cookies.extract_from_headers(request.headers()) else {
        request.extensions_mut().insert(RequestSession::Anonymous);
        return next.run(request).await;
    };

    let loaded = retry_async(
        || {
            let store = state.store.clone();
            let session_id = session_id.clone();
            async move { store.get(&session_id).await }.boxed()
        },
        &state.retry,
        "session_get",
    )
    .await;

    let ctx = match loaded {
        Ok(ctx) => ctx,
        Err(e) if e.requires_reauthentication() => {
            debug!(session = %session_id.tag(), "Stale session cookie, continuing anonymously");
            return anonymous_with_cleared_cookie(&state, request, next).await;
        }
        // The store could not answer; the cookie stays
        Err(e) => return WebError::Session(e).into_response(),
    };

    match state.fingerprints.verify(&state.store, &ctx, &attrs).await {
        Ok(_) => {}
        Err(e) if e.requires_reauthentication() => {
            return anonymous_with_cleared_cookie(&state, request, next).await;
        }
        Err(e) => return WebError::Session(e).into_response(),
    }

    let ctx = match state.store.touch(&ctx.session_id).await {
        Ok(fresh) => fresh,
        Err(SessionError::NotFound) => {
            return anonymous_with_cleared_cookie(&state, request, next).await;
        }
        Err(e) => {
            warn!(session = %ctx.session_id.tag(), error = %e, "Session touch failed");
            ctx
        }
    };

    request
        .extensions_mut()
        .insert(RequestSession::Authenticated(ctx));
    next.run(request).await
}

async fn anonymous_with_cleared_cookie(state: &AppState, mut request: Request, next: Next) -> Response {
    request.extensions_mut().insert(RequestSession::Anonymous);
    let response = next.run(request).await;

    // A handler that issued a fresh session cookie (login) takes precedence
    if state.cookies.is_set_in(response.headers()) {
        return response;
    }

    (state.cookies.clear(CookieJar::new()), response).into_response()
}
