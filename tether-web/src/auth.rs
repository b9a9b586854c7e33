//! Typed access to the session resolved by the context loader

use crate::middleware::RequestSession;
use crate::WebError;
use axum::{extract::FromRequestParts, http::request::Parts};
use tether_session::{SessionContext, SessionError};

/// Extractor for handlers that require an authenticated session
#[derive(Debug, Clone)]
pub struct CurrentSession(pub SessionContext);

impl<S> FromRequestParts<S> for CurrentSession
where
    S: Send + Sync,
{
    type Rejection = WebError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        match parts.extensions.get::<RequestSession>() {
            Some(RequestSession::Authenticated(ctx)) => Ok(CurrentSession(ctx.clone())),
            _ => Err(WebError::Session(SessionError::NotFound)),
        }
    }
}

/// Optional session extractor - doesn't fail for anonymous requests
#[derive(Debug, Clone)]
pub struct OptionalSession(pub Option<SessionContext>);

impl<S> FromRequestParts<S> for OptionalSession
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(OptionalSession(
            parts
                .extensions
                .get::<RequestSession>()
                .and_then(RequestSession::context)
                .cloned(),
        ))
    }
}
