//! Session cookie transport
//!
//! The cookie value is the [`SessionId`] itself and nothing else. Values that
//! do not look like a session id are treated as absent before the store is
//! ever consulted.

use axum::http::{header::SET_COOKIE, HeaderMap};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use tether_core::{CookieSettings, SameSitePolicy};
use tether_session::SessionId;

#[derive(Debug, Clone)]
pub struct SessionCookieManager {
    settings: CookieSettings,
}

impl SessionCookieManager {
    /// `max_age_secs` is capped at the absolute session lifetime
    pub fn new(mut settings: CookieSettings, absolute_timeout_secs: u64) -> Self {
        settings.max_age_secs = settings.max_age_secs.min(absolute_timeout_secs);
        Self { settings }
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn extract(&self, jar: &CookieJar) -> Option<SessionId> {
        jar.get(&self.settings.name)
            .and_then(|cookie| SessionId::parse(cookie.value()))
    }

    pub fn extract_from_headers(&self, headers: &HeaderMap) -> Option<SessionId> {
        self.extract(&CookieJar::from_headers(headers))
    }

    pub fn attach(&self, jar: CookieJar, session_id: &SessionId) -> CookieJar {
        jar.add(self.build(session_id.as_str(), self.settings.max_age_secs))
    }

    pub fn clear(&self, jar: CookieJar) -> CookieJar {
        jar.add(self.build("", 0))
    }

    /// Whether a response already carries a `Set-Cookie` for the session cookie
    pub fn is_set_in(&self, headers: &HeaderMap) -> bool {
        let prefix = format!("{}=", self.settings.name);
        headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .any(|value| value.starts_with(&prefix))
    }

    fn build(&self, value: &str, max_age_secs: u64) -> Cookie<'static> {
        let mut cookie = Cookie::new(self.settings.name.clone(), value.to_string());
        cookie.set_max_age(time::Duration::seconds(
            i64::try_from(max_age_secs).unwrap_or(i64::MAX),
        ));
        cookie.set_http_only(true);
        cookie.set_secure(self.settings.secure);
        cookie.set_path(self.settings.path.clone());
        cookie.set_same_site(match self.settings.same_site {
            SameSitePolicy::Strict => SameSite::Strict,
            SameSitePolicy::Lax => SameSite::Lax,
        });
        cookie
    }
}
