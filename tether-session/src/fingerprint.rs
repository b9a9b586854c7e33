//! Request fingerprinting
//!
//! Only coarse attributes go into the hash: browser family, OS family and the
//! client network prefix. Minor browser upgrades or a new address inside the
//! same /24 (IPv4) or /48 (IPv6) do not change the fingerprint.

use crate::audit::{AuditEvent, AuditEventType};
use crate::model::{FingerprintHash, InvalidationReason, SessionContext};
use crate::secret::{constant_time_eq, hmac_sha256, ServerSecret};
use crate::store::SessionStore;
use crate::{SessionError, SessionResult};
use serde_json::json;
use std::net::IpAddr;
use tether_core::FingerprintPolicy;
use tracing::warn;

/// Raw request attributes; never persisted
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestAttributes {
    pub user_agent: Option<String>,
    pub client_ip: Option<IpAddr>,
}

impl RequestAttributes {
    pub fn new(user_agent: Option<String>, client_ip: Option<IpAddr>) -> Self {
        Self {
            user_agent,
            client_ip,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.user_agent.is_none() && self.client_ip.is_none()
    }
}

/// The reduced attribute set that is actually hashed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoarseAttributes {
    pub browser: &'static str,
    pub os: &'static str,
    pub network: String,
}

impl CoarseAttributes {
    pub fn from_request(attrs: &RequestAttributes) -> Self {
        let ua = attrs
            .user_agent
            .as_deref()
            .unwrap_or_default()
            .to_ascii_lowercase();

        Self {
            browser: browser_family(&ua),
            os: os_family(&ua),
            network: attrs
                .client_ip
                .map(network_prefix)
                .unwrap_or_else(|| "unknown".to_string()),
        }
    }
}

fn browser_family(ua: &str) -> &'static str {
    // Order matters: Edge and Opera also advertise Chrome, Chrome advertises Safari
    if ua.contains("edg/") || ua.contains("edge/") {
        "edge"
    } else if ua.contains("opr/") || ua.contains("opera") {
        "opera"
    } else if ua.contains("firefox/") || ua.contains("fxios") {
        "firefox"
    } else if ua.contains("chrome/") || ua.contains("crios") || ua.contains("chromium") {
        "chrome"
    } else if ua.contains("safari") {
        "safari"
    } else {
        "other"
    }
}

fn os_family(ua: &str) -> &'static str {
    // iOS user agents contain "like Mac OS X", Android ones contain "Linux"
    if ua.contains("windows") {
        "windows"
    } else if ua.contains("iphone") || ua.contains("ipad") || ua.contains("ipod") {
        "ios"
    } else if ua.contains("android") {
        "android"
    } else if ua.contains("mac os") || ua.contains("macintosh") {
        "macos"
    } else if ua.contains("linux") || ua.contains("x11") {
        "linux"
    } else {
        "other"
    }
}

fn network_prefix(ip: IpAddr) -> String {
    let ip = match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    };

    match ip {
        IpAddr::V4(v4) => {
            let [a, b, c, _] = v4.octets();
            format!("{}.{}.{}.0/24", a, b, c)
        }
        IpAddr::V6(v6) => {
            let s = v6.segments();
            format!("{:x}:{:x}:{:x}::/48", s[0], s[1], s[2])
        }
    }
}

/// Outcome of checking a request against the stored fingerprint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintVerdict {
    Match,
    /// The session was created without a fingerprint
    Unbound,
    /// Mismatch tolerated under the warn policy
    Suspicious,
}

/// Computes and checks session fingerprints
#[derive(Clone)]
pub struct FingerprintValidator {
    key: [u8; 32],
    policy: FingerprintPolicy,
}

impl FingerprintValidator {
    pub fn new(secret: &ServerSecret, policy: FingerprintPolicy) -> Self {
        Self {
            key: secret.derive("fingerprint"),
            policy,
        }
    }

    pub fn policy(&self) -> FingerprintPolicy {
        self.policy
    }

    /// Hash the coarse attributes of a request, or `None` when the request
    /// carried nothing to fingerprint
    pub fn compute(&self, attrs: &RequestAttributes) -> Option<FingerprintHash> {
        if attrs.is_empty() {
            return None;
        }

        let coarse = CoarseAttributes::from_request(attrs);
        let digest = hmac_sha256(
            &self.key,
            &[
                coarse.browser.as_bytes(),
                b"|".as_slice(),
                coarse.os.as_bytes(),
                b"|".as_slice(),
                coarse.network.as_bytes(),
            ],
        );

        Some(FingerprintHash(
            digest.iter().map(|b| format!("{:02x}", b)).collect(),
        ))
    }

    /// Check a resolved session against the current request
    ///
    /// Under `Block` a mismatch invalidates the session and yields
    /// `Unauthorized`; under `Warn` it is recorded and the session survives.
    pub async fn verify(
        &self,
        store: &SessionStore,
        ctx: &SessionContext,
        attrs: &RequestAttributes,
    ) -> SessionResult<FingerprintVerdict> {
        let Some(stored) = ctx.fingerprint.as_ref() else {
            return Ok(FingerprintVerdict::Unbound);
        };

        let matches = self
            .compute(attrs)
            .map(|current| constant_time_eq(current.as_str().as_bytes(), stored.as_str().as_bytes()))
            .unwrap_or(false);

        if matches {
            return Ok(FingerprintVerdict::Match);
        }

        let policy = match self.policy {
            FingerprintPolicy::Warn => "warn",
            FingerprintPolicy::Block => "block",
        };

        warn!(
            session = %ctx.session_id.tag(),
            user_id = %ctx.user_id,
            policy,
            "Session fingerprint mismatch"
        );

        store
            .audit()
            .append(AuditEvent::new(
                AuditEventType::FingerprintMismatch,
                &ctx.session_id,
                ctx.user_id,
                store.now(),
                json!({ "policy": policy }),
            ))
            .await;

        match self.policy {
            FingerprintPolicy::Warn => Ok(FingerprintVerdict::Suspicious),
            FingerprintPolicy::Block => {
                store
                    .invalidate_with_reason(&ctx.session_id, InvalidationReason::FingerprintMismatch)
                    .await?;
                Err(SessionError::unauthorized("session fingerprint mismatch"))
            }
        }
    }
}

impl std::fmt::Debug for FingerprintValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FingerprintValidator")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
