//! Session data model

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use rand::{rngs::OsRng, RngCore};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::OnceLock;

static SESSION_ID_REGEX: OnceLock<Option<Regex>> = OnceLock::new();

/// Opaque session identifier, 256 bits from the OS RNG
///
/// This value is a bearer credential. `Debug` is redacted and there is no
/// `Display`; log the [`SessionTag`] instead.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Encoded length of 32 bytes in unpadded URL-safe base64
    pub const ENCODED_LEN: usize = 43;

    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Accept a client-supplied value only if it has the exact shape we issue
    pub fn parse(raw: &str) -> Option<Self> {
        let regex = SESSION_ID_REGEX
            .get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{43}$").ok())
            .as_ref()?;
        regex.is_match(raw).then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Non-secret digest safe to show to scripts and write to logs
    pub fn tag(&self) -> SessionTag {
        let digest = Sha256::digest(self.0.as_bytes());
        let hex: String = digest[..8].iter().map(|b| format!("{:02x}", b)).collect();
        SessionTag(hex)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.tag())
    }
}

/// Short public digest of a [`SessionId`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionTag(String);

impl SessionTag {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionTag {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlatformId(pub i64);

impl fmt::Display for PlatformId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hex encoded keyed hash of coarse request attributes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FingerprintHash(pub String);

impl FingerprintHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Observable state of a session row at a given instant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    IdleExpired,
    AbsoluteExpired,
    Invalidated,
}

/// Why a session was explicitly invalidated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationReason {
    Logout,
    Rotated,
    FingerprintMismatch,
    Administrative,
}

impl InvalidationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Logout => "logout",
            Self::Rotated => "rotated",
            Self::FingerprintMismatch => "fingerprint_mismatch",
            Self::Administrative => "administrative",
        }
    }
}

/// Persistent session row
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub active_platform_id: Option<PlatformId>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub idle_deadline: DateTime<Utc>,
    pub fingerprint_hash: Option<FingerprintHash>,
    pub is_active: bool,
    pub version: u64,
}

impl SessionRecord {
    /// Build a fresh row at version 1
    pub fn new(
        user_id: UserId,
        active_platform_id: Option<PlatformId>,
        fingerprint_hash: Option<FingerprintHash>,
        now: DateTime<Utc>,
        idle_timeout: Duration,
        absolute_timeout: Duration,
    ) -> Self {
        Self {
            session_id: SessionId::generate(),
            user_id,
            active_platform_id,
            created_at: now,
            last_activity_at: now,
            expires_at: now + absolute_timeout,
            idle_deadline: now + idle_timeout,
            fingerprint_hash,
            is_active: true,
            version: 1,
        }
    }

    pub fn state_at(&self, now: DateTime<Utc>) -> SessionState {
        if !self.is_active {
            SessionState::Invalidated
        } else if now >= self.expires_at {
            SessionState::AbsoluteExpired
        } else if now >= self.idle_deadline {
            SessionState::IdleExpired
        } else {
            SessionState::Active
        }
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.state_at(now) == SessionState::Active
    }

    /// Copy of this row as the next version, ready for a compare-and-swap
    pub fn next_version(&self) -> Self {
        let mut next = self.clone();
        next.version = self.version + 1;
        next
    }

    pub fn to_context(&self) -> SessionContext {
        SessionContext {
            session_id: self.session_id.clone(),
            user_id: self.user_id,
            platform_id: self.active_platform_id,
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
            expires_at: self.expires_at,
            version: self.version,
            fingerprint: self.fingerprint_hash.clone(),
        }
    }
}

/// Immutable view of a valid session, built once per request
#[derive(Debug, Clone, PartialEq)]
pub struct SessionContext {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub platform_id: Option<PlatformId>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub version: u64,
    pub fingerprint: Option<FingerprintHash>,
}
