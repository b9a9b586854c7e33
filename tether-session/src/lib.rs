//! Tether Session - the session management core
//!
//! This crate owns everything that decides whether a request carries a valid
//! session and which platform that session is operating against:
//!
//! - [`SessionStore`]: versioned, compare-and-swap persistence over a
//!   pluggable [`SessionBackend`] (in-memory or SQLite)
//! - [`FingerprintValidator`]: coarse request fingerprinting with warn/block policies
//! - [`PlatformContextSwitcher`]: validated, audited platform switching
//! - [`AuditLog`]: best-effort append-only event log with subscriptions
//! - [`CleanupScheduler`]: bounded background reaping of invalid rows
//! - [`sync`]: the cross-tab convergence protocol
//! - [`IntegrityTokens`]: request-integrity tokens bound to a [`SessionId`]
//!
//! ## Architecture
//!
//! The web layer (tether-web) only extracts tokens and maps errors to HTTP;
//! every rule about validity, ownership and versioning lives here.

pub mod audit;
pub mod cleanup;
pub mod clock;
pub mod fingerprint;
pub mod integrity;
pub mod model;
pub mod platform;
pub mod secret;
pub mod store;
pub mod switcher;
pub mod sync;

pub use audit::{AuditEvent, AuditEventType, AuditLog, AuditSink, MemoryAuditSink};
pub use cleanup::{CleanupHandle, CleanupReport, CleanupScheduler};
pub use clock::{Clock, ManualClock, SystemClock};
pub use fingerprint::{FingerprintValidator, FingerprintVerdict, RequestAttributes};
pub use integrity::IntegrityTokens;
pub use model::{
    FingerprintHash, InvalidationReason, PlatformId, SessionContext, SessionId, SessionRecord,
    SessionState, SessionTag, UserId,
};
pub use platform::{MemoryPlatformDirectory, PlatformBinding, PlatformConnection, PlatformDirectory};
pub use secret::ServerSecret;
pub use store::{MemorySessionBackend, SessionBackend, SessionStore, StoreSettings};
pub use switcher::PlatformContextSwitcher;
pub use sync::{SyncHub, SyncNotice, SyncState};

#[cfg(feature = "sqlite")]
pub use audit::SqliteAuditSink;
#[cfg(feature = "sqlite")]
pub use platform::SqlitePlatformDirectory;
#[cfg(feature = "sqlite")]
pub use store::sqlite::{open_pool, SqliteSessionBackend};

use tether_core::{Retryable, TetherError};

/// Session-level error taxonomy
///
/// `NotFound` and `Unauthorized` mean "re-authenticate". `TransientStore`
/// means the backing store could not answer and must never be treated as a
/// missing session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session not found")]
    NotFound,

    #[error("Unauthorized: {reason}")]
    Unauthorized { reason: String },

    #[error("Forbidden: {message}")]
    Forbidden { message: String },

    #[error("Conflict: {message}")]
    Conflict { message: String },

    #[error("Transient store error: {0}")]
    TransientStore(#[source] TetherError),

    #[error("Validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },
}

pub type SessionResult<T> = Result<T, SessionError>;

impl SessionError {
    pub fn unauthorized<S: Into<String>>(reason: S) -> Self {
        Self::Unauthorized {
            reason: reason.into(),
        }
    }

    pub fn forbidden<S: Into<String>>(message: S) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    pub fn conflict<S: Into<String>>(message: S) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Whether the caller should restart the login flow
    pub fn requires_reauthentication(&self) -> bool {
        matches!(self, Self::NotFound | Self::Unauthorized { .. })
    }
}

impl From<TetherError> for SessionError {
    fn from(error: TetherError) -> Self {
        match error {
            TetherError::Validation { message, field, .. } => Self::Validation { message, field },
            other => Self::TransientStore(other),
        }
    }
}

impl Retryable for SessionError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientStore(_))
    }
}
