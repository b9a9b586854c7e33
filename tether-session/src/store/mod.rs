//! Session persistence
//!
//! [`SessionStore`] is the single source of truth for session state. It owns
//! every validity rule and the compare-and-swap discipline on `version`; the
//! [`SessionBackend`] underneath only stores rows.

mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemorySessionBackend;

use crate::audit::{AuditEvent, AuditEventType, AuditLog};
use crate::clock::{Clock, SystemClock};
use crate::model::{
    FingerprintHash, InvalidationReason, PlatformId, SessionContext, SessionId, SessionRecord,
    SessionState, UserId,
};
use crate::platform::{PlatformBinding, PlatformDirectory};
use crate::{SessionError, SessionResult};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tether_core::config::MAX_SESSION_LIFETIME_SECS;
use tether_core::{validation_error, with_timeout, SessionSettings, TetherResult};
use tracing::{debug, info, warn};

/// Raw row storage under [`SessionStore`]
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Insert a brand new row; fails if the id already exists
    async fn insert(&self, record: &SessionRecord) -> TetherResult<()>;

    /// Load a row regardless of validity
    async fn load(&self, session_id: &SessionId) -> TetherResult<Option<SessionRecord>>;

    /// Replace the mutable columns of a row if its stored version still equals
    /// `expected_version`. Returns `false` when the version moved on or the
    /// row is gone.
    async fn compare_and_swap(
        &self,
        expected_version: u64,
        record: &SessionRecord,
    ) -> TetherResult<bool>;

    /// Delete up to `limit` rows that are no longer valid at `now` and return them
    async fn delete_invalid(&self, now: DateTime<Utc>, limit: u32)
        -> TetherResult<Vec<SessionRecord>>;

    /// Health check for the storage backend
    async fn health_check(&self) -> TetherResult<()>;
}

/// Lifetimes and limits the store enforces
#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub idle_timeout: Duration,
    pub absolute_timeout: Duration,
    pub max_cas_retries: u32,
    pub store_timeout_ms: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self::from(&SessionSettings::default())
    }
}

impl From<&SessionSettings> for StoreSettings {
    fn from(settings: &SessionSettings) -> Self {
        Self {
            idle_timeout: capped_seconds(settings.idle_timeout_secs),
            absolute_timeout: capped_seconds(settings.absolute_timeout_secs),
            max_cas_retries: settings.max_cas_retries.max(1),
            store_timeout_ms: settings.store_timeout_ms,
        }
    }
}

fn capped_seconds(secs: u64) -> Duration {
    Duration::seconds(secs.min(MAX_SESSION_LIFETIME_SECS) as i64)
}

/// Versioned session store
#[derive(Clone)]
pub struct SessionStore {
    backend: Arc<dyn SessionBackend>,
    platforms: Arc<dyn PlatformDirectory>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
    settings: StoreSettings,
}

impl SessionStore {
    pub fn new(
        backend: Arc<dyn SessionBackend>,
        platforms: Arc<dyn PlatformDirectory>,
        audit: Arc<AuditLog>,
        settings: StoreSettings,
    ) -> Self {
        Self {
            backend,
            platforms,
            audit,
            clock: Arc::new(SystemClock),
            settings,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn platforms(&self) -> &Arc<dyn PlatformDirectory> {
        &self.platforms
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Create a session with no fingerprint
    pub async fn create(
        &self,
        user_id: UserId,
        platform_id: Option<PlatformId>,
    ) -> SessionResult<SessionId> {
        self.create_bound(user_id, platform_id, None).await
    }

    /// Create a session bound to the fingerprint of the login request
    pub async fn create_bound(
        &self,
        user_id: UserId,
        platform_id: Option<PlatformId>,
        fingerprint: Option<FingerprintHash>,
    ) -> SessionResult<SessionId> {
        if let Some(platform_id) = platform_id {
            self.require_usable(user_id, platform_id).await?;
        }

        let record = SessionRecord::new(
            user_id,
            platform_id,
            fingerprint,
            self.now(),
            self.settings.idle_timeout,
            self.settings.absolute_timeout,
        );

        self.guarded("session_insert", self.backend.insert(&record))
            .await?;

        info!(
            session = %record.session_id.tag(),
            user_id = %user_id,
            platform_id = ?platform_id,
            "Session created"
        );

        self.record_event(
            AuditEventType::Created,
            &record,
            json!({ "platform_id": platform_id }),
        )
        .await;

        Ok(record.session_id)
    }

    /// Resolve a session, treating every non-active state as absent
    pub async fn get(&self, session_id: &SessionId) -> SessionResult<SessionContext> {
        self.load_valid(session_id)
            .await
            .map(|record| record.to_context())
    }

    /// Slide the idle window forward
    ///
    /// A bound platform that is no longer usable by the session user is
    /// cleared in the same write.
    pub async fn touch(&self, session_id: &SessionId) -> SessionResult<SessionContext> {
        for attempt in 1..=self.settings.max_cas_retries {
            let current = self.load_valid(session_id).await?;
            let now = self.now();

            let mut next = current.next_version();
            next.last_activity_at = now.max(current.last_activity_at);
            next.idle_deadline = next.last_activity_at + self.settings.idle_timeout;

            let mut revoked = None;
            if let Some(platform_id) = current.active_platform_id {
                let binding = self.check_platform(current.user_id, platform_id).await?;
                if binding != PlatformBinding::Usable {
                    next.active_platform_id = None;
                    revoked = Some((platform_id, binding));
                }
            }

            if self.swap(current.version, &next).await? {
                if let Some((platform_id, binding)) = revoked {
                    warn!(
                        session = %session_id.tag(),
                        platform_id = %platform_id,
                        reason = binding.describe(),
                        "Cleared platform binding during touch"
                    );
                    self.record_event(
                        AuditEventType::PlatformSwitched,
                        &next,
                        json!({ "from": platform_id, "to": null, "reason": binding.describe() }),
                    )
                    .await;
                }
                return Ok(next.to_context());
            }

            debug!(
                session = %session_id.tag(),
                attempt,
                "Touch lost a version race, retrying"
            );
        }

        Err(SessionError::conflict("touch retries exhausted"))
    }

    /// Point the session at another platform owned by the session user
    ///
    /// Ownership and activity are re-checked on every attempt.
    pub async fn update_platform(
        &self,
        session_id: &SessionId,
        platform_id: PlatformId,
    ) -> SessionResult<SessionContext> {
        for attempt in 1..=self.settings.max_cas_retries {
            let current = self.load_valid(session_id).await?;

            let binding = self.check_platform(current.user_id, platform_id).await?;
            if binding != PlatformBinding::Usable {
                return Err(SessionError::forbidden(binding.describe()));
            }

            let next = self.platform_write(&current, platform_id);
            if self.swap(current.version, &next).await? {
                debug!(
                    session = %session_id.tag(),
                    platform_id = %platform_id,
                    version = next.version,
                    "Active platform updated"
                );
                return Ok(next.to_context());
            }

            debug!(
                session = %session_id.tag(),
                attempt,
                "Platform update lost a version race, retrying"
            );
        }

        Err(SessionError::conflict("platform update retries exhausted"))
    }

    /// Single compare-and-swap against a caller-supplied version
    pub async fn compare_and_set_platform(
        &self,
        session_id: &SessionId,
        platform_id: PlatformId,
        expected_version: u64,
    ) -> SessionResult<SessionContext> {
        let current = self.load_valid(session_id).await?;
        if current.version != expected_version {
            return Err(SessionError::conflict(format!(
                "expected version {}, found {}",
                expected_version, current.version
            )));
        }

        let binding = self.check_platform(current.user_id, platform_id).await?;
        if binding != PlatformBinding::Usable {
            return Err(SessionError::forbidden(binding.describe()));
        }

        let next = self.platform_write(&current, platform_id);
        if self.swap(expected_version, &next).await? {
            Ok(next.to_context())
        } else {
            Err(SessionError::conflict(format!(
                "version {} was superseded",
                expected_version
            )))
        }
    }

    /// Log a session out; a no-op for unknown or already inactive sessions
    pub async fn invalidate(&self, session_id: &SessionId) -> SessionResult<()> {
        self.invalidate_with_reason(session_id, InvalidationReason::Logout)
            .await
    }

    pub async fn invalidate_with_reason(
        &self,
        session_id: &SessionId,
        reason: InvalidationReason,
    ) -> SessionResult<()> {
        for _ in 0..self.settings.max_cas_retries {
            let current = match self.load(session_id).await? {
                Some(record) if record.is_active => record,
                _ => return Ok(()),
            };

            let mut next = current.next_version();
            next.is_active = false;

            if self.swap(current.version, &next).await? {
                info!(
                    session = %session_id.tag(),
                    user_id = %current.user_id,
                    reason = reason.as_str(),
                    "Session invalidated"
                );
                self.record_event(
                    AuditEventType::Destroyed,
                    &next,
                    json!({ "reason": reason.as_str() }),
                )
                .await;
                return Ok(());
            }
        }

        Err(SessionError::conflict("invalidate retries exhausted"))
    }

    /// Replace `previous` with a fresh session for `user_id`
    ///
    /// Without an explicit platform, a still-usable platform from the previous
    /// session of the same user is carried over. The previous session is only
    /// invalidated once the new platform has been accepted, so a rejected
    /// login leaves it untouched.
    pub async fn migrate(
        &self,
        previous: Option<&SessionId>,
        user_id: UserId,
        platform_id: Option<PlatformId>,
        fingerprint: Option<FingerprintHash>,
    ) -> SessionResult<SessionId> {
        let target = match (platform_id, previous) {
            (Some(requested), _) => {
                self.require_usable(user_id, requested).await?;
                Some(requested)
            }
            (None, Some(previous)) => self.carried_platform(previous, user_id).await?,
            (None, None) => None,
        };

        if let Some(previous) = previous {
            self.invalidate_with_reason(previous, InvalidationReason::Rotated)
                .await?;
        }

        self.create_bound(user_id, target, fingerprint).await
    }

    async fn carried_platform(
        &self,
        previous: &SessionId,
        user_id: UserId,
    ) -> SessionResult<Option<PlatformId>> {
        let candidate = match self.load(previous).await? {
            Some(record) if record.user_id == user_id && record.is_valid_at(self.now()) => {
                record.active_platform_id
            }
            _ => None,
        };

        match candidate {
            Some(candidate)
                if self.check_platform(user_id, candidate).await? == PlatformBinding::Usable =>
            {
                Ok(Some(candidate))
            }
            _ => Ok(None),
        }
    }

    async fn require_usable(&self, user_id: UserId, platform_id: PlatformId) -> SessionResult<()> {
        let binding = self.check_platform(user_id, platform_id).await?;
        if binding != PlatformBinding::Usable {
            return Err(validation_error!(binding.describe(), "platform_id", "session_store").into());
        }
        Ok(())
    }

    /// Physically delete up to `batch_size` rows that already fail validity
    pub async fn cleanup_expired(&self, batch_size: u32) -> SessionResult<usize> {
        let now = self.now();
        let removed = self
            .guarded("session_cleanup", self.backend.delete_invalid(now, batch_size))
            .await?;

        for record in &removed {
            let event_type = match record.state_at(now) {
                SessionState::IdleExpired => AuditEventType::IdleExpired,
                SessionState::AbsoluteExpired => AuditEventType::AbsoluteExpired,
                // Invalidated rows were audited when they were destroyed
                SessionState::Invalidated | SessionState::Active => continue,
            };
            self.record_event(
                event_type,
                record,
                json!({
                    "expires_at": record.expires_at,
                    "idle_deadline": record.idle_deadline,
                }),
            )
            .await;
        }

        if !removed.is_empty() {
            debug!(removed = removed.len(), "Expired sessions removed");
        }

        Ok(removed.len())
    }

    pub async fn health_check(&self) -> SessionResult<()> {
        self.guarded("session_health_check", self.backend.health_check())
            .await
    }

    async fn load(&self, session_id: &SessionId) -> SessionResult<Option<SessionRecord>> {
        self.guarded("session_load", self.backend.load(session_id))
            .await
    }

    async fn load_valid(&self, session_id: &SessionId) -> SessionResult<SessionRecord> {
        match self.load(session_id).await? {
            Some(record) if record.is_valid_at(self.now()) => Ok(record),
            _ => Err(SessionError::NotFound),
        }
    }

    async fn swap(&self, expected_version: u64, next: &SessionRecord) -> SessionResult<bool> {
        self.guarded(
            "session_compare_and_swap",
            self.backend.compare_and_swap(expected_version, next),
        )
        .await
    }

    /// Ownership and activity check under the store timeout
    pub async fn check_platform(
        &self,
        user_id: UserId,
        platform_id: PlatformId,
    ) -> SessionResult<PlatformBinding> {
        self.guarded(
            "platform_lookup",
            self.platforms.check_binding(user_id, platform_id),
        )
        .await
    }

    fn platform_write(&self, current: &SessionRecord, platform_id: PlatformId) -> SessionRecord {
        let mut next = current.next_version();
        next.active_platform_id = Some(platform_id);
        next
    }

    /// Run a store call under the configured timeout
    async fn guarded<T, F>(&self, operation: &str, future: F) -> SessionResult<T>
    where
        F: Future<Output = TetherResult<T>>,
    {
        with_timeout(future, self.settings.store_timeout_ms, operation)
            .await
            .and_then(|result| result)
            .map_err(|error| {
                error.log();
                SessionError::TransientStore(error)
            })
    }

    async fn record_event(
        &self,
        event_type: AuditEventType,
        record: &SessionRecord,
        detail: serde_json::Value,
    ) {
        let event = AuditEvent::new(
            event_type,
            &record.session_id,
            record.user_id,
            self.now(),
            detail,
        );
        self.audit.append(event).await;
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
