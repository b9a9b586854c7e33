//! Validated platform switching

use crate::audit::{AuditEvent, AuditEventType};
use crate::model::{PlatformId, SessionContext, SessionId, UserId};
use crate::platform::PlatformBinding;
use crate::store::SessionStore;
use crate::sync::{SyncHub, SyncNotice, SyncState};
use crate::{SessionError, SessionResult};
use serde_json::json;
use tracing::{info, warn};

/// Switches the active platform of a session and announces the result
#[derive(Debug, Clone)]
pub struct PlatformContextSwitcher {
    store: SessionStore,
    hub: SyncHub,
}

impl PlatformContextSwitcher {
    pub fn new(store: SessionStore, hub: SyncHub) -> Self {
        Self { store, hub }
    }

    pub fn hub(&self) -> &SyncHub {
        &self.hub
    }

    /// Switch `session_id` to `requested`
    ///
    /// Nothing is written unless the requesting user owns both the session
    /// and an active `requested` platform. A lost version race is retried
    /// once against a fresh read.
    pub async fn switch(
        &self,
        session_id: &SessionId,
        requested: PlatformId,
        requesting_user: UserId,
    ) -> SessionResult<SessionContext> {
        let before = self.store.get(session_id).await?;
        if before.user_id != requesting_user {
            warn!(
                session = %session_id.tag(),
                requesting_user = %requesting_user,
                "Platform switch attempted on a session owned by another user"
            );
            return Err(SessionError::forbidden("session belongs to another user"));
        }

        let binding = self.store.check_platform(requesting_user, requested).await?;
        if binding != PlatformBinding::Usable {
            return Err(SessionError::forbidden(binding.describe()));
        }

        let updated = match self.store.update_platform(session_id, requested).await {
            Err(SessionError::Conflict { .. }) => {
                self.store.update_platform(session_id, requested).await?
            }
            other => other?,
        };

        info!(
            session = %session_id.tag(),
            user_id = %requesting_user,
            from = ?before.platform_id,
            to = %requested,
            version = updated.version,
            "Platform switched"
        );

        let now = self.store.now();
        self.store
            .audit()
            .append(AuditEvent::new(
                AuditEventType::PlatformSwitched,
                session_id,
                requesting_user,
                now,
                json!({ "from": before.platform_id, "to": requested }),
            ))
            .await;

        self.hub.publish(SyncNotice {
            user_id: requesting_user,
            state: SyncState::from_context(&updated, now),
        });

        Ok(updated)
    }
}
