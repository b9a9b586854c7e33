//! Append-only audit log for security-relevant session events
//!
//! Appends are best effort relative to the operation that triggered them: a
//! failing sink is reported on the `tether::audit_fallback` tracing target and
//! the session operation carries on.

use crate::model::{SessionId, SessionTag, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tether_core::{with_timeout, TetherResult};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    Created,
    Destroyed,
    PlatformSwitched,
    FingerprintMismatch,
    IdleExpired,
    AbsoluteExpired,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Destroyed => "destroyed",
            Self::PlatformSwitched => "platform_switched",
            Self::FingerprintMismatch => "fingerprint_mismatch",
            Self::IdleExpired => "idle_expired",
            Self::AbsoluteExpired => "absolute_expired",
        }
    }

    /// Events the notification layer refreshes its own state on
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Self::PlatformSwitched | Self::Destroyed)
    }
}

impl std::str::FromStr for AuditEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "created" => Self::Created,
            "destroyed" => Self::Destroyed,
            "platform_switched" => Self::PlatformSwitched,
            "fingerprint_mismatch" => Self::FingerprintMismatch,
            "idle_expired" => Self::IdleExpired,
            "absolute_expired" => Self::AbsoluteExpired,
            other => return Err(format!("unknown audit event type: {}", other)),
        })
    }
}

/// One immutable audit record
///
/// Sessions are identified by their tag so the log never holds bearer tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub event_type: AuditEventType,
    pub session_tag: SessionTag,
    pub user_id: UserId,
    pub timestamp: DateTime<Utc>,
    pub detail: serde_json::Value,
}

impl AuditEvent {
    pub fn new(
        event_type: AuditEventType,
        session_id: &SessionId,
        user_id: UserId,
        timestamp: DateTime<Utc>,
        detail: serde_json::Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            session_tag: session_id.tag(),
            user_id,
            timestamp,
            detail,
        }
    }
}

/// Durable destination for audit events
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, event: &AuditEvent) -> TetherResult<()>;
}

/// Audit log front-end shared by every session component
pub struct AuditLog {
    sink: std::sync::Arc<dyn AuditSink>,
    subscribers: broadcast::Sender<AuditEvent>,
    timeout_ms: u64,
}

impl AuditLog {
    pub fn new(sink: std::sync::Arc<dyn AuditSink>) -> Self {
        let (subscribers, _) = broadcast::channel(256);
        Self {
            sink,
            subscribers,
            timeout_ms: 3_000,
        }
    }

    /// Bound how long a slow sink may delay the triggering operation
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub async fn append(&self, event: AuditEvent) {
        let outcome = with_timeout(self.sink.append(&event), self.timeout_ms, "audit_append").await;

        match outcome {
            Ok(Ok(())) => {
                debug!(
                    event_type = event.event_type.as_str(),
                    session = %event.session_tag,
                    user_id = %event.user_id,
                    "Audit event recorded"
                );
            }
            Ok(Err(e)) | Err(e) => {
                error!(
                    target: "tether::audit_fallback",
                    event_id = %event.event_id,
                    event_type = event.event_type.as_str(),
                    session = %event.session_tag,
                    user_id = %event.user_id,
                    timestamp = %event.timestamp,
                    detail = %event.detail,
                    error = %e,
                    "Audit sink failed, event recorded on fallback channel only"
                );
            }
        }

        if event.event_type.is_broadcast() {
            // No subscribers is the normal case outside the notification layer
            let _ = self.subscribers.send(event);
        }
    }

    /// Receive `platform_switched` and `destroyed` events as they happen
    pub fn subscribe(&self) -> broadcast::Receiver<AuditEvent> {
        self.subscribers.subscribe()
    }
}

/// In-memory sink; the default when no database is configured
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: RwLock<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.read().await.clone()
    }

    pub async fn count_of(&self, event_type: AuditEventType) -> usize {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, event: &AuditEvent) -> TetherResult<()> {
        self.events.write().await.push(event.clone());
        Ok(())
    }
}

/// SQLite sink writing to the `audit_events` table
#[cfg(feature = "sqlite")]
#[derive(Debug, Clone)]
pub struct SqliteAuditSink {
    pool: sqlx::SqlitePool,
}

#[cfg(feature = "sqlite")]
impl SqliteAuditSink {
    pub async fn new(pool: sqlx::SqlitePool) -> TetherResult<Self> {
        let sink = Self { pool };
        sink.create_tables().await?;
        Ok(sink)
    }

    async fn create_tables(&self) -> TetherResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS audit_events (
                event_id TEXT PRIMARY KEY,
                event_type TEXT NOT NULL,
                session_tag TEXT NOT NULL,
                user_id INTEGER NOT NULL,
                occurred_at INTEGER NOT NULL,
                detail TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| tether_core::storage_error!("Failed to create audit_events table", "audit_sink", e))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_audit_events_session ON audit_events(session_tag, occurred_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| tether_core::storage_error!("Failed to create audit_events index", "audit_sink", e))?;

        Ok(())
    }

    /// Most recent events first
    pub async fn recent(&self, limit: u32) -> TetherResult<Vec<AuditEvent>> {
        use sqlx::Row;

        let rows = sqlx::query(
            "SELECT event_id, event_type, session_tag, user_id, occurred_at, detail FROM audit_events ORDER BY occurred_at DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| tether_core::storage_error!("Failed to read audit events", "audit_sink", e))?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let malformed = |what: &str| tether_core::storage_error!(format!("Malformed audit row: {}", what), "audit_sink");

            let event_id: String = row.try_get("event_id").map_err(|_| malformed("event_id"))?;
            let event_type: String = row.try_get("event_type").map_err(|_| malformed("event_type"))?;
            let session_tag: String = row.try_get("session_tag").map_err(|_| malformed("session_tag"))?;
            let user_id: i64 = row.try_get("user_id").map_err(|_| malformed("user_id"))?;
            let occurred_at: i64 = row.try_get("occurred_at").map_err(|_| malformed("occurred_at"))?;
            let detail: String = row.try_get("detail").map_err(|_| malformed("detail"))?;

            events.push(AuditEvent {
                event_id: Uuid::parse_str(&event_id).map_err(|_| malformed("event_id"))?,
                event_type: event_type.parse().map_err(|_| malformed("event_type"))?,
                session_tag: SessionTag::from(session_tag),
                user_id: UserId(user_id),
                timestamp: DateTime::from_timestamp_millis(occurred_at)
                    .ok_or_else(|| malformed("occurred_at"))?,
                detail: serde_json::from_str(&detail)?,
            });
        }

        Ok(events)
    }
}

#[cfg(feature = "sqlite")]
#[async_trait]
impl AuditSink for SqliteAuditSink {
    async fn append(&self, event: &AuditEvent) -> TetherResult<()> {
        sqlx::query(
            "INSERT INTO audit_events (event_id, event_type, session_tag, user_id, occurred_at, detail) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(event.event_id.to_string())
        .bind(event.event_type.as_str())
        .bind(event.session_tag.as_str())
        .bind(event.user_id.0)
        .bind(event.timestamp.timestamp_millis())
        .bind(event.detail.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| tether_core::storage_error!("Failed to append audit event", "audit_sink", e))?;

        Ok(())
    }
}
