//! SQLite session backend

use super::SessionBackend;
use crate::model::{FingerprintHash, PlatformId, SessionId, SessionRecord, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use tether_core::{storage_error, TetherError, TetherResult};
use tracing::{debug, info};

const COMPONENT: &str = "sqlite_session_backend";

/// Open the pool shared by the store, the platform directory, the audit sink
/// and the cleanup scheduler
///
/// An in-memory database lives only as long as its connection, so memory URLs
/// are pinned to a single connection that is never recycled.
pub async fn open_pool(database_url: &str, max_connections: u32) -> TetherResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(|e| storage_error!(format!("Invalid database URL: {}", database_url), COMPONENT, e))?
        .create_if_missing(true);

    let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
    let pool_options = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(max_connections.max(1))
    };

    let pool = pool_options
        .connect_with(options)
        .await
        .map_err(|e| storage_error!("Failed to connect to SQLite database", COMPONENT, e))?;

    info!(database_url = %database_url, in_memory, "SQLite pool opened");
    Ok(pool)
}

#[derive(Debug, sqlx::FromRow)]
struct SessionRow {
    session_id: String,
    user_id: i64,
    active_platform_id: Option<i64>,
    created_at: i64,
    last_activity_at: i64,
    expires_at: i64,
    idle_deadline: i64,
    fingerprint_hash: Option<String>,
    is_active: bool,
    version: i64,
}

impl SessionRow {
    fn into_record(self) -> TetherResult<SessionRecord> {
        let session_id = SessionId::parse(&self.session_id)
            .ok_or_else(|| storage_error!("Malformed session id in sessions table", COMPONENT))?;

        Ok(SessionRecord {
            session_id,
            user_id: UserId(self.user_id),
            active_platform_id: self.active_platform_id.map(PlatformId),
            created_at: millis_to_time(self.created_at)?,
            last_activity_at: millis_to_time(self.last_activity_at)?,
            expires_at: millis_to_time(self.expires_at)?,
            idle_deadline: millis_to_time(self.idle_deadline)?,
            fingerprint_hash: self.fingerprint_hash.map(FingerprintHash),
            is_active: self.is_active,
            version: self.version as u64,
        })
    }
}

fn millis_to_time(millis: i64) -> TetherResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| storage_error!(format!("Timestamp out of range: {}", millis), COMPONENT))
}

fn query_error(operation: &str, e: sqlx::Error) -> TetherError {
    storage_error!(format!("Session {} failed", operation), COMPONENT, e)
}

/// SQLite-backed session storage
#[derive(Debug, Clone)]
pub struct SqliteSessionBackend {
    pool: SqlitePool,
}

impl SqliteSessionBackend {
    /// Wrap an existing pool and make sure the schema exists
    pub async fn new(pool: SqlitePool) -> TetherResult<Self> {
        let backend = Self { pool };
        backend.create_tables().await?;
        Ok(backend)
    }

    pub async fn from_url(database_url: &str, max_connections: u32) -> TetherResult<Self> {
        Self::new(open_pool(database_url, max_connections).await?).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn create_tables(&self) -> TetherResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL,
                active_platform_id INTEGER,
                created_at INTEGER NOT NULL,
                last_activity_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                idle_deadline INTEGER NOT NULL,
                fingerprint_hash TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                version INTEGER NOT NULL DEFAULT 1
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("table creation", e))?;

        for statement in [
            "CREATE INDEX IF NOT EXISTS idx_sessions_user_id ON sessions(user_id)",
            "CREATE INDEX IF NOT EXISTS idx_sessions_expires_at ON sessions(expires_at)",
            "CREATE INDEX IF NOT EXISTS idx_sessions_idle_deadline ON sessions(idle_deadline)",
        ] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| query_error("index creation", e))?;
        }

        debug!("Sessions schema ready");
        Ok(())
    }
}

#[async_trait]
impl SessionBackend for SqliteSessionBackend {
    async fn insert(&self, record: &SessionRecord) -> TetherResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (
                session_id, user_id, active_platform_id, created_at, last_activity_at,
                expires_at, idle_deadline, fingerprint_hash, is_active, version
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.session_id.as_str())
        .bind(record.user_id.0)
        .bind(record.active_platform_id.map(|p| p.0))
        .bind(record.created_at.timestamp_millis())
        .bind(record.last_activity_at.timestamp_millis())
        .bind(record.expires_at.timestamp_millis())
        .bind(record.idle_deadline.timestamp_millis())
        .bind(record.fingerprint_hash.as_ref().map(|f| f.as_str()))
        .bind(record.is_active)
        .bind(record.version as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("insert", e))?;

        Ok(())
    }

    async fn load(&self, session_id: &SessionId) -> TetherResult<Option<SessionRecord>> {
        let row: Option<SessionRow> = sqlx::query_as(
            r#"
            SELECT session_id, user_id, active_platform_id, created_at, last_activity_at,
                   expires_at, idle_deadline, fingerprint_hash, is_active, version
            FROM sessions WHERE session_id = ?
            "#,
        )
        .bind(session_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| query_error("load", e))?;

        row.map(SessionRow::into_record).transpose()
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        record: &SessionRecord,
    ) -> TetherResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET active_platform_id = ?, last_activity_at = ?, idle_deadline = ?,
                is_active = ?, version = ?
            WHERE session_id = ? AND version = ?
            "#,
        )
        .bind(record.active_platform_id.map(|p| p.0))
        .bind(record.last_activity_at.timestamp_millis())
        .bind(record.idle_deadline.timestamp_millis())
        .bind(record.is_active)
        .bind(record.version as i64)
        .bind(record.session_id.as_str())
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("compare-and-swap", e))?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete_invalid(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> TetherResult<Vec<SessionRecord>> {
        let now = now.timestamp_millis();
        let rows: Vec<SessionRow> = sqlx::query_as(
            r#"
            DELETE FROM sessions
            WHERE session_id IN (
                SELECT session_id FROM sessions
                WHERE is_active = 0 OR expires_at <= ? OR idle_deadline <= ?
                LIMIT ?
            )
            RETURNING session_id, user_id, active_platform_id, created_at, last_activity_at,
                      expires_at, idle_deadline, fingerprint_hash, is_active, version
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_error("cleanup", e))?;

        rows.into_iter().map(SessionRow::into_record).collect()
    }

    async fn health_check(&self) -> TetherResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| query_error("health check", e))?;
        Ok(())
    }
}
