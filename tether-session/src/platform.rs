//! Platform connection directory
//!
//! Platform connections are owned by the account layer. The session core only
//! asks two questions about them: who owns it, and is it active.

use crate::model::{PlatformId, UserId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tether_core::TetherResult;
use tokio::sync::RwLock;

/// What the session core knows about an external platform connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformConnection {
    pub id: PlatformId,
    pub owner_user_id: UserId,
    pub is_active: bool,
}

/// Result of checking whether a user may bind a session to a platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformBinding {
    Usable,
    Missing,
    NotOwned,
    Inactive,
}

impl PlatformBinding {
    pub fn describe(&self) -> &'static str {
        match self {
            Self::Usable => "platform is usable",
            Self::Missing => "platform does not exist",
            Self::NotOwned => "platform is not owned by the session user",
            Self::Inactive => "platform is not active",
        }
    }
}

/// Ownership and activity lookups for platform connections
#[async_trait]
pub trait PlatformDirectory: Send + Sync {
    async fn platform(&self, id: PlatformId) -> TetherResult<Option<PlatformConnection>>;

    async fn check_binding(
        &self,
        user_id: UserId,
        platform_id: PlatformId,
    ) -> TetherResult<PlatformBinding> {
        Ok(match self.platform(platform_id).await? {
            None => PlatformBinding::Missing,
            Some(p) if p.owner_user_id != user_id => PlatformBinding::NotOwned,
            Some(p) if !p.is_active => PlatformBinding::Inactive,
            Some(_) => PlatformBinding::Usable,
        })
    }
}

/// In-memory directory for development and tests
#[derive(Debug, Default)]
pub struct MemoryPlatformDirectory {
    platforms: RwLock<HashMap<PlatformId, PlatformConnection>>,
}

impl MemoryPlatformDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a directory of active platforms from `(platform, owner)` pairs
    pub fn with_platforms(pairs: &[(i64, i64)]) -> Self {
        let platforms = pairs
            .iter()
            .map(|&(platform, owner)| {
                (
                    PlatformId(platform),
                    PlatformConnection {
                        id: PlatformId(platform),
                        owner_user_id: UserId(owner),
                        is_active: true,
                    },
                )
            })
            .collect();
        Self {
            platforms: RwLock::new(platforms),
        }
    }

    pub async fn upsert(&self, connection: PlatformConnection) {
        self.platforms
            .write()
            .await
            .insert(connection.id, connection);
    }

    pub async fn set_active(&self, id: PlatformId, is_active: bool) {
        if let Some(p) = self.platforms.write().await.get_mut(&id) {
            p.is_active = is_active;
        }
    }

    pub async fn transfer(&self, id: PlatformId, new_owner: UserId) {
        if let Some(p) = self.platforms.write().await.get_mut(&id) {
            p.owner_user_id = new_owner;
        }
    }

    pub async fn remove(&self, id: PlatformId) {
        self.platforms.write().await.remove(&id);
    }
}

#[async_trait]
impl PlatformDirectory for MemoryPlatformDirectory {
    async fn platform(&self, id: PlatformId) -> TetherResult<Option<PlatformConnection>> {
        Ok(self.platforms.read().await.get(&id).cloned())
    }
}

/// Read-only view over the account layer's `platform_connections` table
#[cfg(feature = "sqlite")]
#[derive(Debug, Clone)]
pub struct SqlitePlatformDirectory {
    pool: sqlx::SqlitePool,
}

#[cfg(feature = "sqlite")]
impl SqlitePlatformDirectory {
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the table when running without the account layer's migrations
    pub async fn ensure_schema(&self) -> TetherResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS platform_connections (
                id INTEGER PRIMARY KEY,
                user_id INTEGER NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| tether_core::storage_error!("Failed to create platform_connections table", "platform_directory", e))?;
        Ok(())
    }

    pub async fn upsert(&self, connection: &PlatformConnection) -> TetherResult<()> {
        sqlx::query(
            "INSERT INTO platform_connections (id, user_id, is_active) VALUES (?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET user_id = excluded.user_id, is_active = excluded.is_active",
        )
        .bind(connection.id.0)
        .bind(connection.owner_user_id.0)
        .bind(connection.is_active)
        .execute(&self.pool)
        .await
        .map_err(|e| tether_core::storage_error!("Failed to store platform connection", "platform_directory", e))?;
        Ok(())
    }
}

#[cfg(feature = "sqlite")]
#[async_trait]
impl PlatformDirectory for SqlitePlatformDirectory {
    async fn platform(&self, id: PlatformId) -> TetherResult<Option<PlatformConnection>> {
        use sqlx::Row;

        let row = sqlx::query(
            "SELECT id, user_id, is_active FROM platform_connections WHERE id = ?",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| tether_core::storage_error!("Failed to load platform connection", "platform_directory", e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let owner: i64 = row
            .try_get("user_id")
            .map_err(|e| tether_core::storage_error!("Malformed platform row", "platform_directory", e))?;
        let is_active: bool = row
            .try_get("is_active")
            .map_err(|e| tether_core::storage_error!("Malformed platform row", "platform_directory", e))?;

        Ok(Some(PlatformConnection {
            id,
            owner_user_id: UserId(owner),
            is_active,
        }))
    }
}
