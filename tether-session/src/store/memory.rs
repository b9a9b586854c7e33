use super::SessionBackend;
use crate::model::{SessionId, SessionRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tether_core::TetherResult;
use tokio::sync::RwLock;

/// In-memory session backend (default implementation)
#[derive(Debug, Default)]
pub struct MemorySessionBackend {
    sessions: Arc<RwLock<HashMap<String, SessionRecord>>>,
}

impl MemorySessionBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait]
impl SessionBackend for MemorySessionBackend {
    async fn insert(&self, record: &SessionRecord) -> TetherResult<()> {
        let mut sessions = self.sessions.write().await;
        let key = record.session_id.as_str();
        if sessions.contains_key(key) {
            return Err(tether_core::storage_error!(
                "Session id already exists",
                "memory_session_backend"
            ));
        }
        sessions.insert(key.to_string(), record.clone());
        Ok(())
    }

    async fn load(&self, session_id: &SessionId) -> TetherResult<Option<SessionRecord>> {
        Ok(self.sessions.read().await.get(session_id.as_str()).cloned())
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        record: &SessionRecord,
    ) -> TetherResult<bool> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(record.session_id.as_str()) {
            Some(stored) if stored.version == expected_version => {
                stored.active_platform_id = record.active_platform_id;
                stored.last_activity_at = record.last_activity_at;
                stored.idle_deadline = record.idle_deadline;
                stored.is_active = record.is_active;
                stored.version = record.version;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_invalid(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> TetherResult<Vec<SessionRecord>> {
        let mut sessions = self.sessions.write().await;
        let doomed: Vec<String> = sessions
            .iter()
            .filter(|(_, record)| !record.is_valid_at(now))
            .map(|(key, _)| key.clone())
            .take(limit as usize)
            .collect();

        Ok(doomed
            .into_iter()
            .filter_map(|key| sessions.remove(&key))
            .collect())
    }

    async fn health_check(&self) -> TetherResult<()> {
        let _sessions = self.sessions.read().await;
        Ok(())
    }
}
