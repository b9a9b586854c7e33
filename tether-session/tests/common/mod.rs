#![allow(dead_code)]

use std::sync::Arc;
use tether_session::{
    AuditLog, ManualClock, MemoryAuditSink, MemoryPlatformDirectory, MemorySessionBackend,
    SessionBackend, SessionStore, StoreSettings,
};

/// Platforms 7, 9 and 11 belong to user 42; platform 55 belongs to user 99
pub const PLATFORMS: &[(i64, i64)] = &[(7, 42), (9, 42), (11, 42), (55, 99)];

pub struct Harness {
    pub store: SessionStore,
    pub backend: Arc<MemorySessionBackend>,
    pub platforms: Arc<MemoryPlatformDirectory>,
    pub audit: Arc<MemoryAuditSink>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(StoreSettings::default())
    }

    pub fn with_settings(settings: StoreSettings) -> Self {
        let backend = Arc::new(MemorySessionBackend::new());
        let platforms = Arc::new(MemoryPlatformDirectory::with_platforms(PLATFORMS));
        let audit = Arc::new(MemoryAuditSink::new());
        let clock = Arc::new(ManualClock::default());

        let store = SessionStore::new(
            backend.clone(),
            platforms.clone(),
            Arc::new(AuditLog::new(audit.clone())),
            settings,
        )
        .with_clock(clock.clone());

        Self {
            store,
            backend,
            platforms,
            audit,
            clock,
        }
    }

    /// A second store over the same rows, as another process would see them
    pub fn independent_reader(&self) -> SessionStore {
        let backend: Arc<dyn SessionBackend> = self.backend.clone();
        SessionStore::new(
            backend,
            self.platforms.clone(),
            Arc::new(AuditLog::new(Arc::new(MemoryAuditSink::new()))),
            self.store.settings().clone(),
        )
        .with_clock(self.clock.clone())
    }
}
