//! Application state shared by every handler and the background workers

use crate::{
    cookie::SessionCookieManager,
    identity::{IdentityProvider, StaticIdentityProvider},
    WebConfig, WebResult,
};
use std::sync::Arc;
use tether_core::{RetryConfig, TetherConfig};
use tether_session::{
    AuditLog, AuditSink, CleanupScheduler, FingerprintValidator, IntegrityTokens,
    MemoryAuditSink, MemoryPlatformDirectory, MemorySessionBackend, PlatformContextSwitcher,
    PlatformDirectory, ServerSecret, SessionBackend, SessionStore, StoreSettings, SyncHub, UserId,
};
use tracing::{info, warn};

/// Environment variable holding the base64 server secret
pub const SECRET_ENV: &str = "TETHER_SECRET_KEY";
/// Environment variable holding `name:password:user_id` login entries
pub const USERS_ENV: &str = "TETHER_USERS";

/// Main application state
#[derive(Clone)]
pub struct AppState {
    pub config: WebConfig,
    pub store: SessionStore,
    pub cookies: Arc<SessionCookieManager>,
    pub fingerprints: Arc<FingerprintValidator>,
    pub integrity: Arc<IntegrityTokens>,
    pub switcher: PlatformContextSwitcher,
    pub identity: Arc<dyn IdentityProvider>,
    pub hub: SyncHub,
    pub retry: RetryConfig,
}

impl AppState {
    /// Build the state from configuration, opening storage as configured
    pub async fn new(config: WebConfig) -> WebResult<Self> {
        config.tether.validate()?;

        let secret = ServerSecret::from_env_or_generate(SECRET_ENV);
        let settings = &config.tether;

        let (backend, platforms, audit_sink) = Self::open_storage(&config).await?;
        let audit = AuditLog::new(audit_sink).with_timeout_ms(settings.session.store_timeout_ms);

        let store = SessionStore::new(
            backend,
            platforms,
            Arc::new(audit),
            StoreSettings::from(&settings.session),
        );

        let mut identity = StaticIdentityProvider::from_env(USERS_ENV);
        if config.dev_mode {
            identity = identity.with_user("demo", "demo", UserId(1));
        }
        if identity.is_empty() {
            warn!("No login users configured; set {} to enable login", USERS_ENV);
        }

        Ok(Self::from_parts(config, store, &secret, Arc::new(identity)))
    }

    /// Assemble the state around an existing store
    pub fn from_parts(
        config: WebConfig,
        store: SessionStore,
        secret: &ServerSecret,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        let settings = &config.tether;
        let hub = SyncHub::new(settings.sync.hub_capacity);

        Self {
            cookies: Arc::new(SessionCookieManager::new(
                settings.cookie.clone(),
                settings.session.absolute_timeout_secs,
            )),
            fingerprints: Arc::new(FingerprintValidator::new(
                secret,
                settings.session.fingerprint_policy,
            )),
            integrity: Arc::new(IntegrityTokens::new(secret)),
            switcher: PlatformContextSwitcher::new(store.clone(), hub.clone()),
            retry: RetryConfig {
                max_attempts: settings.session.transient_retry_attempts.max(1),
                ..RetryConfig::default()
            },
            identity,
            hub,
            store,
            config,
        }
    }

    pub fn tether(&self) -> &TetherConfig {
        &self.config.tether
    }

    pub fn cleanup_scheduler(&self) -> CleanupScheduler {
        CleanupScheduler::from_settings(self.store.clone(), &self.config.tether.cleanup)
    }

    async fn open_storage(
        config: &WebConfig,
    ) -> WebResult<(
        Arc<dyn SessionBackend>,
        Arc<dyn PlatformDirectory>,
        Arc<dyn AuditSink>,
    )> {
        match config.effective_database_url() {
            Some(url) => Self::open_sqlite(config, url).await,
            None => {
                info!("Using in-memory session storage");
                let platforms = if config.dev_mode {
                    MemoryPlatformDirectory::with_platforms(&[(1, 1), (2, 1)])
                } else {
                    MemoryPlatformDirectory::new()
                };
                Ok((
                    Arc::new(MemorySessionBackend::new()),
                    Arc::new(platforms),
                    Arc::new(MemoryAuditSink::new()),
                ))
            }
        }
    }

    #[cfg(feature = "sqlite")]
    async fn open_sqlite(
        config: &WebConfig,
        url: &str,
    ) -> WebResult<(
        Arc<dyn SessionBackend>,
        Arc<dyn PlatformDirectory>,
        Arc<dyn AuditSink>,
    )> {
        use tether_session::{
            open_pool, PlatformConnection, PlatformId, SqliteAuditSink, SqlitePlatformDirectory,
            SqliteSessionBackend,
        };

        let storage = &config.tether.storage;
        let pool = open_pool(url, storage.max_connections).await?;

        let backend = SqliteSessionBackend::new(pool.clone()).await?;
        let platforms = SqlitePlatformDirectory::new(pool.clone());
        platforms.ensure_schema().await?;

        if config.dev_mode {
            for id in [1, 2] {
                platforms
                    .upsert(&PlatformConnection {
                        id: PlatformId(id),
                        owner_user_id: UserId(1),
                        is_active: true,
                    })
                    .await?;
            }
        }

        let audit: Arc<dyn AuditSink> = if storage.persist_audit {
            Arc::new(SqliteAuditSink::new(pool).await?)
        } else {
            Arc::new(MemoryAuditSink::new())
        };

        info!("Using SQLite session storage");
        Ok((Arc::new(backend), Arc::new(platforms), audit))
    }

    #[cfg(not(feature = "sqlite"))]
    async fn open_sqlite(
        _config: &WebConfig,
        url: &str,
    ) -> WebResult<(
        Arc<dyn SessionBackend>,
        Arc<dyn PlatformDirectory>,
        Arc<dyn AuditSink>,
    )> {
        Err(crate::WebError::Config(format!(
            "database URL {} configured but the sqlite feature is disabled",
            url
        )))
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}
