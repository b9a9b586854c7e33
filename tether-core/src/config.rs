//! Configuration management

use crate::config_error;
use crate::error::{ErrorContext, TetherError, TetherResult};
use crate::logging::LoggingConfig;
use crate::types::{
    CleanupSettings, CookieSettings, FingerprintPolicy, SameSitePolicy, SessionSettings,
    StorageSettings, SyncSettings, TetherConfig,
};

use std::path::Path;
use tracing::warn;

/// Upper bound for session lifetimes; every other duration is capped by it.
pub const MAX_SESSION_LIFETIME_SECS: u64 = 365 * 24 * 60 * 60;

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 30 * 60,
            absolute_timeout_secs: 12 * 60 * 60,
            fingerprint_policy: FingerprintPolicy::Warn,
            max_cas_retries: 3,
            store_timeout_ms: 3_000,
            transient_retry_attempts: 3,
        }
    }
}

impl Default for CookieSettings {
    fn default() -> Self {
        Self {
            name: "tether_session".to_string(),
            secure: true,
            same_site: SameSitePolicy::Strict,
            path: "/".to_string(),
            max_age_secs: 12 * 60 * 60,
        }
    }
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            batch_size: 500,
            run_budget_ms: 2_000,
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 5,
            hub_capacity: 256,
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 8,
            persist_audit: true,
        }
    }
}

impl Default for TetherConfig {
    fn default() -> Self {
        Self {
            session: SessionSettings::default(),
            cookie: CookieSettings::default(),
            cleanup: CleanupSettings::default(),
            sync: SyncSettings::default(),
            storage: StorageSettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl TetherConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> TetherResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| TetherError::Config {
            message: format!("Failed to read config file: {}", e),
            source: Some(Box::new(e)),
            context: ErrorContext::new("config")
                .with_operation("read_file")
                .with_suggestion("Check if the config file exists and is readable"),
        })?;

        let config: TetherConfig = toml::from_str(&content).map_err(|e| TetherError::Config {
            message: format!("Failed to parse config: {}", e),
            source: Some(Box::new(e)),
            context: ErrorContext::new("config")
                .with_operation("parse_toml")
                .with_suggestion("Check TOML syntax in config file"),
        })?;

        Ok(config)
    }

    /// Override values from `TETHER_*` environment variables
    ///
    /// Unparseable values are ignored with a warning so a typo in one variable
    /// does not take the whole service down.
    pub fn apply_env(mut self) -> Self {
        if let Some(v) = env_parse("TETHER_IDLE_TIMEOUT_SECS") {
            self.session.idle_timeout_secs = v;
        }
        if let Some(v) = env_parse("TETHER_ABSOLUTE_TIMEOUT_SECS") {
            self.session.absolute_timeout_secs = v;
        }
        if let Some(v) = env_parse("TETHER_FINGERPRINT_POLICY") {
            self.session.fingerprint_policy = v;
        }
        if let Some(v) = env_parse("TETHER_STORE_TIMEOUT_MS") {
            self.session.store_timeout_ms = v;
        }
        if let Ok(v) = std::env::var("TETHER_COOKIE_NAME") {
            self.cookie.name = v;
        }
        if let Some(v) = env_parse("TETHER_COOKIE_SECURE") {
            self.cookie.secure = v;
        }
        if let Some(v) = env_parse("TETHER_CLEANUP_INTERVAL_SECS") {
            self.cleanup.interval_secs = v;
        }
        if let Some(v) = env_parse("TETHER_CLEANUP_BATCH_SIZE") {
            self.cleanup.batch_size = v;
        }
        if let Some(v) = env_parse("TETHER_HEARTBEAT_INTERVAL_SECS") {
            self.sync.heartbeat_interval_secs = v;
        }
        if let Ok(v) = std::env::var("DATABASE_URL") {
            self.storage.database_url = Some(v);
        }
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> TetherResult<()> {
        if self.session.idle_timeout_secs == 0 {
            return Err(config_error!(
                "Idle timeout must be greater than 0",
                "config",
                "Set session.idle_timeout_secs to a positive value"
            ));
        }

        if self.session.absolute_timeout_secs < self.session.idle_timeout_secs {
            return Err(config_error!(
                "Absolute timeout must not be shorter than the idle timeout",
                "config",
                "Raise session.absolute_timeout_secs"
            ));
        }

        if self.session.absolute_timeout_secs > MAX_SESSION_LIFETIME_SECS {
            return Err(config_error!(
                format!(
                    "Absolute timeout exceeds the {} second ceiling",
                    MAX_SESSION_LIFETIME_SECS
                ),
                "config",
                "Lower session.absolute_timeout_secs"
            ));
        }

        if self.session.store_timeout_ms == 0 || self.session.store_timeout_ms > 10_000 {
            return Err(config_error!(
                "Store timeout must be between 1ms and 10s",
                "config",
                "Set session.store_timeout_ms to a single-digit number of seconds"
            ));
        }

        if self.cookie.max_age_secs > self.session.absolute_timeout_secs {
            return Err(config_error!(
                "Cookie max-age exceeds the absolute session lifetime",
                "config",
                "Lower cookie.max_age_secs"
            ));
        }

        if self.cleanup.batch_size == 0 {
            return Err(config_error!(
                "Cleanup batch size must be greater than 0",
                "config",
                "Set cleanup.batch_size to a positive value"
            ));
        }

        if self.sync.heartbeat_interval_secs == 0 {
            return Err(config_error!(
                "Heartbeat interval must be greater than 0",
                "config",
                "Set sync.heartbeat_interval_secs to a positive value"
            ));
        }

        if !self.cookie.secure {
            warn!("Session cookie is not restricted to secure transport");
        }

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = key, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(TetherConfig::default().validate().is_ok());
    }

    #[test]
    fn test_cookie_outliving_session_is_rejected() {
        let mut config = TetherConfig::default();
        config.cookie.max_age_secs = config.session.absolute_timeout_secs + 1;
        assert!(matches!(config.validate(), Err(TetherError::Config { .. })));
    }

    #[test]
    fn test_oversized_lifetime_is_rejected() {
        let mut config = TetherConfig::default();
        config.session.idle_timeout_secs = u64::MAX;
        config.session.absolute_timeout_secs = u64::MAX;
        config.cookie.max_age_secs = 60;

        let err = config.validate().unwrap_err();
        let context = err.context().unwrap();
        assert_eq!(context.component, "config");
        assert_eq!(
            context.recovery_suggestions,
            vec!["Lower session.absolute_timeout_secs".to_string()]
        );

        config.session.idle_timeout_secs = MAX_SESSION_LIFETIME_SECS;
        config.session.absolute_timeout_secs = MAX_SESSION_LIFETIME_SECS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: TetherConfig = toml::from_str(
            r#"
            [session]
            idle_timeout_secs = 60
            fingerprint_policy = "block"
            "#,
        )
        .unwrap();

        assert_eq!(config.session.idle_timeout_secs, 60);
        assert_eq!(config.session.fingerprint_policy, FingerprintPolicy::Block);
        assert_eq!(config.session.max_cas_retries, 3);
        assert_eq!(config.cookie.name, "tether_session");
    }
}
