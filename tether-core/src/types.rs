//! Configuration data types shared across the workspace

use crate::logging::LoggingConfig;
use serde::{Deserialize, Serialize};

/// Main configuration for the session core and its web surface
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    pub session: SessionSettings,
    pub cookie: CookieSettings,
    pub cleanup: CleanupSettings,
    pub sync: SyncSettings,
    pub storage: StorageSettings,
    pub logging: LoggingConfig,
}

/// Session lifetime and concurrency settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Rolling idle window in seconds
    pub idle_timeout_secs: u64,
    /// Absolute lifetime ceiling in seconds
    pub absolute_timeout_secs: u64,
    /// What to do when the request fingerprint changes
    pub fingerprint_policy: FingerprintPolicy,
    /// Compare-and-swap attempts before a write surfaces `Conflict`
    pub max_cas_retries: u32,
    /// Upper bound on any single store call
    pub store_timeout_ms: u64,
    /// Attempts for a transient store failure at the request boundary
    pub transient_retry_attempts: usize,
}

/// Fingerprint mismatch handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FingerprintPolicy {
    /// Record the mismatch and keep the session
    Warn,
    /// Record the mismatch and invalidate the session
    Block,
}

impl std::str::FromStr for FingerprintPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "warn" => Ok(Self::Warn),
            "block" => Ok(Self::Block),
            other => Err(format!("unknown fingerprint policy: {}", other)),
        }
    }
}

/// Session cookie transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CookieSettings {
    pub name: String,
    /// Only send over TLS
    pub secure: bool,
    pub same_site: SameSitePolicy,
    pub path: String,
    /// Max-Age in seconds; never longer than the absolute timeout
    pub max_age_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SameSitePolicy {
    Strict,
    Lax,
}

/// Background reaper settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupSettings {
    pub enabled: bool,
    pub interval_secs: u64,
    pub batch_size: u32,
    /// Time budget for one run across all batches
    pub run_budget_ms: u64,
}

/// Cross-tab convergence settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Heartbeat period; also the staleness bound between tabs
    pub heartbeat_interval_secs: u64,
    /// Capacity of the in-process broadcast hub
    pub hub_capacity: usize,
}

/// Persistence settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// sqlx database URL; `None` keeps everything in memory
    pub database_url: Option<String>,
    pub max_connections: u32,
    /// Persist audit events next to sessions
    pub persist_audit: bool,
}
