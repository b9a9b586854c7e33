//! Tether Core - shared infrastructure for the session workspace
//!
//! Error handling with context, logging setup, configuration types and the
//! async retry/timeout helpers used by the session core and the web layer.

pub mod async_utils;
pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use async_utils::*;
pub use error::*;
pub use logging::*;
pub use types::*;

// Re-export commonly used external types
pub use async_trait::async_trait;
pub use tokio;
pub use tracing;
