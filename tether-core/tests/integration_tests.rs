//! Integration tests for tether-core infrastructure

use futures::FutureExt;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tether_core::{
    config_error, retry_async, storage_error, validation_error, ErrorContext, FingerprintPolicy,
    RetryConfig, TetherConfig, TetherError,
};

#[tokio::test]
async fn test_error_handling() {
    let error = storage_error!("Connection refused", "session_store");

    match &error {
        TetherError::Storage {
            message, context, ..
        } => {
            assert_eq!(message, "Connection refused");
            assert_eq!(context.component, "session_store");
            assert!(!context.error_id.is_empty());
        }
        _ => panic!("Expected Storage error"),
    }

    error.log();
    assert!(error.is_recoverable());

    let config_error = config_error!("Invalid config", "test");
    assert!(!config_error.is_recoverable());
    config_error.log();

    let validation = validation_error!("bad platform", "platform_id", "test");
    match validation {
        TetherError::Validation { field, .. } => assert_eq!(field.as_deref(), Some("platform_id")),
        _ => panic!("Expected Validation error"),
    }
}

#[tokio::test]
async fn test_retry_recovers_from_transient_failures() {
    let attempt_count = Arc::new(AtomicUsize::new(0));

    let operation = {
        let attempt_count = Arc::clone(&attempt_count);
        move || {
            let count = attempt_count.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if count < 3 {
                    Err(TetherError::Timeout {
                        operation: "load".to_string(),
                        duration_ms: 1,
                        context: ErrorContext::new("test"),
                    })
                } else {
                    Ok("loaded")
                }
            }
            .boxed()
        }
    };

    let config = RetryConfig {
        max_attempts: 3,
        initial_delay_ms: 1,
        max_delay_ms: 5,
        backoff_multiplier: 2.0,
        jitter: true,
    };

    let result = retry_async(operation, &config, "test_operation").await;
    assert_eq!(result.unwrap(), "loaded");
    assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
}

#[test]
fn test_config_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[session]
idle_timeout_secs = 120
absolute_timeout_secs = 3600
fingerprint_policy = "block"

[cookie]
name = "sid"
max_age_secs = 3600

[cleanup]
batch_size = 50
"#
    )
    .unwrap();

    let config = TetherConfig::from_file(file.path()).unwrap();
    assert_eq!(config.session.idle_timeout_secs, 120);
    assert_eq!(config.session.fingerprint_policy, FingerprintPolicy::Block);
    assert_eq!(config.cookie.name, "sid");
    assert_eq!(config.cleanup.batch_size, 50);
    assert!(config.validate().is_ok());
}

#[test]
fn test_config_from_missing_file() {
    let result = TetherConfig::from_file("/definitely/not/here.toml");
    assert!(matches!(result, Err(TetherError::Config { .. })));
}
