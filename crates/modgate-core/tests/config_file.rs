//! Loading configuration from disk.

use std::io::Write;

use modgate_core::{ConfigError, ModgateConfig};

#[test]
fn test_load_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[sandbox]
max_sandboxes = 4

[policy]
default_timeout_ms = 2500
network_access = true

[scoring]
slow_threshold_ms = 250

[orchestrator]
health_threshold = 0.9
"#
    )
    .unwrap();

    let cfg = ModgateConfig::load(file.path()).unwrap();
    assert_eq!(cfg.sandbox.max_sandboxes, 4);
    assert_eq!(cfg.policy.default_timeout_ms, 2500);
    assert!(cfg.policy.network_access);
    assert_eq!(cfg.scoring.slow_threshold_ms, 250);
    assert_eq!(cfg.orchestrator.health_threshold, 0.9);
    assert_eq!(cfg.orchestrator.scheduler_interval_ms, 5_000);
}

#[test]
fn test_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = ModgateConfig::load(dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
    assert!(err.to_string().contains("absent.toml"));
}

#[test]
fn test_invalid_file_is_rejected() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[orchestrator]\nsandbox_poll_attempts = 0").unwrap();
    assert!(matches!(
        ModgateConfig::load(file.path()),
        Err(ConfigError::Invalid(_))
    ));
}
