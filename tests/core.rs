//! Core tests: configuration loading, validation and error classification.

mod common;

use coherence::core::config::{Config, ConfigOverrides};
use coherence::core::error::{CacheConsistencyError, CoherenceError};
use coherence::protocol::types::{AccessLevel, Epoch, NodeId, ObjectId, ResourceKey};
use common::*;

// ============================================================================
// Config loading
// ============================================================================

#[test]
fn test_minimal_config_fills_defaults() {
    let file = create_minimal_config();
    let config = load_config(&file);

    assert_eq!(config.cluster.node_count, 2);
    assert_eq!(config.authority.callback_timeout_ms, 5_000);
    assert_eq!(config.authority.commit_ledger_ttl_ms, 300_000);
    assert_eq!(config.authority.commit_ledger_capacity, 4096);
    assert_eq!(config.node.oid_block_size, 64);
    assert_eq!(config.node.max_transport_retries, 3);
    assert_eq!(config.node.retry_backoff_ms, 50);
    assert_eq!(config.telemetry.log_level, "info");
    assert!(!config.telemetry.trace_rpc);
}

#[test]
fn test_config_with_settings() {
    let file = create_config_with_settings(750, 5, "debug");
    let config = load_config(&file);

    assert_eq!(config.authority.callback_timeout_ms, 750);
    assert_eq!(
        config.authority.callback_timeout(),
        std::time::Duration::from_millis(750)
    );
    assert_eq!(config.cluster.node_count, 5);
    assert_eq!(config.telemetry.log_level, "debug");
}

#[test]
fn test_missing_file_is_an_error() {
    let err = Config::from_file(std::path::Path::new("/nonexistent/coherence.toml")).unwrap_err();
    assert!(err.to_string().contains("failed to read config file"));
}

#[test]
fn test_unparseable_config_is_an_error() {
    assert!(Config::from_toml("[authority\ncallback_timeout_ms = ").is_err());
    assert!(Config::from_toml("[authority]\ncallback_timeout_ms = \"soon\"").is_err());
}

// ============================================================================
// Config validation
// ============================================================================

#[test]
fn test_zero_callback_timeout_is_rejected() {
    let err = Config::from_toml("[authority]\ncallback_timeout_ms = 0").unwrap_err();
    assert!(err.to_string().contains("callback_timeout_ms"));
}

#[test]
fn test_zero_node_count_is_rejected() {
    assert!(Config::from_toml("[cluster]\nnode_count = 0").is_err());
}

#[test]
fn test_zero_block_size_is_rejected() {
    assert!(Config::from_toml("[node]\noid_block_size = 0").is_err());
}

#[test]
fn test_too_many_retries_is_rejected() {
    let err = Config::from_toml("[node]\nmax_transport_retries = 17").unwrap_err();
    assert!(err.to_string().contains("max_transport_retries"));
}

#[test]
fn test_ledger_ttl_must_cover_retry_window() {
    let content = r#"
[authority]
commit_ledger_ttl_ms = 1000

[node]
max_transport_retries = 4
retry_backoff_ms = 100
"#;
    let err = Config::from_toml(content).unwrap_err();
    assert!(err.to_string().contains("retry window"));

    let content = r#"
[authority]
commit_ledger_ttl_ms = 1600

[node]
max_transport_retries = 4
retry_backoff_ms = 100
"#;
    assert!(Config::from_toml(content).is_ok());
}

#[test]
fn test_unknown_log_level_is_rejected() {
    let file = create_config_with_settings(1000, 2, "loud");
    assert!(Config::from_file(file.path()).is_err());
}

#[test]
fn test_overrides_apply_and_revalidate() {
    let mut config = Config::default();
    config.apply_overrides(&ConfigOverrides {
        log_level: Some("trace".to_string()),
        node_count: Some(7),
        callback_timeout_ms: Some(100),
        trace_rpc: true,
    });
    assert_eq!(config.telemetry.log_level, "trace");
    assert_eq!(config.cluster.node_count, 7);
    assert_eq!(config.authority.callback_timeout_ms, 100);
    assert!(config.telemetry.trace_rpc);
    assert!(config.validate().is_ok());

    config.apply_overrides(&ConfigOverrides {
        node_count: Some(0),
        ..Default::default()
    });
    assert!(config.validate().is_err());
}

#[test]
fn test_empty_overrides_change_nothing() {
    let mut config = load_config(&create_config_with_settings(900, 3, "warn"));
    config.apply_overrides(&ConfigOverrides::default());
    assert_eq!(config.authority.callback_timeout_ms, 900);
    assert_eq!(config.cluster.node_count, 3);
    assert_eq!(config.telemetry.log_level, "warn");
    assert!(!config.telemetry.trace_rpc);
}

#[test]
fn test_config_round_trips_through_toml() {
    let config = load_config(&create_config_with_settings(1234, 4, "error"));
    let rendered = config.to_toml().unwrap();
    let parsed = Config::from_toml(&rendered).unwrap();
    assert_eq!(parsed.authority.callback_timeout_ms, 1234);
    assert_eq!(parsed.cluster.node_count, 4);
    assert_eq!(parsed.telemetry.log_level, "error");
}

// ============================================================================
// Errors
// ============================================================================

#[test]
fn test_consistency_errors_are_never_retriable() {
    let errors: Vec<CoherenceError> = vec![
        CacheConsistencyError::stale_epoch(NodeId(1), Epoch(1), Some(Epoch(2))).into(),
        CacheConsistencyError::UnknownNode { node: NodeId(1) }.into(),
        CacheConsistencyError::not_held(
            NodeId(1),
            ResourceKey::Object(ObjectId(1)),
            AccessLevel::Exclusive,
            None,
        )
        .into(),
        CacheConsistencyError::mismatch(NodeId(1), ResourceKey::binding("a"), "evict pending")
            .into(),
        CacheConsistencyError::malformed("short").into(),
    ];
    for err in errors {
        assert!(err.is_consistency());
        assert!(!err.is_retriable(), "{err} must not be retried");
        assert!(err.as_consistency().is_some());
    }
}

#[test]
fn test_only_session_errors_invalidate_the_session() {
    assert!(CacheConsistencyError::stale_epoch(NodeId(2), Epoch(3), None).invalidates_session());
    assert!(!CacheConsistencyError::AlreadyExists {
        resource: ResourceKey::binding("x")
    }
    .invalidates_session());
    assert!(!CacheConsistencyError::ConflictingHolder {
        resource: ResourceKey::Object(ObjectId(4)),
        holder: NodeId(2),
    }
    .invalidates_session());
}

#[test]
fn test_error_messages_name_the_resource() {
    let err: CoherenceError = CacheConsistencyError::not_held(
        NodeId(3),
        ResourceKey::binding("root"),
        AccessLevel::Exclusive,
        Some(AccessLevel::Shared),
    )
    .into();
    let message = err.to_string();
    assert!(message.contains("node:3"));
    assert!(message.contains("\"root\""));

    let held: CoherenceError = CacheConsistencyError::ConflictingHolder {
        resource: ResourceKey::Object(ObjectId(7)),
        holder: NodeId(2),
    }
    .into();
    assert!(held.to_string().contains("oid:7"));
    assert!(!CoherenceError::Shutdown.is_retriable());
}
