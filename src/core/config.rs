//! Configuration parsing and validation.
//!
//! Configuration is loaded from TOML files with CLI overrides. Every
//! section is optional; missing keys take their documented defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Authority arbitration settings.
    #[serde(default)]
    pub authority: AuthorityConfig,

    /// Per-node cache and update queue settings.
    #[serde(default)]
    pub node: NodeConfig,

    /// In-process cluster layout.
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Authority configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorityConfig {
    /// How long a holder has to acknowledge an eviction or downgrade
    /// before it is declared failed.
    #[serde(default = "default_callback_timeout_ms")]
    pub callback_timeout_ms: u64,

    /// How long commit outcomes are remembered for redelivery.
    #[serde(default = "default_commit_ledger_ttl_ms")]
    pub commit_ledger_ttl_ms: u64,

    /// Maximum number of remembered commit outcomes.
    #[serde(default = "default_commit_ledger_capacity")]
    pub commit_ledger_capacity: usize,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            callback_timeout_ms: default_callback_timeout_ms(),
            commit_ledger_ttl_ms: default_commit_ledger_ttl_ms(),
            commit_ledger_capacity: default_commit_ledger_capacity(),
        }
    }
}

impl AuthorityConfig {
    pub fn callback_timeout(&self) -> Duration {
        Duration::from_millis(self.callback_timeout_ms)
    }

    pub fn commit_ledger_ttl(&self) -> Duration {
        Duration::from_millis(self.commit_ledger_ttl_ms)
    }
}

/// Node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Number of object ids reserved from the authority at a time.
    #[serde(default = "default_oid_block_size")]
    pub oid_block_size: u64,

    /// Resends of a request after a transport failure before the node
    /// gives up on its session and reconnects.
    #[serde(default = "default_max_transport_retries")]
    pub max_transport_retries: u32,

    /// Base delay between resends; doubles on each attempt.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            oid_block_size: default_oid_block_size(),
            max_transport_retries: default_max_transport_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl NodeConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Cluster layout for the in-process runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Number of nodes started alongside the authority.
    #[serde(default = "default_node_count")]
    pub node_count: u32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_count: default_node_count(),
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Wrap every node's authority link in the RPC tracing decorator.
    #[serde(default)]
    pub trace_rpc: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            trace_rpc: false,
        }
    }
}

fn default_callback_timeout_ms() -> u64 {
    5_000
}

fn default_commit_ledger_ttl_ms() -> u64 {
    300_000
}

fn default_commit_ledger_capacity() -> usize {
    4096
}

fn default_oid_block_size() -> u64 {
    64
}

fn default_max_transport_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    50
}

fn default_node_count() -> u32 {
    2
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).with_context(|| "failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).with_context(|| "failed to serialize config")
    }

    /// Apply CLI overrides to the configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref log_level) = overrides.log_level {
            self.telemetry.log_level = log_level.clone();
        }
        if let Some(node_count) = overrides.node_count {
            self.cluster.node_count = node_count;
        }
        if let Some(timeout) = overrides.callback_timeout_ms {
            self.authority.callback_timeout_ms = timeout;
        }
        if overrides.trace_rpc {
            self.telemetry.trace_rpc = true;
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        self.validate_node()?;
        self.validate_authority()?;
        self.validate_cluster()?;
        self.validate_telemetry()?;
        Ok(())
    }

    fn validate_authority(&self) -> Result<()> {
        if self.authority.callback_timeout_ms == 0 {
            anyhow::bail!("authority.callback_timeout_ms must be > 0");
        }
        if self.authority.commit_ledger_capacity == 0 {
            anyhow::bail!("authority.commit_ledger_capacity must be > 0");
        }
        // A redelivery can arrive after every retry of the node has run.
        let retry_window = self
            .node
            .retry_backoff_ms
            .saturating_mul(1u64 << self.node.max_transport_retries.min(32));
        if self.authority.commit_ledger_ttl_ms < retry_window {
            anyhow::bail!(
                "authority.commit_ledger_ttl_ms ({}) must cover the node retry window ({} ms)",
                self.authority.commit_ledger_ttl_ms,
                retry_window
            );
        }
        Ok(())
    }

    fn validate_node(&self) -> Result<()> {
        if self.node.oid_block_size == 0 {
            anyhow::bail!("node.oid_block_size must be > 0");
        }
        if self.node.max_transport_retries > 16 {
            anyhow::bail!(
                "node.max_transport_retries must be <= 16, got: {}",
                self.node.max_transport_retries
            );
        }
        Ok(())
    }

    fn validate_cluster(&self) -> Result<()> {
        if self.cluster.node_count == 0 {
            anyhow::bail!("cluster.node_count must be > 0");
        }
        Ok(())
    }

    fn validate_telemetry(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.telemetry.log_level.as_str()) {
            anyhow::bail!(
                "telemetry.log_level must be one of {:?}, got: {}",
                valid_levels,
                self.telemetry.log_level
            );
        }
        Ok(())
    }
}

/// CLI override options that can be applied to configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override log level.
    pub log_level: Option<String>,
    /// Override number of in-process nodes.
    pub node_count: Option<u32>,
    /// Override callback timeout.
    pub callback_timeout_ms: Option<u64>,
    /// Force RPC tracing on.
    pub trace_rpc: bool,
}
