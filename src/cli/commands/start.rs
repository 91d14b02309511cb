//! Start command implementation.

use crate::core::config::{Config, ConfigOverrides};
use crate::core::runtime::Runtime;
use anyhow::{Context, Result};
use clap::Args;
use std::path::Path;

/// Start an authority and its nodes in one process.
#[derive(Args, Debug, Default)]
pub struct StartArgs {
    /// Number of nodes to start.
    #[arg(long)]
    pub nodes: Option<u32>,

    /// Callback acknowledgement timeout in milliseconds.
    #[arg(long)]
    pub callback_timeout_ms: Option<u64>,

    /// Log every authority call at TRACE.
    #[arg(long)]
    pub trace_rpc: bool,
}

/// Initialize tracing subscriber if the telemetry feature is enabled.
#[cfg(feature = "telemetry")]
fn init_tracing(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

#[cfg(not(feature = "telemetry"))]
fn init_tracing(_level: &str) {}

/// Run the start command. Without a config file the defaults are used.
pub async fn run_start(
    config_path: Option<&Path>,
    log_level: Option<String>,
    args: StartArgs,
) -> Result<()> {
    let mut config = match config_path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load config from {:?}", path))?,
        None => Config::default(),
    };
    config.apply_overrides(&ConfigOverrides {
        log_level,
        node_count: args.nodes,
        callback_timeout_ms: args.callback_timeout_ms,
        trace_rpc: args.trace_rpc,
    });
    config.validate()?;

    let level = if config.telemetry.trace_rpc {
        format!("{},coherence::rpc=trace", config.telemetry.log_level)
    } else {
        config.telemetry.log_level.clone()
    };
    init_tracing(&level);

    let mut runtime = Runtime::new(config)?;
    runtime.run().await
}
