//! Config command implementation.

use crate::core::config::Config;
use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};

/// Configuration operations.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

/// Config subcommands.
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Validate configuration file.
    Validate {
        /// Config file path.
        #[arg(short, long, default_value = "config/coherence.toml")]
        config: PathBuf,
    },
    /// Print configuration with defaults filled in.
    Show {
        /// Config file path.
        #[arg(short, long, default_value = "config/coherence.toml")]
        config: PathBuf,
        /// Output format (toml, json).
        #[arg(long, default_value = "toml")]
        format: String,
    },
    /// Generate a configuration template.
    Generate {
        /// Output file path.
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Environment (dev, test, prod).
        #[arg(long, default_value = "dev")]
        env: String,
    },
}

/// Run the config command.
pub fn run_config(args: ConfigArgs) -> Result<()> {
    match args.command {
        ConfigCommand::Validate { config } => validate_config(&config),
        ConfigCommand::Show { config, format } => show_config(&config, &format),
        ConfigCommand::Generate { output, env } => generate_config(output.as_deref(), &env),
    }
}

fn validate_config(path: &Path) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("Config file not found: {:?}", path);
    }

    let config = Config::from_file(path)?;
    println!("✓ Config file is valid");
    println!(
        "  authority: callback timeout {} ms, ledger {} entries / {} ms",
        config.authority.callback_timeout_ms,
        config.authority.commit_ledger_capacity,
        config.authority.commit_ledger_ttl_ms
    );
    println!(
        "  node: id blocks of {}, {} transport retries",
        config.node.oid_block_size, config.node.max_transport_retries
    );
    if config.telemetry.trace_rpc {
        println!("  ⚠ Warning: telemetry.trace_rpc is on; every authority call is logged");
    }
    Ok(())
}

fn show_config(path: &Path, format: &str) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("Config file not found: {:?}", path);
    }

    let config = Config::from_file(path)?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&config)?),
        _ => println!("{}", config.to_toml()?),
    }
    Ok(())
}

fn generate_config(output: Option<&Path>, env: &str) -> Result<()> {
    let template = match env {
        "prod" | "production" => generate_prod_template(),
        "test" => generate_test_template(),
        _ => generate_dev_template(),
    };

    match output {
        Some(path) => {
            std::fs::write(path, &template)?;
            println!("Generated {} config template: {:?}", env, path);
        }
        None => {
            println!("{}", template);
        }
    }

    Ok(())
}

fn generate_dev_template() -> String {
    r#"# Coherence Development Configuration

[authority]
callback_timeout_ms = 5000
commit_ledger_ttl_ms = 300000
commit_ledger_capacity = 4096

[node]
oid_block_size = 64
max_transport_retries = 3
retry_backoff_ms = 50

[cluster]
node_count = 2

[telemetry]
log_level = "debug"
trace_rpc = false
"#
    .to_string()
}

fn generate_test_template() -> String {
    r#"# Coherence Test Configuration

[authority]
callback_timeout_ms = 200
commit_ledger_ttl_ms = 10000
commit_ledger_capacity = 256

[node]
oid_block_size = 8
max_transport_retries = 2
retry_backoff_ms = 5

[cluster]
node_count = 3

[telemetry]
log_level = "trace"
trace_rpc = true
"#
    .to_string()
}

fn generate_prod_template() -> String {
    r#"# Coherence Production Configuration

[authority]
callback_timeout_ms = 10000
commit_ledger_ttl_ms = 600000
commit_ledger_capacity = 65536

[node]
oid_block_size = 1024
max_transport_retries = 5
retry_backoff_ms = 100

[cluster]
node_count = 4

[telemetry]
log_level = "info"
trace_rpc = false
"#
    .to_string()
}
