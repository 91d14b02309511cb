//! Coherence - unified CLI entrypoint.
//!
//! Usage:
//!   coherence start [--config config/coherence.toml] [--nodes N]
//!   coherence config validate --config config/coherence.toml
//!   coherence config show --config config/coherence.toml [--format json]
//!   coherence config generate [--env dev|test|prod]

use anyhow::Result;
use clap::Parser;
use coherence::cli::commands::{run_config, run_start};
use coherence::cli::{Cli, Commands};
use std::path::PathBuf;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.map(PathBuf::from);

    match cli.command {
        Commands::Start(args) => run_start(config_path.as_deref(), cli.log_level, args).await,
        Commands::Config(args) => run_config(args),
    }
}
