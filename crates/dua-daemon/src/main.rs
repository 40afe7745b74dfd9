// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use dua_config::AgentConfig;
use dua_daemon::AgentRuntime;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "dua-daemon", version, about = "Device update agent daemon")]
struct Args {
    /// Path to the agent configuration file.
    #[arg(long, default_value = "/etc/update-agent/du-config.toml")]
    config: PathBuf,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("dua=debug,dua_daemon=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let (config, warnings) = AgentConfig::load(&args.config)
        .with_context(|| format!("load config {}", args.config.display()))?;
    for warning in &warnings {
        warn!(?warning, "configuration warning");
    }

    tokio::fs::create_dir_all(&config.sandbox_root)
        .await
        .with_context(|| format!("create sandbox root {}", config.sandbox_root.display()))?;

    let runtime = AgentRuntime::with_default_delivery(config);
    let outcome = runtime.run().await;
    info!(?outcome, "agent loop exited");
    std::process::exit(outcome.exit_code());
}
