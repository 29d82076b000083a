// Copyright (c) Eth Relay Contributors
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use clap::Parser;
use eth_relay::config::{Config, RelayNodeConfig};
use eth_relay::node::run_relay_node;
use prometheus::Registry;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(name = env!("CARGO_BIN_NAME"), rename_all = "kebab-case")]
struct Args {
    #[clap(long)]
    pub config_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = RelayNodeConfig::load(&args.config_path)?;

    let registry = Registry::new();
    let node = run_relay_node(config, &registry).await?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    node.shutdown().await?;
    Ok(())
}
