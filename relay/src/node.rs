// Copyright (c) Eth Relay Contributors
// SPDX-License-Identifier: Apache-2.0

//! Node wiring: pool + migrations, gateway, store, scanner, metrics
//! endpoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::task::JoinHandle;
use tracing::{error, info};
use url::Url;

use eth_relay_pg_db::{Db, DbArgs};

use crate::chain_scanner::ChainScanner;
use crate::config::RelayNodeConfig;
use crate::eth_client::EthClient;
use crate::keystore::Keystore;
use crate::metered_provider::{new_metered_eth_provider, MeteredHttpProvider};
use crate::metrics::RelayMetrics;
use crate::nonce_manager::NonceManager;
use crate::retry_with_max_elapsed_time;
use crate::store::PgChainStore;
use crate::transfer::TransferService;

pub struct RelayNode {
    pub scanner: Arc<ChainScanner<EthClient<MeteredHttpProvider>, PgChainStore>>,
    pub client: Arc<EthClient<MeteredHttpProvider>>,
    pub store: Arc<PgChainStore>,
    pub keystore: Arc<Keystore>,
    pub transfers: Arc<TransferService<MeteredHttpProvider>>,
    metrics_task: JoinHandle<()>,
}

pub async fn run_relay_node(config: RelayNodeConfig, registry: &Registry) -> anyhow::Result<RelayNode> {
    let metrics = Arc::new(RelayMetrics::new(registry));

    let database_url: Url = config
        .db
        .database_url
        .parse()
        .context("invalid database url")?;
    let db = Db::for_write(
        database_url,
        DbArgs {
            db_connection_pool_size: config.db.connection_pool_size,
            db_connection_timeout_ms: config.db.connection_timeout_ms,
        },
    )
    .await?;
    db.run_migrations(&eth_relay_schema::MIGRATIONS).await?;

    let provider = new_metered_eth_provider(&config.eth.eth_rpc_url, metrics.clone())?;
    let client = Arc::new(EthClient::from_provider(
        provider,
        config.eth.expected_chain_id,
    ));
    // Give the node a grace window to come up before declaring it broken.
    match retry_with_max_elapsed_time!(client.describe(), Duration::from_secs(30)) {
        Ok(Ok(())) => {}
        _ => anyhow::bail!(
            "ethereum node at {} is unreachable or on the wrong chain",
            config.eth.eth_rpc_url
        ),
    }
    let chain_id = match config.eth.expected_chain_id {
        Some(chain_id) => chain_id,
        None => client.chain_id().await?,
    };

    let store = Arc::new(PgChainStore::new(db));
    let scanner = Arc::new(
        ChainScanner::new(
            client.clone(),
            store.clone(),
            config.scanner.to_scanner_config(),
        )?
        .with_metrics(metrics.clone()),
    );

    let keystore = Arc::new(Keystore::new(&config.keystore_dir));
    let transfers = Arc::new(
        TransferService::new(
            client.clone(),
            keystore.clone(),
            Arc::new(NonceManager::new()),
            chain_id,
        )
        .with_metrics(metrics.clone()),
    );

    scanner.start().await?;
    let metrics_task = tokio::spawn(serve_metrics(config.metrics_port, registry.clone()));
    info!(chain_id, "eth-relay node started");

    Ok(RelayNode {
        scanner,
        client,
        store,
        keystore,
        transfers,
        metrics_task,
    })
}

impl RelayNode {
    /// Cancel the scan loop, wait for the in-flight step to drain, stop the
    /// metrics endpoint.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let task = self.scanner.stop().await?;
        let _ = task.await;
        self.metrics_task.abort();
        Ok(())
    }
}

async fn serve_metrics(port: u16, registry: Registry) {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let registry = registry.clone();
            async move {
                let mut buffer = Vec::new();
                let encoder = TextEncoder::new();
                if let Err(err) = encoder.encode(&registry.gather(), &mut buffer) {
                    error!(%err, "failed to encode metrics");
                }
                String::from_utf8(buffer).unwrap_or_default()
            }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => {
            info!(%addr, "metrics server listening");
            if let Err(err) = axum::serve(listener, app).await {
                error!(%err, "metrics server exited");
            }
        }
        Err(err) => error!(%err, %addr, "failed to bind metrics server"),
    }
}
