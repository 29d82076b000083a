// Copyright (c) Eth Relay Contributors
// SPDX-License-Identifier: Apache-2.0

//! Reorg-aware Ethereum block ingestion.
//!
//! The heart of this crate is [`chain_scanner::ChainScanner`]: a background
//! loop that advances a persisted cursor block-by-block, detects chain
//! reorganizations against the last accepted block, walks back to the common
//! ancestor and repairs persisted history. Everything else is plumbing
//! around it: the JSON-RPC gateway ([`eth_client::EthClient`]), the
//! PostgreSQL chain store ([`store::PgChainStore`]), and the transfer
//! submission path ([`transfer::TransferService`]).

pub mod chain_scanner;
pub mod config;
pub mod erc20;
pub mod error;
pub mod eth_client;
pub mod keystore;
pub mod metered_provider;
pub mod metrics;
pub mod node;
pub mod nonce_manager;
pub mod store;
pub mod transfer;

#[macro_export]
macro_rules! retry_with_max_elapsed_time {
    ($func:expr, $max_elapsed_time:expr) => {{
        // The following delay sequence (in secs) will be used, applied with jitter
        // 0.4, 0.8, 1.6, 3.2, 6.4, 12.8, 25.6, 30, 60, 120, 120 ...
        let backoff = backoff::ExponentialBackoff {
            initial_interval: std::time::Duration::from_millis(400),
            randomization_factor: 0.1,
            multiplier: 2.0,
            max_interval: std::time::Duration::from_secs(120),
            max_elapsed_time: Some($max_elapsed_time),
            ..Default::default()
        };
        backoff::future::retry(backoff, || {
            let fut = async {
                let result = $func.await;
                match result {
                    Ok(_) => {
                        return Ok(result);
                    }
                    Err(e) => {
                        // Every error is treated as transient so we keep retrying
                        // until max_elapsed_time runs out.
                        tracing::debug!("Retrying due to error: {:?}", e);
                        return Err(backoff::Error::transient(e));
                    }
                }
            };
            std::boxed::Box::pin(fut)
        })
        .await
    }};
}
