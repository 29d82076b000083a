// Copyright (c) Eth Relay Contributors
// SPDX-License-Identifier: Apache-2.0

//! Transfer submission: build, sign and broadcast ETH and ERC-20 sends.
//!
//! One-shot operations with no internal state machine. The nonce comes from
//! the injected [`NonceManager`] when cached, otherwise from the node's
//! pending-nonce query; the per-address entry lock is held across
//! fetch-nonce → sign → broadcast → increment so sends for one address never
//! reuse a nonce.

use std::sync::Arc;

use ethers::providers::JsonRpcClient;
use ethers::signers::Signer;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, TransactionRequest, TxHash, U256};
use tracing::info;

use crate::erc20;
use crate::error::{RelayError, RelayResult};
use crate::eth_client::EthClient;
use crate::keystore::Keystore;
use crate::metrics::RelayMetrics;
use crate::nonce_manager::NonceManager;

pub struct TransferService<P> {
    client: Arc<EthClient<P>>,
    keystore: Arc<Keystore>,
    nonces: Arc<NonceManager>,
    chain_id: u64,
    metrics: Option<Arc<RelayMetrics>>,
}

impl<P> TransferService<P>
where
    P: JsonRpcClient + 'static,
{
    pub fn new(
        client: Arc<EthClient<P>>,
        keystore: Arc<Keystore>,
        nonces: Arc<NonceManager>,
        chain_id: u64,
    ) -> Self {
        Self {
            client,
            keystore,
            nonces,
            chain_id,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<RelayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Send ETH. `amount` is a human-readable decimal string ("0.5"),
    /// scaled by 10^18.
    pub async fn send_eth(
        &self,
        from: Address,
        to: Address,
        amount: &str,
        gas_limit: u64,
        gas_price: u64,
    ) -> RelayResult<TxHash> {
        let value = erc20::scale_to_base_units(amount, erc20::ETH_DECIMALS)?;
        let request = TransactionRequest::new()
            .from(from)
            .to(to)
            .value(value)
            .gas(gas_limit)
            .gas_price(gas_price)
            .chain_id(self.chain_id);
        self.submit(from, request).await
    }

    /// Send ERC-20 tokens: the value travels in the calldata, the
    /// transaction value is zero.
    #[allow(clippy::too_many_arguments)]
    pub async fn send_erc20(
        &self,
        from: Address,
        contract: Address,
        recipient: Address,
        amount: &str,
        gas_limit: u64,
        gas_price: u64,
        decimals: u32,
    ) -> RelayResult<TxHash> {
        let tokens = erc20::scale_to_base_units(amount, decimals)?;
        let request = TransactionRequest::new()
            .from(from)
            .to(contract)
            .value(U256::zero())
            .gas(gas_limit)
            .gas_price(gas_price)
            .data(erc20::encode_transfer(recipient, tokens))
            .chain_id(self.chain_id);
        self.submit(from, request).await
    }

    async fn submit(&self, from: Address, request: TransactionRequest) -> RelayResult<TxHash> {
        let signer = self
            .keystore
            .signer(from)
            .await
            .ok_or_else(|| RelayError::AccountLocked(format!("{from:?}")))?
            .with_chain_id(self.chain_id);

        // The slot stays locked until the broadcast outcome is known; a
        // failed send leaves the cached nonce untouched for reuse.
        let slot = self.nonces.entry(from).await;
        let mut guard = slot.lock().await;
        let nonce = match *guard {
            Some(nonce) => nonce,
            None => self.client.pending_nonce(from).await?,
        };

        let tx: TypedTransaction = request.nonce(nonce).into();
        let signature = signer
            .sign_transaction(&tx)
            .await
            .map_err(|e| RelayError::Signing(e.to_string()))?;
        let raw = tx.rlp_signed(&signature);

        let hash = self.client.submit_raw_transaction(raw).await?;
        *guard = Some(nonce.saturating_add(1));

        if let Some(metrics) = &self.metrics {
            metrics.transfers_submitted.inc();
        }
        info!(tx_hash = ?hash, from = ?from, nonce, "transaction submitted");
        Ok(hash)
    }
}
