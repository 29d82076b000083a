// Copyright (c) Eth Relay Contributors
// SPDX-License-Identifier: Apache-2.0

//! JSON-RPC gateway to the remote chain node.
//!
//! Wraps an `ethers` provider with the operation set the relay needs:
//! block fetching for the scanner, plus the lookup and broadcast surface
//! used by downstream consumers (balances, transaction lookups, transfer
//! submission).

use async_trait::async_trait;
use ethers::providers::{JsonRpcClient, Middleware, Provider};
use ethers::types::{
    Address, BlockNumber, Bytes, Transaction, TransactionRequest, TxHash, H256, U256, U64,
};

use crate::chain_scanner::{FullBlock, NodeGateway, ScanError, ScanResult};
use crate::erc20;
use crate::error::{RelayError, RelayResult};

pub struct EthClient<P> {
    provider: Provider<P>,
    /// Expected chain ID for validation; `None` skips the check.
    expected_chain_id: Option<u64>,
}

impl<P> EthClient<P>
where
    P: JsonRpcClient + 'static,
{
    pub fn from_provider(provider: Provider<P>, expected_chain_id: Option<u64>) -> Self {
        Self {
            provider,
            expected_chain_id,
        }
    }

    pub fn provider(&self) -> &Provider<P> {
        &self.provider
    }

    pub async fn chain_id(&self) -> anyhow::Result<u64> {
        let chain_id = self.provider.get_chainid().await?;
        Ok(chain_id.as_u64())
    }

    /// Validate the chain identifier and log connection info.
    pub async fn describe(&self) -> anyhow::Result<()> {
        let chain_id = self.chain_id().await?;
        let block_number = self.provider.get_block_number().await?;

        if let Some(expected) = self.expected_chain_id {
            if chain_id != expected {
                return Err(anyhow::anyhow!(
                    "Chain ID mismatch: expected {}, got {}. This could indicate connecting to the wrong network!",
                    expected,
                    chain_id
                ));
            }
            tracing::info!(
                "EthClient connected to chain {} (verified), current block: {}",
                chain_id,
                block_number
            );
        } else {
            tracing::warn!(
                "EthClient connected to chain {} (NOT VERIFIED - no expected chain ID set), current block: {}",
                chain_id,
                block_number
            );
        }
        Ok(())
    }

    /// Next nonce for `address` including pending transactions.
    pub async fn pending_nonce(&self, address: Address) -> RelayResult<u64> {
        let nonce = self
            .provider
            .get_transaction_count(address, Some(BlockNumber::Pending.into()))
            .await
            .map_err(provider_err)?;
        Ok(nonce.low_u64())
    }

    /// Broadcast a signed, RLP-encoded transaction and return its hash.
    pub async fn submit_raw_transaction(&self, raw: Bytes) -> RelayResult<TxHash> {
        let pending = self
            .provider
            .send_raw_transaction(raw)
            .await
            .map_err(provider_err)?;
        Ok(pending.tx_hash())
    }

    pub async fn transaction_by_hash(&self, hash: TxHash) -> RelayResult<Option<Transaction>> {
        self.provider
            .get_transaction(hash)
            .await
            .map_err(provider_err)
    }

    /// ETH balance of `address` at the latest block, in wei.
    pub async fn eth_balance(&self, address: Address) -> RelayResult<U256> {
        self.provider
            .get_balance(address, None)
            .await
            .map_err(provider_err)
    }

    /// ERC-20 balance of `owner` via `eth_call` on `balanceOf`.
    pub async fn erc20_balance(&self, contract: Address, owner: Address) -> RelayResult<U256> {
        let call = TransactionRequest::new()
            .to(contract)
            .data(erc20::encode_balance_of(owner));
        let output = self
            .provider
            .call(&call.into(), None)
            .await
            .map_err(provider_err)?;
        if output.is_empty() {
            return Ok(U256::zero());
        }
        let start = output.len().saturating_sub(32);
        Ok(U256::from_big_endian(&output[start..]))
    }
}

fn provider_err<E: std::fmt::Display>(err: E) -> RelayError {
    RelayError::Provider(err.to_string())
}

#[async_trait]
impl<P> NodeGateway for EthClient<P>
where
    P: JsonRpcClient + 'static,
{
    async fn latest_height(&self) -> ScanResult<u64> {
        let number = self
            .provider
            .get_block_number()
            .await
            .map_err(|e| ScanError::Rpc(e.to_string()))?;
        Ok(number.as_u64())
    }

    async fn block_by_height(&self, height: u64) -> ScanResult<Option<FullBlock>> {
        let block = self
            .provider
            .get_block_with_txs(U64::from(height))
            .await
            .map_err(|e| ScanError::Rpc(e.to_string()))?;
        Ok(block.and_then(FullBlock::from_rpc))
    }

    async fn block_by_hash(&self, hash: &str) -> ScanResult<Option<FullBlock>> {
        let hash: H256 = hash
            .parse()
            .map_err(|e| ScanError::Rpc(format!("invalid block hash {hash:?}: {e}")))?;
        let block = self
            .provider
            .get_block_with_txs(hash)
            .await
            .map_err(|e| ScanError::Rpc(e.to_string()))?;
        Ok(block.and_then(FullBlock::from_rpc))
    }
}
