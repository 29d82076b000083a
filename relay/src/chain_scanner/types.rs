// Copyright (c) Eth Relay Contributors
// SPDX-License-Identifier: Apache-2.0

//! Capability traits and data types consumed by the scanner.

use std::time::Duration;

use async_trait::async_trait;
use ethers::types::{Block, Transaction, H256};
use eth_relay_schema::models::{BlockRecord, TransactionRecord};

/// Error type for scan operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScanError {
    #[error("rpc error: {0}")]
    Rpc(String),

    /// The node knows the height/hash but has not materialized the body yet.
    /// Retried inside the affected step, never surfaced while the retry
    /// policy allows.
    #[error("block {0} is not available on the node yet")]
    NotYetAvailable(String),

    #[error("storage error: {0}")]
    Storage(String),

    /// A bounded retry policy gave up waiting for a block to materialize.
    #[error("gave up waiting for block {block} after {waited:?}")]
    RetryTimeout { block: String, waited: Duration },

    /// The ancestor walk could not find a common point, even via the
    /// gateway. Persisted history is no longer trustworthy without operator
    /// intervention.
    #[error("no common ancestor within {searched} blocks; chain history requires operator repair")]
    ForkUnresolvable { searched: u32 },

    /// The same fork was detected twice at one cursor height without
    /// repairing a single row: resynchronizing cannot make progress.
    #[error("fork at height {cursor} repeats without repairing any rows; chain history requires operator repair")]
    ForkStalled { cursor: u64 },

    #[error("invalid scanner configuration: {0}")]
    Config(String),

    #[error("scanner is already running")]
    AlreadyRunning,

    #[error("scanner is not running")]
    NotRunning,
}

impl ScanError {
    /// Fatal errors halt the scan loop instead of being retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ScanError::ForkUnresolvable { .. } | ScanError::ForkStalled { .. }
        )
    }

    /// Short identifier for metrics labels.
    pub fn error_type(&self) -> &'static str {
        match self {
            ScanError::Rpc(_) => "rpc",
            ScanError::NotYetAvailable(_) => "not_yet_available",
            ScanError::Storage(_) => "storage",
            ScanError::RetryTimeout { .. } => "retry_timeout",
            ScanError::ForkUnresolvable { .. } => "fork_unresolvable",
            ScanError::ForkStalled { .. } => "fork_stalled",
            ScanError::Config(_) => "config",
            ScanError::AlreadyRunning => "already_running",
            ScanError::NotRunning => "not_running",
        }
    }
}

pub type ScanResult<T> = Result<T, ScanError>;

/// Chain node gateway: what the scanner needs from the remote node.
///
/// `block_by_height`/`block_by_hash` return `Ok(None)` when the node does
/// not have the block materialized yet; the scanner treats that as a
/// transient condition.
#[async_trait]
pub trait NodeGateway: Send + Sync {
    async fn latest_height(&self) -> ScanResult<u64>;

    async fn block_by_height(&self, height: u64) -> ScanResult<Option<FullBlock>>;

    /// `hash` is 0x-prefixed lowercase hex, as persisted in the store.
    async fn block_by_hash(&self, hash: &str) -> ScanResult<Option<FullBlock>>;
}

/// Persisted chain store: the durable, reorg-aware view of chain history.
///
/// The scanner is the only writer. `commit_block` must be atomic: either the
/// block and all its transactions are persisted, or none are.
#[async_trait]
pub trait ChainStore: Send + Sync {
    /// Most recent block with `fork = false`, by creation time descending.
    async fn latest_canonical_block(&self) -> ScanResult<Option<BlockRecord>>;

    async fn block_by_hash(&self, hash: &str) -> ScanResult<Option<BlockRecord>>;

    /// Insert keyed by hash, no-op if the row already exists.
    async fn insert_block_if_absent(&self, block: &BlockRecord) -> ScanResult<()>;

    /// Upsert the block (clearing a stale fork flag) and insert its
    /// transactions in one store transaction.
    async fn commit_block(
        &self,
        block: &BlockRecord,
        transactions: &[TransactionRecord],
    ) -> ScanResult<()>;

    /// Set `fork = true` on every block with height in
    /// `(from_exclusive, to_inclusive]`. Returns the number of rows flagged.
    async fn mark_fork_range(&self, from_exclusive: i64, to_inclusive: i64) -> ScanResult<u64>;
}

/// Outcome of a single scan step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The block at the cursor height was accepted and persisted.
    Accepted { height: u64, transactions: usize },
    /// A reorg was detected and the divergent range flagged; the loop must
    /// resynchronize from the corrected history before scanning again.
    ForkDetected { fork_point: u64, flagged: u64 },
    /// Cancellation was observed mid-step; state is unchanged.
    Interrupted,
}

/// Descriptor of the most recently accepted block, held in scanner memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHead {
    pub hash: String,
    pub parent_hash: String,
    pub number: u64,
    pub timestamp: i64,
}

impl BlockHead {
    pub fn from_record(record: &BlockRecord) -> Self {
        Self {
            hash: record.block_hash.clone(),
            parent_hash: record.parent_hash.clone(),
            number: record.block_number as u64,
            timestamp: record.create_time,
        }
    }
}

/// A block as fetched from the node, with full transaction bodies.
#[derive(Debug, Clone)]
pub struct FullBlock {
    pub hash: H256,
    pub parent_hash: H256,
    pub number: u64,
    pub timestamp: u64,
    pub transactions: Vec<Transaction>,
}

impl FullBlock {
    /// `None` when the RPC response is for a pending block (no hash or
    /// number yet), the same "not materialized" condition as a null body.
    pub fn from_rpc(block: Block<Transaction>) -> Option<Self> {
        let hash = block.hash?;
        let number = block.number?.as_u64();
        Some(Self {
            hash,
            parent_hash: block.parent_hash,
            number,
            timestamp: block.timestamp.as_u64(),
            transactions: block.transactions,
        })
    }

    pub fn head(&self) -> BlockHead {
        BlockHead {
            hash: hex_hash(&self.hash),
            parent_hash: hex_hash(&self.parent_hash),
            number: self.number,
            timestamp: self.timestamp as i64,
        }
    }

    pub fn to_record(&self) -> BlockRecord {
        BlockRecord {
            block_hash: hex_hash(&self.hash),
            parent_hash: hex_hash(&self.parent_hash),
            block_number: self.number as i64,
            create_time: self.timestamp as i64,
            fork: false,
        }
    }

    pub fn transaction_records(&self) -> Vec<TransactionRecord> {
        let block_hash = hex_hash(&self.hash);
        self.transactions
            .iter()
            .enumerate()
            .map(|(index, tx)| TransactionRecord {
                tx_hash: hex_hash(&tx.hash),
                nonce: tx.nonce.low_u64() as i64,
                block_hash: block_hash.clone(),
                block_number: self.number as i64,
                tx_index: tx
                    .transaction_index
                    .map(|i| i.as_u64() as i32)
                    .unwrap_or(index as i32),
                from_address: format!("{:?}", tx.from),
                to_address: tx.to.map(|to| format!("{:?}", to)),
                value: tx.value.to_string(),
                gas_price: tx.gas_price.unwrap_or_default().to_string(),
                gas_limit: tx.gas.to_string(),
                input: format!("0x{}", hex::encode(&tx.input)),
            })
            .collect()
    }
}

fn hex_hash(hash: &H256) -> String {
    format!("{hash:?}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::{Address, Bytes, U256, U64};

    fn rpc_block(hash: Option<H256>, number: Option<u64>) -> Block<Transaction> {
        Block {
            hash,
            parent_hash: H256::from_low_u64_be(1),
            number: number.map(U64::from),
            timestamp: U256::from(1_700_000_000u64),
            ..Default::default()
        }
    }

    #[test]
    fn test_pending_block_is_not_materialized() {
        assert!(FullBlock::from_rpc(rpc_block(None, Some(5))).is_none());
        assert!(FullBlock::from_rpc(rpc_block(Some(H256::from_low_u64_be(2)), None)).is_none());
        assert!(FullBlock::from_rpc(rpc_block(Some(H256::from_low_u64_be(2)), Some(5))).is_some());
    }

    #[test]
    fn test_transaction_records_carry_block_linkage() {
        let tx = Transaction {
            hash: H256::from_low_u64_be(7),
            nonce: U256::from(3u64),
            from: Address::from_low_u64_be(9),
            to: Some(Address::from_low_u64_be(10)),
            value: U256::from(1_000u64),
            gas: U256::from(21_000u64),
            gas_price: Some(U256::from(5u64)),
            input: Bytes::from(vec![0xab, 0xcd]),
            transaction_index: Some(U64::from(0u64)),
            ..Default::default()
        };
        let block = FullBlock {
            hash: H256::from_low_u64_be(42),
            parent_hash: H256::from_low_u64_be(41),
            number: 100,
            timestamp: 1_700_000_000,
            transactions: vec![tx],
        };

        let records = block.transaction_records();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.block_hash, block.to_record().block_hash);
        assert_eq!(record.block_number, 100);
        assert_eq!(record.nonce, 3);
        assert_eq!(record.value, "1000");
        assert_eq!(record.gas_limit, "21000");
        assert_eq!(record.input, "0xabcd");
    }

    #[test]
    fn test_head_matches_record() {
        let block = FullBlock {
            hash: H256::from_low_u64_be(42),
            parent_hash: H256::from_low_u64_be(41),
            number: 100,
            timestamp: 1_700_000_000,
            transactions: vec![],
        };
        let head = block.head();
        let record = block.to_record();
        assert_eq!(head.hash, record.block_hash);
        assert_eq!(head.parent_hash, record.parent_hash);
        assert_eq!(head.number as i64, record.block_number);
        assert_eq!(head, BlockHead::from_record(&record));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(ScanError::ForkUnresolvable { searched: 10 }.is_fatal());
        assert!(ScanError::ForkStalled { cursor: 51 }.is_fatal());
        assert!(!ScanError::Rpc("boom".to_string()).is_fatal());
        assert!(!ScanError::RetryTimeout {
            block: "#5".to_string(),
            waited: Duration::from_secs(1)
        }
        .is_fatal());
    }
}
