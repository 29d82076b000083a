// Copyright (c) Eth Relay Contributors
// SPDX-License-Identifier: Apache-2.0

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use eth_relay_schema::models::BlockRecord;

use super::config::ScannerConfig;
use super::types::{
    BlockHead, ChainStore, FullBlock, NodeGateway, ScanError, ScanResult, StepOutcome,
};
use crate::metrics::RelayMetrics;

/// The chain scanner: a long-lived background loop that advances a persisted
/// cursor block-by-block, detects reorgs and repairs persisted history.
///
/// Cancellation is cooperative: the token is observed between polls and at
/// loop-iteration boundaries. An in-flight store write is never interrupted,
/// so a transaction either commits or rolls back before the loop exits.
pub struct ChainScanner<G, S> {
    gateway: Arc<G>,
    store: Arc<S>,
    config: ScannerConfig,
    metrics: Option<Arc<RelayMetrics>>,
    // Run-lock: prevents overlapping start calls, nothing else. Per-step
    // state lives inside the loop task, which never overlaps itself.
    run_state: Mutex<Option<RunHandle>>,
}

struct RunHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl<G, S> ChainScanner<G, S>
where
    G: NodeGateway + 'static,
    S: ChainStore + 'static,
{
    pub fn new(gateway: Arc<G>, store: Arc<S>, config: ScannerConfig) -> ScanResult<Self> {
        config.validate().map_err(ScanError::Config)?;
        Ok(Self {
            gateway,
            store,
            config,
            metrics: None,
            run_state: Mutex::new(None),
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<RelayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Resynchronize with persisted history and launch the scan loop.
    ///
    /// Fails fast with [`ScanError::AlreadyRunning`] if a loop is active;
    /// at most one runs per instance.
    pub async fn start(&self) -> ScanResult<()> {
        let mut run = self.run_state.lock().await;
        if run.is_some() {
            return Err(ScanError::AlreadyRunning);
        }

        let cancel = CancellationToken::new();
        let mut driver = ScanDriver {
            gateway: self.gateway.clone(),
            store: self.store.clone(),
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            state: ScanState::default(),
        };
        driver.resume(&cancel).await?;

        let task = tokio::spawn(run_loop(driver, cancel.clone()));
        *run = Some(RunHandle { cancel, task });
        Ok(())
    }

    /// Release the run-lock and raise the cancellation signal. Returns the
    /// loop task handle so callers may await the drain; calling `stop`
    /// without a prior successful `start` is a usage error.
    pub async fn stop(&self) -> ScanResult<JoinHandle<()>> {
        let mut run = self.run_state.lock().await;
        let handle = run.take().ok_or(ScanError::NotRunning)?;
        handle.cancel.cancel();
        Ok(handle.task)
    }

    pub async fn is_running(&self) -> bool {
        self.run_state.lock().await.is_some()
    }
}

async fn run_loop<G, S>(mut driver: ScanDriver<G, S>, cancel: CancellationToken)
where
    G: NodeGateway,
    S: ChainStore,
{
    info!(cursor = driver.state.cursor, "chain scanner started");
    loop {
        if cancel.is_cancelled() {
            info!("chain scanner stopped");
            break;
        }

        if driver.state.fork_pending {
            match driver.resume(&cancel).await {
                Ok(()) => {
                    driver.state.fork_pending = false;
                    continue;
                }
                Err(err) => {
                    warn!(%err, "resynchronization after fork failed; retrying");
                    driver.count_error(&err);
                }
            }
        } else {
            match driver.scan_step(&cancel).await {
                Ok(StepOutcome::Accepted {
                    height,
                    transactions,
                }) => {
                    debug!(height, transactions, "scan step accepted block");
                }
                Ok(StepOutcome::ForkDetected { fork_point, .. }) => {
                    debug!(fork_point, "scan step detected fork; resynchronizing");
                    driver.state.fork_pending = true;
                    continue;
                }
                Ok(StepOutcome::Interrupted) => continue,
                Err(err) if err.is_fatal() => {
                    driver.count_error(&err);
                    error!(%err, "chain scanner halted; operator intervention required");
                    break;
                }
                Err(err) => {
                    warn!(%err, cursor = driver.state.cursor, "scan step failed; will retry");
                    driver.count_error(&err);
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("chain scanner stopped");
                break;
            }
            _ = time::sleep(driver.config.scan_interval) => {}
        }
    }
}

#[derive(Debug, Default)]
struct ScanState {
    last_accepted: Option<BlockHead>,
    cursor: u64,
    fork_pending: bool,
    // Cursor of the most recent fork detection, cleared on accept. Guards
    // against re-detecting a fork that repairs nothing.
    last_fork_cursor: Option<u64>,
}

struct ScanDriver<G, S> {
    gateway: Arc<G>,
    store: Arc<S>,
    config: ScannerConfig,
    metrics: Option<Arc<RelayMetrics>>,
    state: ScanState,
}

impl<G, S> ScanDriver<G, S>
where
    G: NodeGateway,
    S: ChainStore,
{
    /// Recompute the cursor from persisted history.
    ///
    /// On the first-ever run the store is empty: the chain tip is fetched,
    /// persisted as the seed row (the ancestor walk must be able to
    /// terminate at a stored hash later), and the cursor starts right after
    /// it. Otherwise the cursor resumes after the latest non-forked block
    /// without contacting the node for historical data.
    async fn resume(&mut self, cancel: &CancellationToken) -> ScanResult<()> {
        match self.store.latest_canonical_block().await? {
            Some(record) => {
                self.state.cursor = record.block_number as u64 + 1;
                info!(
                    height = record.block_number,
                    hash = %record.block_hash,
                    "resuming after last accepted block"
                );
                self.state.last_accepted = Some(BlockHead::from_record(&record));
            }
            None => {
                let tip = self.gateway.latest_height().await?;
                // A cancelled fetch leaves state untouched; the loop
                // observes the token right after.
                let Some(block) = self.fetch_by_height(tip, cancel).await? else {
                    return Ok(());
                };
                let record = block.to_record();
                self.store
                    .commit_block(&record, &block.transaction_records())
                    .await?;
                info!(height = tip, hash = %record.block_hash, "seeded empty store from chain tip");
                self.state.cursor = tip + 1;
                self.state.last_accepted = Some(block.head());
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics
                .last_scanned_block
                .set(self.state.cursor.saturating_sub(1) as i64);
        }
        Ok(())
    }

    /// One scan step: wait for the tip, fetch the cursor block, persist or
    /// flag a fork.
    async fn scan_step(&mut self, cancel: &CancellationToken) -> ScanResult<StepOutcome> {
        let cursor = self.state.cursor;

        // Sole backpressure mechanism: never scan ahead of the remote tip.
        let mut tip = self.gateway.latest_height().await?;
        while tip < cursor {
            debug!(tip, cursor, "waiting for the chain tip to reach the cursor");
            tokio::select! {
                _ = cancel.cancelled() => return Ok(StepOutcome::Interrupted),
                _ = time::sleep(self.config.tip_poll_interval) => {}
            }
            // Errors while waiting only delay the next poll.
            if let Ok(height) = self.gateway.latest_height().await {
                tip = height;
            }
        }

        let Some(block) = self.fetch_by_height(cursor, cancel).await? else {
            return Ok(StepOutcome::Interrupted);
        };
        let record = block.to_record();

        // Resume establishes the last accepted block before the first step.
        let Some(last) = self.state.last_accepted.clone() else {
            return Err(ScanError::NotRunning);
        };

        if last.hash == record.block_hash || last.hash == record.parent_hash {
            // B re-confirms L, or B is L's immediate successor. The upsert
            // clears a stale fork flag on idempotent re-scan, and the
            // on-conflict transaction insert keeps re-scans duplicate-free.
            let transactions = block.transaction_records();
            self.store.commit_block(&record, &transactions).await?;
            info!(
                height = record.block_number,
                hash = %record.block_hash,
                transactions = transactions.len(),
                "block accepted"
            );
            self.state.last_accepted = Some(block.head());
            self.state.cursor = cursor + 1;
            self.state.last_fork_cursor = None;
            if let Some(metrics) = &self.metrics {
                metrics.last_scanned_block.set(record.block_number);
                metrics.scanned_transactions.inc_by(transactions.len() as u64);
            }
            Ok(StepOutcome::Accepted {
                height: record.block_number as u64,
                transactions: transactions.len(),
            })
        } else {
            // Keep the divergent block as history; the range update below
            // flags it together with the stale rows.
            self.store.insert_block_if_absent(&record).await?;

            let Some(fork_point) = self.locate_fork_point(&record.parent_hash, cancel).await?
            else {
                return Ok(StepOutcome::Interrupted);
            };

            // Everything the store holds above the fork point is invalid,
            // including rows above the observed height.
            let flag_to = record.block_number.max(last.number as i64);
            let flagged = self
                .store
                .mark_fork_range(fork_point.block_number, flag_to)
                .await?;

            // A repeated fork at the same cursor that repairs nothing can
            // never converge by resynchronizing again.
            if flagged == 0 && self.state.last_fork_cursor == Some(cursor) {
                return Err(ScanError::ForkStalled { cursor });
            }
            self.state.last_fork_cursor = Some(cursor);

            warn!(
                fork_point = fork_point.block_number,
                observed = record.block_number,
                flagged,
                "chain reorganized; flagged divergent range"
            );
            if let Some(metrics) = &self.metrics {
                metrics.chain_forks_detected.inc();
                metrics.fork_blocks_flagged.inc_by(flagged);
            }
            Ok(StepOutcome::ForkDetected {
                fork_point: fork_point.block_number as u64,
                flagged,
            })
        }
    }

    /// Walk parent hashes backwards until one is found in the store. The
    /// walk is iterative with a depth guard; a hash the gateway cannot
    /// produce either means the history cannot be repaired.
    async fn locate_fork_point(
        &self,
        parent_hash: &str,
        cancel: &CancellationToken,
    ) -> ScanResult<Option<BlockRecord>> {
        let mut parent_hash = parent_hash.to_string();
        for searched in 0..self.config.max_ancestor_depth {
            if let Some(record) = self.store.block_by_hash(&parent_hash).await? {
                return Ok(Some(record));
            }
            debug!(hash = %parent_hash, searched, "ancestor not in store; fetching from node");
            let parent = match self.fetch_by_hash(&parent_hash, cancel).await {
                Ok(Some(block)) => block,
                Ok(None) => return Ok(None),
                // The gateway never produced the ancestor: the common point
                // cannot be located anywhere.
                Err(ScanError::RetryTimeout { .. }) => {
                    return Err(ScanError::ForkUnresolvable { searched })
                }
                Err(other) => return Err(other),
            };
            parent_hash = format!("{:?}", parent.parent_hash);
        }
        Err(ScanError::ForkUnresolvable {
            searched: self.config.max_ancestor_depth,
        })
    }

    async fn fetch_by_height(
        &self,
        height: u64,
        cancel: &CancellationToken,
    ) -> ScanResult<Option<FullBlock>> {
        self.fetch_with_retry(&format!("#{height}"), cancel, || {
            self.gateway.block_by_height(height)
        })
        .await
    }

    async fn fetch_by_hash(
        &self,
        hash: &str,
        cancel: &CancellationToken,
    ) -> ScanResult<Option<FullBlock>> {
        self.fetch_with_retry(hash, cancel, || self.gateway.block_by_hash(hash))
            .await
    }

    /// Fetch a block, retrying "not materialized yet" under the configured
    /// policy. Returns `Ok(None)` when cancellation is observed between
    /// attempts; any non-transient gateway error is surfaced as-is.
    async fn fetch_with_retry<F, Fut>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        fetch: F,
    ) -> ScanResult<Option<FullBlock>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = ScanResult<Option<FullBlock>>>,
    {
        let started = Instant::now();
        let policy = self.config.fetch_retry.to_backoff();
        let attempt = || async {
            match fetch().await {
                Ok(Some(block)) => Ok(block),
                Ok(None) => {
                    debug!(block = %what, "block not materialized yet; retrying");
                    Err(backoff::Error::transient(ScanError::NotYetAvailable(
                        what.to_string(),
                    )))
                }
                Err(err) => Err(backoff::Error::permanent(err)),
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => Ok(None),
            result = backoff::future::retry(policy, attempt) => match result {
                Ok(block) => Ok(Some(block)),
                Err(ScanError::NotYetAvailable(_)) => Err(ScanError::RetryTimeout {
                    block: what.to_string(),
                    waited: started.elapsed(),
                }),
                Err(other) => Err(other),
            },
        }
    }

    fn count_error(&self, err: &ScanError) {
        if let Some(metrics) = &self.metrics {
            metrics
                .scan_step_errors
                .with_label_values(&[err.error_type()])
                .inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain_scanner::RetryConfig;
    use async_trait::async_trait;
    use eth_relay_schema::models::TransactionRecord;
    use ethers::types::{Transaction, H256, U256, U64};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    fn test_config() -> ScannerConfig {
        ScannerConfig {
            scan_interval: Duration::from_millis(5),
            tip_poll_interval: Duration::from_millis(5),
            fetch_retry: RetryConfig {
                initial_interval: Duration::from_millis(1),
                max_interval: Duration::from_millis(5),
                max_elapsed: Some(Duration::from_millis(50)),
            },
            max_ancestor_depth: 64,
        }
    }

    fn hash(tag: u64) -> H256 {
        H256::from_low_u64_be(tag)
    }

    fn hex(tag: u64) -> String {
        format!("{:?}", hash(tag))
    }

    /// Build a block whose single transaction hash is derived from the block
    /// hash, so duplicate inserts are detectable.
    fn block(number: u64, tag: u64, parent_tag: u64) -> FullBlock {
        let tx = Transaction {
            hash: hash(tag * 1_000_003),
            nonce: U256::from(number),
            transaction_index: Some(U64::from(0u64)),
            ..Default::default()
        };
        FullBlock {
            hash: hash(tag),
            parent_hash: hash(parent_tag),
            number,
            timestamp: 1_700_000_000 + number,
            transactions: vec![tx],
        }
    }

    #[derive(Default)]
    struct MockGateway {
        tip: AtomicU64,
        by_height: std::sync::Mutex<HashMap<u64, FullBlock>>,
        by_hash: std::sync::Mutex<HashMap<String, FullBlock>>,
        height_fetches: AtomicU64,
        hash_fetches: AtomicU64,
    }

    impl MockGateway {
        fn with_tip(tip: u64) -> Self {
            let gateway = Self::default();
            gateway.tip.store(tip, Ordering::SeqCst);
            gateway
        }

        /// Serve `block` at its height and by its hash.
        fn serve(&self, block: FullBlock) {
            self.by_hash
                .lock()
                .unwrap()
                .insert(format!("{:?}", block.hash), block.clone());
            self.by_height.lock().unwrap().insert(block.number, block);
        }

        /// Serve `block` by hash only (an ancestor on the new branch).
        fn serve_by_hash(&self, block: FullBlock) {
            self.by_hash
                .lock()
                .unwrap()
                .insert(format!("{:?}", block.hash), block);
        }
    }

    #[async_trait]
    impl NodeGateway for MockGateway {
        async fn latest_height(&self) -> ScanResult<u64> {
            Ok(self.tip.load(Ordering::SeqCst))
        }

        async fn block_by_height(&self, height: u64) -> ScanResult<Option<FullBlock>> {
            self.height_fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.by_height.lock().unwrap().get(&height).cloned())
        }

        async fn block_by_hash(&self, hash: &str) -> ScanResult<Option<FullBlock>> {
            self.hash_fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.by_hash.lock().unwrap().get(hash).cloned())
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        blocks: std::sync::Mutex<Vec<BlockRecord>>,
        transactions: std::sync::Mutex<Vec<TransactionRecord>>,
    }

    impl MemoryStore {
        fn block_at(&self, number: i64) -> Vec<BlockRecord> {
            self.blocks
                .lock()
                .unwrap()
                .iter()
                .filter(|b| b.block_number == number)
                .cloned()
                .collect()
        }

        fn seed(&self, records: &[BlockRecord]) {
            self.blocks.lock().unwrap().extend_from_slice(records);
        }

        fn tx_count(&self) -> usize {
            self.transactions.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ChainStore for MemoryStore {
        async fn latest_canonical_block(&self) -> ScanResult<Option<BlockRecord>> {
            Ok(self
                .blocks
                .lock()
                .unwrap()
                .iter()
                .filter(|b| !b.fork)
                .max_by_key(|b| (b.create_time, b.block_number))
                .cloned())
        }

        async fn block_by_hash(&self, hash: &str) -> ScanResult<Option<BlockRecord>> {
            Ok(self
                .blocks
                .lock()
                .unwrap()
                .iter()
                .find(|b| b.block_hash == hash)
                .cloned())
        }

        async fn insert_block_if_absent(&self, block: &BlockRecord) -> ScanResult<()> {
            let mut blocks = self.blocks.lock().unwrap();
            if !blocks.iter().any(|b| b.block_hash == block.block_hash) {
                blocks.push(block.clone());
            }
            Ok(())
        }

        async fn commit_block(
            &self,
            block: &BlockRecord,
            transactions: &[TransactionRecord],
        ) -> ScanResult<()> {
            {
                let mut blocks = self.blocks.lock().unwrap();
                if let Some(existing) =
                    blocks.iter_mut().find(|b| b.block_hash == block.block_hash)
                {
                    existing.fork = false;
                } else {
                    blocks.push(block.clone());
                }
            }
            let mut persisted = self.transactions.lock().unwrap();
            for tx in transactions {
                if !persisted.iter().any(|t| t.tx_hash == tx.tx_hash) {
                    persisted.push(tx.clone());
                }
            }
            Ok(())
        }

        async fn mark_fork_range(&self, from_exclusive: i64, to_inclusive: i64) -> ScanResult<u64> {
            let mut flagged = 0;
            for block in self.blocks.lock().unwrap().iter_mut() {
                if block.block_number > from_exclusive
                    && block.block_number <= to_inclusive
                    && !block.fork
                {
                    block.fork = true;
                    flagged += 1;
                }
            }
            Ok(flagged)
        }
    }

    fn driver(
        gateway: Arc<MockGateway>,
        store: Arc<MemoryStore>,
    ) -> ScanDriver<MockGateway, MemoryStore> {
        ScanDriver {
            gateway,
            store,
            config: test_config(),
            metrics: None,
            state: ScanState::default(),
        }
    }

    #[tokio::test]
    async fn test_empty_store_seeds_from_tip() {
        let gateway = Arc::new(MockGateway::with_tip(100));
        gateway.serve(block(100, 1000, 999));
        let store = Arc::new(MemoryStore::default());
        let mut driver = driver(gateway, store.clone());

        driver.resume(&CancellationToken::new()).await.unwrap();

        assert_eq!(driver.state.cursor, 101);
        let last = driver.state.last_accepted.unwrap();
        assert_eq!(last.number, 100);
        assert_eq!(last.hash, hex(1000));
        // The tip block is persisted so later ancestor walks can terminate.
        assert_eq!(store.block_at(100).len(), 1);
        assert_eq!(store.tx_count(), 1);
    }

    #[tokio::test]
    async fn test_resume_does_not_refetch_history() {
        let gateway = Arc::new(MockGateway::with_tip(60));
        let store = Arc::new(MemoryStore::default());
        store.seed(&[block(50, 500, 499).to_record()]);
        let mut driver = driver(gateway.clone(), store);

        driver.resume(&CancellationToken::new()).await.unwrap();

        assert_eq!(driver.state.cursor, 51);
        assert_eq!(driver.state.last_accepted.unwrap().hash, hex(500));
        assert_eq!(gateway.height_fetches.load(Ordering::SeqCst), 0);
        assert_eq!(gateway.hash_fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sequential_blocks_chain_by_parent_hash() {
        let gateway = Arc::new(MockGateway::with_tip(52));
        gateway.serve(block(51, 510, 500));
        gateway.serve(block(52, 520, 510));
        let store = Arc::new(MemoryStore::default());
        store.seed(&[block(50, 500, 499).to_record()]);
        let mut driver = driver(gateway, store.clone());
        let cancel = CancellationToken::new();

        driver.resume(&cancel).await.unwrap();
        for _ in 0..2 {
            let outcome = driver.scan_step(&cancel).await.unwrap();
            assert!(matches!(outcome, StepOutcome::Accepted { .. }));
        }

        assert_eq!(driver.state.cursor, 53);
        let blocks = store.blocks.lock().unwrap().clone();
        let at = |n: i64| blocks.iter().find(|b| b.block_number == n).unwrap().clone();
        assert!(!at(51).fork);
        assert!(!at(52).fork);
        // No gap: each accepted block extends the previous one.
        assert_eq!(at(51).parent_hash, at(50).block_hash);
        assert_eq!(at(52).parent_hash, at(51).block_hash);
        assert_eq!(store.tx_count(), 2);
    }

    #[tokio::test]
    async fn test_rescan_of_same_block_is_idempotent() {
        let gateway = Arc::new(MockGateway::with_tip(51));
        gateway.serve(block(51, 510, 500));
        let store = Arc::new(MemoryStore::default());
        store.seed(&[block(50, 500, 499).to_record()]);
        let mut driver = driver(gateway, store.clone());
        let cancel = CancellationToken::new();

        driver.resume(&cancel).await.unwrap();
        let outcome = driver.scan_step(&cancel).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Accepted { .. }));

        // Feed the same height again: same hash re-confirms the last
        // accepted block, must not be classified as a fork and must not
        // duplicate transaction rows.
        driver.state.cursor = 51;
        let outcome = driver.scan_step(&cancel).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Accepted { .. }));

        assert_eq!(store.block_at(51).len(), 1);
        assert_eq!(store.tx_count(), 1);
        assert_eq!(driver.state.cursor, 52);
    }

    #[tokio::test]
    async fn test_fork_flags_every_height_above_the_ancestor() {
        // Persisted canonical chain at heights 50, 51, 52; the node now
        // serves a different block at 51 whose parent walk lands on 50.
        let gateway = Arc::new(MockGateway::with_tip(52));
        let store = Arc::new(MemoryStore::default());
        store.seed(&[
            block(50, 500, 499).to_record(),
            block(51, 510, 500).to_record(),
            block(52, 520, 510).to_record(),
        ]);
        // New branch: 51' descends directly from the stored block 50.
        gateway.serve(block(51, 511, 500));

        let mut driver = driver(gateway, store.clone());
        let cancel = CancellationToken::new();
        driver.resume(&cancel).await.unwrap();
        assert_eq!(driver.state.cursor, 53);

        // The node reorganized below the cursor; replay height 51.
        driver.state.cursor = 51;
        let outcome = driver.scan_step(&cancel).await.unwrap();
        assert_eq!(
            outcome,
            StepOutcome::ForkDetected {
                fork_point: 50,
                flagged: 3
            }
        );

        let blocks = store.blocks.lock().unwrap().clone();
        let by_hash = |h: String| blocks.iter().find(|b| b.block_hash == h).unwrap().clone();
        assert!(!by_hash(hex(500)).fork);
        assert!(by_hash(hex(510)).fork);
        assert!(by_hash(hex(520)).fork);
        // The freshly observed divergent block is flagged too until it is
        // re-accepted from the corrected cursor.
        assert!(by_hash(hex(511)).fork);

        // Resynchronization lands on the fork point.
        driver.resume(&cancel).await.unwrap();
        assert_eq!(driver.state.last_accepted.clone().unwrap().hash, hex(500));
        assert_eq!(driver.state.cursor, 51);

        // Re-accepting the replacement block clears its fork flag.
        let outcome = driver.scan_step(&cancel).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Accepted { .. }));
        let blocks = store.blocks.lock().unwrap().clone();
        let replayed = blocks.iter().find(|b| b.block_hash == hex(511)).unwrap();
        assert!(!replayed.fork);
    }

    #[tokio::test]
    async fn test_fork_walk_fetches_ancestors_from_node() {
        // Store only has heights <= 50; the new branch diverges at 49, so
        // the walk must go through the gateway until it finds a stored hash.
        let gateway = Arc::new(MockGateway::with_tip(51));
        let store = Arc::new(MemoryStore::default());
        store.seed(&[
            block(49, 490, 489).to_record(),
            block(50, 500, 490).to_record(),
        ]);
        gateway.serve(block(51, 515, 505));
        gateway.serve_by_hash(block(50, 505, 490));

        let mut driver = driver(gateway.clone(), store.clone());
        let cancel = CancellationToken::new();
        driver.resume(&cancel).await.unwrap();

        let outcome = driver.scan_step(&cancel).await.unwrap();
        assert_eq!(
            outcome,
            StepOutcome::ForkDetected {
                fork_point: 49,
                flagged: 2
            }
        );
        assert!(gateway.hash_fetches.load(Ordering::SeqCst) >= 1);

        let blocks = store.blocks.lock().unwrap().clone();
        let stale = blocks.iter().find(|b| b.block_hash == hex(500)).unwrap();
        assert!(stale.fork);
        let ancestor = blocks.iter().find(|b| b.block_hash == hex(490)).unwrap();
        assert!(!ancestor.fork);
    }

    #[tokio::test]
    async fn test_backpressure_never_fetches_ahead_of_tip() {
        let gateway = Arc::new(MockGateway::with_tip(50));
        let store = Arc::new(MemoryStore::default());
        store.seed(&[block(50, 500, 499).to_record()]);
        let mut driver = driver(gateway.clone(), store);
        let cancel = CancellationToken::new();
        driver.resume(&cancel).await.unwrap();
        assert_eq!(driver.state.cursor, 51);

        // Tip is behind the cursor: the step waits without a single
        // fetch-by-height call until cancelled.
        let canceller = cancel.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(25)).await;
            canceller.cancel();
        });
        let outcome = driver.scan_step(&cancel).await.unwrap();
        assert_eq!(outcome, StepOutcome::Interrupted);
        assert_eq!(gateway.height_fetches.load(Ordering::SeqCst), 0);

        // Once the tip catches up the same cursor is fetched.
        gateway.tip.store(51, Ordering::SeqCst);
        gateway.serve(block(51, 510, 500));
        let cancel = CancellationToken::new();
        let outcome = driver.scan_step(&cancel).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Accepted { height: 51, .. }));
        assert_eq!(gateway.height_fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_bounded_retry_times_out_distinguishably() {
        // Height 51 is known to the tip but its body never materializes.
        let gateway = Arc::new(MockGateway::with_tip(51));
        let store = Arc::new(MemoryStore::default());
        store.seed(&[block(50, 500, 499).to_record()]);
        let mut driver = driver(gateway, store);
        let cancel = CancellationToken::new();
        driver.resume(&cancel).await.unwrap();

        let err = driver.scan_step(&cancel).await.unwrap_err();
        assert!(matches!(err, ScanError::RetryTimeout { .. }));
        assert!(!err.is_fatal());
        // State unchanged: the step is safely retried from the same cursor.
        assert_eq!(driver.state.cursor, 51);
    }

    #[tokio::test]
    async fn test_unresolvable_fork_is_fatal() {
        let gateway = Arc::new(MockGateway::with_tip(51));
        let store = Arc::new(MemoryStore::default());
        store.seed(&[block(50, 500, 499).to_record()]);
        // A divergent block whose ancestry never reaches a stored hash.
        gateway.serve(block(51, 600, 601));
        for tag in 601..=610 {
            gateway.serve_by_hash(block(50, tag, tag + 1));
        }

        let mut driver = driver(gateway, store);
        driver.config.max_ancestor_depth = 4;
        let cancel = CancellationToken::new();
        driver.resume(&cancel).await.unwrap();

        let err = driver.scan_step(&cancel).await.unwrap_err();
        assert!(matches!(err, ScanError::ForkUnresolvable { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_repeated_fork_without_repair_is_fatal() {
        // The divergent block's ancestry resolves to the stored block 50,
        // but its direct parent never becomes canonical: every pass
        // re-detects the identical fork. The second pass repairs nothing
        // and must halt instead of spinning.
        let gateway = Arc::new(MockGateway::with_tip(51));
        let store = Arc::new(MemoryStore::default());
        store.seed(&[block(50, 500, 499).to_record()]);
        gateway.serve(block(51, 511, 512));
        gateway.serve_by_hash(block(51, 512, 500));

        let mut driver = driver(gateway, store);
        let cancel = CancellationToken::new();
        driver.resume(&cancel).await.unwrap();

        let outcome = driver.scan_step(&cancel).await.unwrap();
        assert_eq!(
            outcome,
            StepOutcome::ForkDetected {
                fork_point: 50,
                flagged: 1
            }
        );

        driver.resume(&cancel).await.unwrap();
        assert_eq!(driver.state.cursor, 51);

        let err = driver.scan_step(&cancel).await.unwrap_err();
        assert!(matches!(err, ScanError::ForkStalled { cursor: 51 }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_start_is_exclusive_and_stop_requires_start() {
        let gateway = Arc::new(MockGateway::with_tip(50));
        let store = Arc::new(MemoryStore::default());
        store.seed(&[block(50, 500, 499).to_record()]);
        let scanner = ChainScanner::new(gateway, store, test_config()).unwrap();

        // Usage error: stop before start.
        assert!(matches!(
            scanner.stop().await.unwrap_err(),
            ScanError::NotRunning
        ));

        scanner.start().await.unwrap();
        assert!(scanner.is_running().await);
        assert!(matches!(
            scanner.start().await.unwrap_err(),
            ScanError::AlreadyRunning
        ));

        let task = scanner.stop().await.unwrap();
        task.await.unwrap();
        assert!(!scanner.is_running().await);
        assert!(matches!(
            scanner.stop().await.unwrap_err(),
            ScanError::NotRunning
        ));
    }

    #[tokio::test]
    async fn test_loop_accepts_blocks_end_to_end() {
        let gateway = Arc::new(MockGateway::with_tip(52));
        gateway.serve(block(51, 510, 500));
        gateway.serve(block(52, 520, 510));
        let store = Arc::new(MemoryStore::default());
        store.seed(&[block(50, 500, 499).to_record()]);
        let scanner =
            ChainScanner::new(gateway, store.clone(), test_config()).unwrap();

        scanner.start().await.unwrap();
        // Two short scan intervals are enough for both heights.
        for _ in 0..100 {
            time::sleep(Duration::from_millis(5)).await;
            if store.block_at(52).len() == 1 {
                break;
            }
        }
        let task = scanner.stop().await.unwrap();
        task.await.unwrap();

        assert_eq!(store.block_at(51).len(), 1);
        assert_eq!(store.block_at(52).len(), 1);
    }
}
