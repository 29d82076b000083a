// Copyright (c) Eth Relay Contributors
// SPDX-License-Identifier: Apache-2.0

//! PostgreSQL implementation of the persisted chain store.
//!
//! The scanner is the only writer of these tables; readers get their
//! consistency from PostgreSQL transaction isolation, not from the scanner.

use async_trait::async_trait;
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl};
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};

use eth_relay_pg_db::Db;
use eth_relay_schema::models::{BlockRecord, TransactionRecord};
use eth_relay_schema::schema::{blocks, transactions};

use crate::chain_scanner::{ChainStore, ScanError, ScanResult};

#[derive(Clone)]
pub struct PgChainStore {
    db: Db,
}

impl PgChainStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Blocks with height in `[from, to]`, forked rows included, ordered by
    /// height.
    pub async fn blocks_in_range(&self, from: i64, to: i64) -> ScanResult<Vec<BlockRecord>> {
        let mut conn = self.db.connect().await.map_err(storage_err)?;
        blocks::table
            .filter(blocks::block_number.ge(from))
            .filter(blocks::block_number.le(to))
            .order(blocks::block_number.asc())
            .load(&mut conn)
            .await
            .map_err(storage_err)
    }

    /// Transactions of one block, in block order.
    pub async fn transactions_by_block(
        &self,
        block_hash: &str,
    ) -> ScanResult<Vec<TransactionRecord>> {
        let mut conn = self.db.connect().await.map_err(storage_err)?;
        transactions::table
            .filter(transactions::block_hash.eq(block_hash))
            .order(transactions::tx_index.asc())
            .load(&mut conn)
            .await
            .map_err(storage_err)
    }
}

#[async_trait]
impl ChainStore for PgChainStore {
    async fn latest_canonical_block(&self) -> ScanResult<Option<BlockRecord>> {
        let mut conn = self.db.connect().await.map_err(storage_err)?;
        blocks::table
            .filter(blocks::fork.eq(false))
            .order(blocks::create_time.desc())
            .first(&mut conn)
            .await
            .optional()
            .map_err(storage_err)
    }

    async fn block_by_hash(&self, hash: &str) -> ScanResult<Option<BlockRecord>> {
        let mut conn = self.db.connect().await.map_err(storage_err)?;
        blocks::table
            .filter(blocks::block_hash.eq(hash))
            .first(&mut conn)
            .await
            .optional()
            .map_err(storage_err)
    }

    async fn insert_block_if_absent(&self, block: &BlockRecord) -> ScanResult<()> {
        let mut conn = self.db.connect().await.map_err(storage_err)?;
        diesel::insert_into(blocks::table)
            .values(block)
            .on_conflict_do_nothing()
            .execute(&mut conn)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn commit_block(
        &self,
        block: &BlockRecord,
        txs: &[TransactionRecord],
    ) -> ScanResult<()> {
        let mut conn = self.db.connect().await.map_err(storage_err)?;
        let txs = txs.to_vec();
        conn.transaction::<_, diesel::result::Error, _>(|conn| {
            async move {
                // Re-accepting a height after a repair clears a stale fork
                // flag on the surviving row.
                diesel::insert_into(blocks::table)
                    .values(block)
                    .on_conflict(blocks::block_hash)
                    .do_update()
                    .set(blocks::fork.eq(false))
                    .execute(conn)
                    .await?;

                if !txs.is_empty() {
                    diesel::insert_into(transactions::table)
                        .values(txs)
                        .on_conflict_do_nothing()
                        .execute(conn)
                        .await?;
                }
                Ok(())
            }
            .scope_boxed()
        })
        .await
        .map_err(storage_err)
    }

    async fn mark_fork_range(&self, from_exclusive: i64, to_inclusive: i64) -> ScanResult<u64> {
        let mut conn = self.db.connect().await.map_err(storage_err)?;
        let flagged = diesel::update(
            blocks::table
                .filter(blocks::block_number.gt(from_exclusive))
                .filter(blocks::block_number.le(to_inclusive))
                .filter(blocks::fork.eq(false)),
        )
        .set(blocks::fork.eq(true))
        .execute(&mut conn)
        .await
        .map_err(storage_err)?;
        Ok(flagged as u64)
    }
}

fn storage_err<E: std::fmt::Display>(err: E) -> ScanError {
    ScanError::Storage(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use eth_relay_pg_db::DbArgs;
    use url::Url;

    fn record(number: i64, hash: &str, parent: &str) -> BlockRecord {
        BlockRecord {
            block_hash: hash.to_string(),
            parent_hash: parent.to_string(),
            block_number: number,
            create_time: 1_700_000_000 + number,
            fork: false,
        }
    }

    #[tokio::test]
    #[ignore] // Requires TEST_DATABASE_URL environment variable
    async fn test_store_round_trip() {
        let database_url = std::env::var("TEST_DATABASE_URL")
            .expect("TEST_DATABASE_URL environment variable must be set");
        let url: Url = database_url.parse().expect("Invalid database URL format");
        let db = Db::for_write(url, DbArgs::default())
            .await
            .expect("Failed to connect to database");
        db.run_migrations(&eth_relay_schema::MIGRATIONS)
            .await
            .expect("Failed to run migrations");

        let store = PgChainStore::new(db);

        let block = record(1, "0xaa", "0x00");
        let tx = TransactionRecord {
            tx_hash: "0xt1".to_string(),
            nonce: 0,
            block_hash: block.block_hash.clone(),
            block_number: block.block_number,
            tx_index: 0,
            from_address: "0xf".to_string(),
            to_address: Some("0xd".to_string()),
            value: "1000".to_string(),
            gas_price: "5".to_string(),
            gas_limit: "21000".to_string(),
            input: "0x".to_string(),
        };
        store
            .commit_block(&block, std::slice::from_ref(&tx))
            .await
            .unwrap();
        // Committing the same block twice must not duplicate rows.
        store
            .commit_block(&block, std::slice::from_ref(&tx))
            .await
            .unwrap();

        let latest = store.latest_canonical_block().await.unwrap().unwrap();
        assert_eq!(latest.block_hash, "0xaa");
        assert_eq!(store.transactions_by_block("0xaa").await.unwrap().len(), 1);

        let next = record(2, "0xbb", "0xaa");
        store.commit_block(&next, &[]).await.unwrap();
        let flagged = store.mark_fork_range(1, 2).await.unwrap();
        assert_eq!(flagged, 1);
        let latest = store.latest_canonical_block().await.unwrap().unwrap();
        assert_eq!(latest.block_hash, "0xaa");
    }
}
