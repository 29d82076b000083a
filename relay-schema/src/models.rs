// Copyright (c) Eth Relay Contributors
// SPDX-License-Identifier: Apache-2.0

//! Row models for the chain store tables.

use diesel::prelude::*;

/// One persisted block. Identified by its hash; at most one row per height
/// carries `fork = false` once the chain has converged. Forked rows are kept
/// as history, never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Queryable, Insertable)]
#[diesel(table_name = crate::schema::blocks)]
pub struct BlockRecord {
    /// 0x-prefixed lowercase hex, unique.
    pub block_hash: String,
    pub parent_hash: String,
    pub block_number: i64,
    /// Block timestamp, seconds since epoch.
    pub create_time: i64,
    /// Set in bulk when a later reorg invalidates this row.
    pub fork: bool,
}

/// One persisted transaction, written in the same database transaction as
/// its containing block. Value and gas fields are decimal strings since
/// they can exceed the range of `i64`.
#[derive(Debug, Clone, PartialEq, Eq, Queryable, Insertable)]
#[diesel(table_name = crate::schema::transactions)]
pub struct TransactionRecord {
    pub tx_hash: String,
    pub nonce: i64,
    pub block_hash: String,
    pub block_number: i64,
    pub tx_index: i32,
    pub from_address: String,
    /// None for contract creation.
    pub to_address: Option<String>,
    pub value: String,
    pub gas_price: String,
    pub gas_limit: String,
    /// 0x-prefixed hex calldata.
    pub input: String,
}
