// Copyright (c) Eth Relay Contributors
// SPDX-License-Identifier: Apache-2.0

//! Reorg-aware chain ingestion.
//!
//! The scanner owns a persisted cursor and advances it block-by-block:
//!
//! ```text
//!            ┌────────────────────────────────┐
//!            │  ChainScanner                  │
//!            │  - cursor / last accepted      │
//!            │  - fork detection              │
//!            │  - ancestor walk + repair      │
//!            └──────┬──────────────────┬──────┘
//!                   │                  │
//!                   ▼                  ▼
//!            NodeGateway          ChainStore
//!          (JSON-RPC node)       (PostgreSQL)
//! ```
//!
//! Fork handling: each fetched block is compared against the last accepted
//! one. On divergence the scanner walks parent hashes backwards (through the
//! store, then the node) until it finds a block the store already has, the
//! fork point, then flags every persisted block above it and resynchronizes
//! from the corrected history.

mod config;
mod scanner;
mod types;

pub use config::{RetryConfig, ScannerConfig};
pub use scanner::ChainScanner;
pub use types::{BlockHead, ChainStore, FullBlock, NodeGateway, ScanError, ScanResult, StepOutcome};
