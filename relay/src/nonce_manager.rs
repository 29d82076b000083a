// Copyright (c) Eth Relay Contributors
// SPDX-License-Identifier: Apache-2.0

//! Address-keyed next-nonce cache for transaction submission.
//!
//! Avoids a node round trip per send, at the cost of going stale if
//! transactions are sent by any channel other than this process. Never
//! persisted: a restart re-seeds from the node's pending-nonce query.
//!
//! Explicitly constructed and injected into the submission path. Each
//! address owns an entry lock; the submission path holds it across
//! fetch-nonce → sign → broadcast → increment, so concurrent sends for one
//! address serialize while different addresses proceed independently.

use std::collections::HashMap;
use std::sync::Arc;

use ethers::types::Address;
use tokio::sync::Mutex;

type NonceSlot = Arc<Mutex<Option<u64>>>;

#[derive(Default)]
pub struct NonceManager {
    entries: Mutex<HashMap<Address, NonceSlot>>,
}

impl NonceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lockable slot for `address`, created empty on first use.
    pub async fn entry(&self, address: Address) -> NonceSlot {
        self.entries
            .lock()
            .await
            .entry(address)
            .or_default()
            .clone()
    }

    pub async fn get(&self, address: Address) -> Option<u64> {
        *self.entry(address).await.lock().await
    }

    pub async fn set(&self, address: Address, nonce: u64) {
        *self.entry(address).await.lock().await = Some(nonce);
    }

    /// Add one to the cached nonce; no-op if the address was never seeded.
    pub async fn increment(&self, address: Address) {
        let slot = self.entry(address).await;
        let mut guard = slot.lock().await;
        if let Some(nonce) = guard.as_mut() {
            *nonce = nonce.saturating_add(1);
        }
    }
}
