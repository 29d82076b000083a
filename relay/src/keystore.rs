// Copyright (c) Eth Relay Contributors
// SPDX-License-Identifier: Apache-2.0

//! Credential store for the submission path.
//!
//! Owns a directory of encrypted V3 keystore files plus an in-memory map of
//! unlocked signers. Passed explicitly to the transfer service; the scanner
//! never sees signing capability.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use ethers::signers::{LocalWallet, Signer};
use ethers::types::Address;
use tokio::sync::RwLock;
use tracing::info;

use crate::error::{RelayError, RelayResult};

const MIN_PASSWORD_LEN: usize = 6;

pub struct Keystore {
    dir: PathBuf,
    unlocked: RwLock<HashMap<Address, LocalWallet>>,
}

impl Keystore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            unlocked: RwLock::new(HashMap::new()),
        }
    }

    /// Generate a new key, encrypt it under `password` and write the V3
    /// keystore file. Returns the new account address; the account is not
    /// unlocked.
    pub fn create_account(&self, password: &str) -> RelayResult<Address> {
        if password.is_empty() {
            return Err(RelayError::InvalidPassword("password must not be empty"));
        }
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(RelayError::InvalidPassword(
                "password must be at least 6 characters",
            ));
        }
        std::fs::create_dir_all(&self.dir).map_err(|e| RelayError::Keystore(e.to_string()))?;

        let mut rng = rand::thread_rng();
        let (wallet, _uuid) = LocalWallet::new_keystore(&self.dir, &mut rng, password, None)
            .map_err(|e| RelayError::Keystore(e.to_string()))?;
        info!(address = ?wallet.address(), "created keystore account");
        Ok(wallet.address())
    }

    /// Decrypt the keystore file for `address` and keep the signer in
    /// memory until [`Keystore::lock`].
    pub async fn unlock(&self, address: Address, password: &str) -> RelayResult<()> {
        let path = self.find_key_file(address)?;
        let wallet = LocalWallet::decrypt_keystore(&path, password)
            .map_err(|e| RelayError::Keystore(format!("failed to decrypt key for {address:?}: {e}")))?;
        self.unlocked.write().await.insert(address, wallet);
        info!(address = ?address, "account unlocked");
        Ok(())
    }

    /// Unlock directly from a raw hex private key, bypassing the key files.
    pub async fn unlock_with_private_key(&self, private_key_hex: &str) -> RelayResult<Address> {
        let wallet: LocalWallet = private_key_hex
            .parse()
            .map_err(|e| RelayError::Keystore(format!("invalid private key: {e}")))?;
        let address = wallet.address();
        self.unlocked.write().await.insert(address, wallet);
        Ok(address)
    }

    pub async fn lock(&self, address: Address) {
        self.unlocked.write().await.remove(&address);
    }

    pub async fn signer(&self, address: Address) -> Option<LocalWallet> {
        self.unlocked.read().await.get(&address).cloned()
    }

    /// V3 keystore files carry their address in the JSON body; scan the
    /// directory for the matching one.
    fn find_key_file(&self, address: Address) -> RelayResult<PathBuf> {
        let entries =
            std::fs::read_dir(&self.dir).map_err(|e| RelayError::Keystore(e.to_string()))?;
        let wanted = hex::encode(address.as_bytes());
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if file_address(&path).is_some_and(|a| a.eq_ignore_ascii_case(&wanted)) {
                return Ok(path);
            }
        }
        Err(RelayError::Keystore(format!(
            "no keystore file for {address:?} in {}",
            self.dir.display()
        )))
    }
}

fn file_address(path: &Path) -> Option<String> {
    let contents = std::fs::read_to_string(path).ok()?;
    let json: serde_json::Value = serde_json::from_str(&contents).ok()?;
    let address = json.get("address")?.as_str()?;
    Some(address.trim_start_matches("0x").to_string())
}
