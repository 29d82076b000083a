// Copyright (c) Eth Relay Contributors
// SPDX-License-Identifier: Apache-2.0

/// Errors surfaced by the lookup and submission paths. The scanner has its
/// own taxonomy in [`crate::chain_scanner::ScanError`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum RelayError {
    #[error("invalid ethereum address: {0}")]
    InvalidAddress(String),

    #[error("invalid amount {0:?}: {1}")]
    InvalidAmount(String, String),

    #[error("invalid password: {0}")]
    InvalidPassword(&'static str),

    #[error("keystore error: {0}")]
    Keystore(String),

    #[error("account {0} is not unlocked")]
    AccountLocked(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("transaction signing failed: {0}")]
    Signing(String),
}

impl RelayError {
    /// Short identifier for metrics labels.
    pub fn error_type(&self) -> &'static str {
        match self {
            RelayError::InvalidAddress(_) => "invalid_address",
            RelayError::InvalidAmount(_, _) => "invalid_amount",
            RelayError::InvalidPassword(_) => "invalid_password",
            RelayError::Keystore(_) => "keystore_error",
            RelayError::AccountLocked(_) => "account_locked",
            RelayError::Provider(_) => "provider_error",
            RelayError::Signing(_) => "signing_error",
        }
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
