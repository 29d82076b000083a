// Copyright (c) Eth Relay Contributors
// SPDX-License-Identifier: Apache-2.0

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::chain_scanner::{RetryConfig, ScannerConfig};

/// Load/save helper for config structs. YAML or JSON, decided by the file
/// extension.
pub trait Config: Serialize + DeserializeOwned {
    fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Self = if matches!(
            path.extension().and_then(|s| s.to_str()),
            Some("yaml") | Some("yml")
        ) {
            serde_yaml::from_str(&content)?
        } else {
            serde_json::from_str(&content)?
        };
        Ok(config)
    }

    fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct EthConfig {
    // Rpc url for the Eth fullnode, used for queries and submission.
    pub eth_rpc_url: String,
    // When set, the node refuses to start against a different chain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_chain_id: Option<u64>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct DbConfig {
    pub database_url: String,
    #[serde(default = "default_pool_size")]
    pub connection_pool_size: u32,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
}

fn default_pool_size() -> u32 {
    20
}

fn default_connection_timeout_ms() -> u64 {
    60_000
}

/// Scanner knobs, in milliseconds. `fetch-retry.max-elapsed-ms: null`
/// explicitly opts into retrying forever on "block not materialized yet".
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ScannerSettings {
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
    #[serde(default = "default_tip_poll_interval_ms")]
    pub tip_poll_interval_ms: u64,
    #[serde(default)]
    pub fetch_retry: RetrySettings,
    #[serde(default = "default_max_ancestor_depth")]
    pub max_ancestor_depth: u32,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RetrySettings {
    #[serde(default = "default_retry_initial_ms")]
    pub initial_interval_ms: u64,
    #[serde(default = "default_retry_max_interval_ms")]
    pub max_interval_ms: u64,
    #[serde(default = "default_retry_max_elapsed_ms")]
    pub max_elapsed_ms: Option<u64>,
}

fn default_scan_interval_ms() -> u64 {
    1_000
}

fn default_tip_poll_interval_ms() -> u64 {
    4_000
}

fn default_max_ancestor_depth() -> u32 {
    4_096
}

fn default_retry_initial_ms() -> u64 {
    400
}

fn default_retry_max_interval_ms() -> u64 {
    8_000
}

fn default_retry_max_elapsed_ms() -> Option<u64> {
    Some(300_000)
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            scan_interval_ms: default_scan_interval_ms(),
            tip_poll_interval_ms: default_tip_poll_interval_ms(),
            fetch_retry: RetrySettings::default(),
            max_ancestor_depth: default_max_ancestor_depth(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_retry_initial_ms(),
            max_interval_ms: default_retry_max_interval_ms(),
            max_elapsed_ms: default_retry_max_elapsed_ms(),
        }
    }
}

impl ScannerSettings {
    pub fn to_scanner_config(&self) -> ScannerConfig {
        ScannerConfig {
            scan_interval: Duration::from_millis(self.scan_interval_ms),
            tip_poll_interval: Duration::from_millis(self.tip_poll_interval_ms),
            fetch_retry: RetryConfig {
                initial_interval: Duration::from_millis(self.fetch_retry.initial_interval_ms),
                max_interval: Duration::from_millis(self.fetch_retry.max_interval_ms),
                max_elapsed: self.fetch_retry.max_elapsed_ms.map(Duration::from_millis),
            },
            max_ancestor_depth: self.max_ancestor_depth,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RelayNodeConfig {
    // The port for the metrics endpoint.
    pub metrics_port: u16,
    // Directory holding encrypted V3 keystore files.
    pub keystore_dir: PathBuf,
    pub db: DbConfig,
    pub eth: EthConfig,
    #[serde(default)]
    pub scanner: ScannerSettings,
}

impl Config for RelayNodeConfig {}
