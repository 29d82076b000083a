// Copyright (c) Eth Relay Contributors
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use backoff::ExponentialBackoff;

/// Retry policy for fetches of blocks the node has not materialized yet.
///
/// `max_elapsed: None` retries forever, trusting eventual node consistency;
/// a bounded policy surfaces a distinguishable
/// [`super::ScanError::RetryTimeout`] instead of looping.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub max_elapsed: Option<Duration>,
}

impl RetryConfig {
    pub fn unbounded() -> Self {
        Self {
            max_elapsed: None,
            ..Default::default()
        }
    }

    pub(crate) fn to_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_interval,
            randomization_factor: 0.1,
            multiplier: 2.0,
            max_interval: self.max_interval,
            max_elapsed_time: self.max_elapsed,
            ..Default::default()
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(400),
            max_interval: Duration::from_secs(8),
            max_elapsed: Some(Duration::from_secs(300)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Pause between scan steps.
    pub scan_interval: Duration,
    /// Poll period while the remote tip is behind the cursor.
    pub tip_poll_interval: Duration,
    /// Retry policy for "block not materialized yet" fetches.
    pub fetch_retry: RetryConfig,
    /// Upper bound on the ancestor walk during fork resolution.
    pub max_ancestor_depth: u32,
}

impl ScannerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.scan_interval.is_zero() {
            return Err("scan_interval must be non-zero".to_string());
        }
        if self.tip_poll_interval.is_zero() {
            return Err("tip_poll_interval must be non-zero".to_string());
        }
        if self.fetch_retry.initial_interval.is_zero() {
            return Err("fetch_retry.initial_interval must be non-zero".to_string());
        }
        if self.max_ancestor_depth == 0 {
            return Err("max_ancestor_depth must be at least 1".to_string());
        }
        Ok(())
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(1),
            tip_poll_interval: Duration::from_secs(4),
            fetch_retry: RetryConfig::default(),
            max_ancestor_depth: 4096,
        }
    }
}
