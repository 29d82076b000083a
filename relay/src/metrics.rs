// Copyright (c) Eth Relay Contributors
// SPDX-License-Identifier: Apache-2.0

use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_with_registry, HistogramVec,
    IntCounter, IntCounterVec, IntGauge, Registry,
};

const LATENCY_SEC_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10., 30., 60., 120.,
];

#[derive(Debug)]
pub struct RelayMetrics {
    pub(crate) last_scanned_block: IntGauge,
    pub(crate) scanned_transactions: IntCounter,
    pub(crate) chain_forks_detected: IntCounter,
    pub(crate) fork_blocks_flagged: IntCounter,
    pub(crate) scan_step_errors: IntCounterVec,

    pub(crate) eth_rpc_queries: IntCounterVec,
    pub(crate) eth_rpc_queries_latency: HistogramVec,

    pub(crate) transfers_submitted: IntCounter,
}

impl RelayMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            last_scanned_block: register_int_gauge_with_registry!(
                "relay_last_scanned_block",
                "Height of the most recently accepted block",
                registry,
            )
            .unwrap(),
            scanned_transactions: register_int_counter_with_registry!(
                "relay_scanned_transactions",
                "Total number of transactions persisted by the scanner",
                registry,
            )
            .unwrap(),
            chain_forks_detected: register_int_counter_with_registry!(
                "relay_chain_forks_detected",
                "Total number of chain reorganizations detected",
                registry,
            )
            .unwrap(),
            fork_blocks_flagged: register_int_counter_with_registry!(
                "relay_fork_blocks_flagged",
                "Total number of persisted blocks flagged as forked",
                registry,
            )
            .unwrap(),
            scan_step_errors: register_int_counter_vec_with_registry!(
                "relay_scan_step_errors",
                "Total number of failed scan steps by error type",
                &["type"],
                registry,
            )
            .unwrap(),
            eth_rpc_queries: register_int_counter_vec_with_registry!(
                "relay_eth_rpc_queries",
                "Total number of RPC queries by method",
                &["method"],
                registry,
            )
            .unwrap(),
            eth_rpc_queries_latency: register_histogram_vec_with_registry!(
                "relay_eth_rpc_queries_latency",
                "RPC query latency in seconds by method",
                &["method"],
                LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            transfers_submitted: register_int_counter_with_registry!(
                "relay_transfers_submitted",
                "Total number of raw transactions broadcast",
                registry,
            )
            .unwrap(),
        }
    }

    pub fn new_for_testing() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::new(&Registry::new()))
    }
}
