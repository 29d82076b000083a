// Copyright (c) Eth Relay Contributors
// SPDX-License-Identifier: Apache-2.0

//! HTTP JSON-RPC transport that records per-method query counts and
//! latencies before delegating to the plain `Http` client.

use std::fmt::Debug;
use std::sync::Arc;

use ethers::providers::{Http, HttpClientError, JsonRpcClient, Provider};
use serde::{de::DeserializeOwned, Serialize};
use url::Url;

use crate::metrics::RelayMetrics;

#[derive(Debug, Clone)]
pub struct MeteredHttpProvider {
    inner: Http,
    metrics: Arc<RelayMetrics>,
}

impl MeteredHttpProvider {
    pub fn new(url: Url, metrics: Arc<RelayMetrics>) -> Self {
        Self {
            inner: Http::new(url),
            metrics,
        }
    }
}

#[async_trait::async_trait]
impl JsonRpcClient for MeteredHttpProvider {
    type Error = HttpClientError;

    async fn request<T: Serialize + Send + Sync + Debug, R: DeserializeOwned + Send>(
        &self,
        method: &str,
        params: T,
    ) -> Result<R, HttpClientError> {
        self.metrics
            .eth_rpc_queries
            .with_label_values(&[method])
            .inc();
        let _guard = self
            .metrics
            .eth_rpc_queries_latency
            .with_label_values(&[method])
            .start_timer();
        self.inner.request(method, params).await
    }
}

pub fn new_metered_eth_provider(
    url: &str,
    metrics: Arc<RelayMetrics>,
) -> anyhow::Result<Provider<MeteredHttpProvider>> {
    let url: Url = url
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid rpc url {url:?}: {e}"))?;
    Ok(Provider::new(MeteredHttpProvider::new(url, metrics)))
}
