use crate::blob_store::BlobStore;
use crate::config::GatewayConfig;
use crate::metrics::GatewayMetrics;
use crate::pool::ProviderPool;
use crate::quota::QuotaManager;
use crate::registry::ProviderRegistry;
use reqwest::Client;
use std::sync::Arc;

#[derive(Clone)]
pub struct GatewayState {
    pub blob: Arc<dyn BlobStore>,
    pub registry: ProviderRegistry,
    pub quota: Arc<QuotaManager>,
    pub pool: Arc<ProviderPool>,
    pub metrics: Arc<GatewayMetrics>,
    pub config: Arc<GatewayConfig>,
    pub http_client: Client,
}

impl GatewayState {
    pub fn record_dispatch_metrics(&self, kind: &str, outcome: &str) {
        self.metrics.record_dispatch_outcome(kind, outcome);
    }
}
