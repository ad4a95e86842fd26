//! Discovers accounts, keeps a rotating list of [`AccountProvider`]s warm,
//! and walks that list on every dispatch classifying the aggregate outcome
//! into the gateway's HTTP response shape.

use crate::account_provider::{AccountProvider, ChatResponse, DispatchFailure, SearchResponse};
use crate::auth_manager::AuthManager;
use crate::blob_store::BlobStore;
use crate::credential::canonicalize_key;
use crate::deferred::DeferredWork;
use crate::metrics::GatewayMetrics;
use crate::quota::{Kind, QuotaManager};
use crate::registry::ProviderRegistry;
use common_http_errors::ApiError;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

const DEFAULT_SCAN_INTERVAL_MS: i64 = 30_000;
const MIN_SCAN_INTERVAL_MS: i64 = 5_000;

struct Walk<T> {
    success: Option<T>,
    attempted: u32,
    auth_expired: u32,
    quota_exceeded: u32,
    rate_limited: u32,
    quota_blocked: u32,
    error_messages: Vec<String>,
}

impl<T> Walk<T> {
    fn new() -> Self {
        Self {
            success: None,
            attempted: 0,
            auth_expired: 0,
            quota_exceeded: 0,
            rate_limited: 0,
            quota_blocked: 0,
            error_messages: Vec::new(),
        }
    }

    fn record_failure(&mut self, failure: &DispatchFailure) {
        self.attempted += 1;
        match failure {
            DispatchFailure::AuthExpired => self.auth_expired += 1,
            DispatchFailure::QuotaExceeded => self.quota_exceeded += 1,
            DispatchFailure::RateLimited => self.rate_limited += 1,
            DispatchFailure::Upstream { .. } | DispatchFailure::Timeout => {}
        }
        self.error_messages.push(failure.message());
    }

    fn into_api_error(self, pool_size: usize) -> ApiError {
        if pool_size == 0 {
            return ApiError::NoProvidersConfigured;
        }
        if self.attempted == 0 {
            if self.quota_blocked > 0 && self.quota_blocked == (pool_size as u32) {
                return ApiError::AllRateLimited {
                    details: "all candidates blocked at admission".to_string(),
                };
            }
            return ApiError::NoAvailableProviders {
                details: "no provider accepted the request".to_string(),
                errors: self.error_messages,
            };
        }
        if self.auth_expired == self.attempted {
            return ApiError::AllUnauthorized {
                details: "re-login required in admin".to_string(),
            };
        }
        if self.rate_limited == self.attempted {
            return ApiError::AllRateLimited {
                details: "all attempted providers were rate limited".to_string(),
            };
        }
        if self.quota_exceeded == self.attempted {
            return ApiError::AllQuotaExceeded {
                details: "all attempted providers exhausted free-tier quota".to_string(),
            };
        }
        let last_detail = self.error_messages.last().cloned().unwrap_or_default();
        ApiError::AllFailed {
            details: last_detail,
            attempts: self.attempted,
            errors: self.error_messages,
        }
    }
}

pub struct ProviderPool {
    blob: Arc<dyn BlobStore>,
    registry: ProviderRegistry,
    http: reqwest::Client,
    client_id: String,
    default_base_url: String,
    static_ids: Vec<String>,
    scan_interval_ms: i64,
    full_scan_interval_ms: i64,
    providers: Mutex<Vec<Arc<AccountProvider>>>,
    current_index: AtomicUsize,
    last_scan_at_ms: AtomicUsize,
    last_full_scan_at_ms: Mutex<i64>,
    scan_lock: Mutex<()>,
    metrics: Option<Arc<GatewayMetrics>>,
}

impl ProviderPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        blob: Arc<dyn BlobStore>,
        registry: ProviderRegistry,
        http: reqwest::Client,
        client_id: String,
        default_base_url: String,
        static_ids: Vec<String>,
        scan_interval_secs: u64,
        full_scan_interval_minutes: u64,
    ) -> Self {
        Self {
            blob,
            registry,
            http,
            client_id,
            default_base_url,
            static_ids,
            scan_interval_ms: (scan_interval_secs as i64 * 1000).max(MIN_SCAN_INTERVAL_MS),
            full_scan_interval_ms: full_scan_interval_minutes as i64 * 60_000,
            providers: Mutex::new(Vec::new()),
            current_index: AtomicUsize::new(0),
            last_scan_at_ms: AtomicUsize::new(0),
            last_full_scan_at_ms: Mutex::new(0),
            scan_lock: Mutex::new(()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn provider_count(&self) -> usize {
        self.providers.lock().await.len()
    }

    pub async fn snapshot(&self) -> Vec<Arc<AccountProvider>> {
        self.providers.lock().await.clone()
    }

    async fn discover_light(&self) -> anyhow::Result<Vec<String>> {
        let mut ids: Vec<String> = self.registry.list().await?.into_iter().map(|r| r.id).collect();
        for static_id in &self.static_ids {
            if !ids.contains(static_id) {
                ids.push(static_id.clone());
            }
        }
        if ids.is_empty() {
            let healed = self.registry.self_heal_from_usage().await?;
            ids.extend(healed);
        }
        Ok(ids)
    }

    /// Deliberately expensive: a blob-store key scan is the most
    /// quota-sensitive dependency, so this only runs on cold bootstrap,
    /// explicit admin rescan, or a configured periodic interval.
    async fn discover_full(&self) -> anyhow::Result<Vec<String>> {
        let mut ids = self.discover_light().await?;
        for prefix in ["qwen_creds_", "oauth_creds_", "./qwen_creds_", "./oauth_creds_"] {
            let found = self.blob.list_prefix(prefix).await?;
            for raw in found {
                let canonical = canonicalize_key(&raw);
                if !ids.contains(&canonical) {
                    ids.push(canonical);
                }
            }
        }
        Ok(ids)
    }

    pub async fn ensure_fresh(&self) {
        let now_ms = now_ms();
        let last = self.last_scan_at_ms.load(Ordering::Relaxed) as i64;
        if now_ms - last <= self.scan_interval_ms {
            return;
        }
        self.rescan(false).await;
    }

    pub async fn rescan(&self, force_full: bool) {
        let _serialize = self.scan_lock.lock().await;
        let now_ms_val = now_ms();

        let cold_bootstrap = self.providers.lock().await.is_empty() && self.static_ids.is_empty();
        let periodic_full = self.full_scan_interval_ms > 0 && {
            let mut last_full = self.last_full_scan_at_ms.lock().await;
            let due = now_ms_val - *last_full > self.full_scan_interval_ms;
            if due {
                *last_full = now_ms_val;
            }
            due
        };

        let ids = if force_full || cold_bootstrap || periodic_full {
            self.discover_full().await
        } else {
            self.discover_light().await
        };

        let ids = match ids {
            Ok(ids) => ids,
            Err(err) => {
                warn!(?err, "provider discovery failed; keeping previous pool");
                return;
            }
        };

        self.apply_discovered_ids(ids).await;
        self.apply_alias_map().await;
        self.last_scan_at_ms.store(now_ms_val as usize, Ordering::Relaxed);
    }

    /// Step 5 of the refresh algorithm: the relational registry is the
    /// alias source of truth, so every rescan re-applies it to the in-memory
    /// runtime state rather than trusting whatever a credential's own
    /// (possibly stale) `alias` field says.
    pub async fn apply_alias_map(&self) {
        let records = match self.registry.list().await {
            Ok(records) => records,
            Err(err) => {
                warn!(?err, "failed to load alias map from registry");
                return;
            }
        };
        let providers = self.providers.lock().await.clone();
        for record in records {
            if let Some(provider) = providers.iter().find(|p| p.id() == record.id) {
                provider.set_alias(record.alias).await;
            }
        }
    }

    async fn apply_discovered_ids(&self, ids: Vec<String>) {
        let mut providers = self.providers.lock().await;
        let mut kept = Vec::with_capacity(ids.len());
        let mut new_ids = Vec::new();

        for id in &ids {
            if let Some(existing) = providers.iter().find(|p| p.id() == id) {
                kept.push(existing.clone());
            } else {
                new_ids.push(id.clone());
            }
        }

        let initialized: Vec<Arc<AccountProvider>> = futures_util::future::join_all(new_ids.into_iter().map(|id| {
            let mut auth = AuthManager::new(id.clone(), self.client_id.clone(), self.blob.clone(), self.http.clone());
            if let Some(metrics) = &self.metrics {
                auth = auth.with_metrics(metrics.clone());
            }
            let default_base = self.default_base_url.clone();
            let http = self.http.clone();
            let metrics = self.metrics.clone();
            async move {
                let mut provider = AccountProvider::new(auth, http, default_base);
                if let Some(metrics) = metrics {
                    provider = provider.with_metrics(metrics);
                }
                let provider = Arc::new(provider);
                provider.initialize().await;
                provider
            }
        }))
        .await;

        kept.extend(initialized);
        let registry = &self.registry;
        for provider in &kept {
            let _ = registry.upsert_id(provider.id()).await;
        }

        let len = kept.len();
        *providers = kept;
        if len > 0 {
            let idx = self.current_index.load(Ordering::Relaxed);
            self.current_index.store(idx % len, Ordering::Relaxed);
        } else {
            self.current_index.store(0, Ordering::Relaxed);
        }
        if let Some(metrics) = &self.metrics {
            metrics.set_active_providers(len);
        }
    }

    pub async fn dispatch_chat(
        &self,
        quota: &Arc<QuotaManager>,
        deferred: &DeferredWork,
        payload: Value,
    ) -> Result<ChatResponse, ApiError> {
        self.ensure_fresh().await;
        let providers = self.providers.lock().await.clone();
        let n = providers.len();
        if n == 0 {
            return Err(ApiError::NoProvidersConfigured);
        }

        let start_index = self.current_index.load(Ordering::Relaxed);
        let mut walk = Walk::new();
        let mut advanced = false;
        let now = now_ms();

        for k in 0..n {
            let idx = (start_index + k) % n;
            let provider = &providers[idx];
            let is_last_candidate = k == n - 1;

            if !provider.can_attempt(now).await && !is_last_candidate {
                continue;
            }

            let decision = quota.check_quota(provider.id(), Kind::Chat).await;
            if let Some(metrics) = &self.metrics {
                metrics.record_quota_admission("chat", decision.reason.unwrap_or("allowed"));
            }
            if !decision.allowed {
                walk.quota_blocked += 1;
                continue;
            }

            if !advanced {
                self.current_index.store((idx + 1) % n, Ordering::Relaxed);
                advanced = true;
            }

            match provider.handle_chat(quota, deferred, payload.clone()).await {
                Ok(resp) => {
                    walk.success = Some(resp);
                    break;
                }
                Err(failure) => walk.record_failure(&failure),
            }
        }

        match walk.success {
            Some(resp) => Ok(resp),
            None => Err(walk.into_api_error(n)),
        }
    }

    pub async fn dispatch_search(
        &self,
        quota: &Arc<QuotaManager>,
        deferred: &DeferredWork,
        query: &str,
    ) -> Result<SearchResponse, ApiError> {
        self.ensure_fresh().await;
        let providers = self.providers.lock().await.clone();
        let n = providers.len();
        if n == 0 {
            return Err(ApiError::NoProvidersConfigured);
        }

        let start_index = self.current_index.load(Ordering::Relaxed);
        let mut walk = Walk::new();
        let mut advanced = false;
        let now = now_ms();

        for k in 0..n {
            let idx = (start_index + k) % n;
            let provider = &providers[idx];
            let is_last_candidate = k == n - 1;

            if !provider.can_attempt(now).await && !is_last_candidate {
                continue;
            }

            let decision = quota.check_quota(provider.id(), Kind::Search).await;
            if let Some(metrics) = &self.metrics {
                metrics.record_quota_admission("search", decision.reason.unwrap_or("allowed"));
            }
            if !decision.allowed {
                walk.quota_blocked += 1;
                continue;
            }

            if !advanced {
                self.current_index.store((idx + 1) % n, Ordering::Relaxed);
                advanced = true;
            }

            match provider.handle_search(quota, deferred, query).await {
                Ok(resp) => {
                    walk.success = Some(resp);
                    break;
                }
                Err(failure) => walk.record_failure(&failure),
            }
        }

        match walk.success {
            Some(resp) => Ok(resp),
            None => Err(walk.into_api_error(n)),
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_pool_maps_to_no_providers_configured() {
        let walk: Walk<()> = Walk::new();
        assert!(matches!(walk.into_api_error(0), ApiError::NoProvidersConfigured));
    }

    #[test]
    fn all_auth_expired_maps_to_401_unauthorized() {
        let mut walk: Walk<()> = Walk::new();
        walk.record_failure(&DispatchFailure::AuthExpired);
        walk.record_failure(&DispatchFailure::AuthExpired);
        assert!(matches!(walk.into_api_error(2), ApiError::AllUnauthorized { .. }));
    }

    #[test]
    fn mixed_failures_map_to_all_failed() {
        let mut walk: Walk<()> = Walk::new();
        walk.record_failure(&DispatchFailure::AuthExpired);
        walk.record_failure(&DispatchFailure::Upstream {
            status: 500,
            detail: "boom".into(),
        });
        assert!(matches!(walk.into_api_error(2), ApiError::AllFailed { .. }));
    }

    #[test]
    fn all_quota_blocked_at_admission_maps_to_rate_limited() {
        let mut walk: Walk<()> = Walk::new();
        walk.quota_blocked = 3;
        assert!(matches!(walk.into_api_error(3), ApiError::AllRateLimited { .. }));
    }
}
