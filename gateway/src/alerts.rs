//! Periodic health checks over the audit trail, posted to a DingTalk/Feishu
//! webhook with ALERT/RECOVERY transition semantics so a flapping condition
//! does not spam the channel every tick.

use crate::blob_store::{BlobStore, BlobStoreExt};
use crate::pool::ProviderPool;
use crate::quota::QuotaManager;
use anyhow::{anyhow, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const STATE_KEY: &str = "alert_engine_state";
const AUTH_FAILED_WINDOW_MINUTES: i64 = 30;
const QUOTA_RECOVERY_MARGIN_PERCENT: f64 = 5.0;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AlertState {
    #[serde(default)]
    auth_failed_fingerprint: Option<String>,
    #[serde(default)]
    daily_quota_alerted: bool,
}

pub struct AlertEngine {
    blob: Arc<dyn BlobStore>,
    http: Client,
    pool: Arc<ProviderPool>,
    quota: Arc<QuotaManager>,
    webhook_url: Option<String>,
    auth_failed_threshold: usize,
    daily_quota_threshold_percent: f64,
    tick_interval: Duration,
}

impl AlertEngine {
    pub fn new(
        blob: Arc<dyn BlobStore>,
        http: Client,
        pool: Arc<ProviderPool>,
        quota: Arc<QuotaManager>,
        webhook_url: Option<String>,
        auth_failed_threshold: usize,
        daily_quota_threshold_percent: f64,
        tick_secs: u64,
    ) -> Self {
        Self {
            blob,
            http,
            pool,
            quota,
            webhook_url,
            auth_failed_threshold: auth_failed_threshold.max(1),
            daily_quota_threshold_percent,
            tick_interval: Duration::from_secs(tick_secs.max(5)),
        }
    }

    pub async fn run_forever(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        loop {
            ticker.tick().await;
            if let Err(err) = self.tick().await {
                warn!(?err, "alert engine tick failed");
            }
        }
    }

    async fn load_state(&self) -> AlertState {
        self.blob
            .get_json::<AlertState>(STATE_KEY)
            .await
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    async fn save_state(&self, state: &AlertState) {
        if let Err(err) = self.blob.set_json(STATE_KEY, state, None).await {
            warn!(?err, "failed to persist alert engine state");
        }
    }

    pub async fn tick(&self) -> Result<()> {
        let mut state = self.load_state().await;

        self.tick_auth_failed(&mut state).await;
        self.tick_daily_quota(&mut state).await;

        self.save_state(&state).await;
        Ok(())
    }

    async fn tick_auth_failed(&self, state: &mut AlertState) {
        let mut flagged = self.quota.auth_failed_without_success(AUTH_FAILED_WINDOW_MINUTES).await;
        if flagged.len() < self.auth_failed_threshold {
            flagged.clear();
        }
        let fingerprint = if flagged.is_empty() {
            None
        } else {
            Some(flagged.join(","))
        };

        if fingerprint != state.auth_failed_fingerprint {
            match (&state.auth_failed_fingerprint, &fingerprint) {
                (None, Some(_)) | (Some(_), Some(_)) => {
                    let text = format!(
                        "ALERT: {} account(s) failing auth with no successful chat completions in the last {}m: {}",
                        flagged.len(),
                        AUTH_FAILED_WINDOW_MINUTES,
                        flagged.join(", ")
                    );
                    self.post(&text).await;
                }
                (Some(_), None) => {
                    let text = "RECOVERY: previously auth-failed accounts are completing chat requests again".to_string();
                    self.post(&text).await;
                }
                (None, None) => {}
            }
            state.auth_failed_fingerprint = fingerprint;
        }
    }

    async fn tick_daily_quota(&self, state: &mut AlertState) {
        let per_account_limit = self.quota.chat_daily_limit();
        if per_account_limit == 0 {
            return;
        }
        let provider_count = self.pool.provider_count().await;
        if provider_count == 0 {
            return;
        }
        let total = self.quota.todays_chat_total().await;
        let limit = provider_count as f64 * per_account_limit as f64;
        let percent = (total as f64 / limit * 100.0).min(100.0);

        if percent >= self.daily_quota_threshold_percent && !state.daily_quota_alerted {
            let text = format!(
                "ALERT: today's chat usage is at {percent:.1}% of aggregate free-tier quota ({total}/{limit:.0})"
            );
            self.post(&text).await;
            state.daily_quota_alerted = true;
        } else if percent < self.daily_quota_threshold_percent - QUOTA_RECOVERY_MARGIN_PERCENT
            && state.daily_quota_alerted
        {
            let text = format!("RECOVERY: today's chat usage has fallen back to {percent:.1}% of quota");
            self.post(&text).await;
            state.daily_quota_alerted = false;
        }
    }

    async fn post(&self, text: &str) {
        let Some(url) = self.webhook_url.as_deref() else {
            info!(text, "alert engine (no webhook configured)");
            return;
        };
        if let Err(err) = post_alert_webhook(&self.http, url, text).await {
            warn!(?err, "failed to deliver alert webhook");
        }
    }
}

fn build_payload(url: &str, text: &str) -> Value {
    if url.contains("oapi.dingtalk.com") {
        json!({ "msgtype": "text", "text": { "content": text } })
    } else if url.contains("open.feishu.cn") || url.contains("open.larksuite.com") {
        json!({ "msg_type": "text", "content": { "text": text } })
    } else {
        json!({ "text": text })
    }
}

pub async fn post_alert_webhook(client: &Client, url: &str, text: &str) -> Result<()> {
    if url.trim().is_empty() {
        return Ok(());
    }
    let payload = build_payload(url, text);
    let response = client.post(url).json(&payload).send().await?;
    if !response.status().is_success() {
        return Err(anyhow!("alert webhook returned status {}", response.status()));
    }
    info!("posted alert webhook");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dingtalk_urls_use_dingtalk_payload_shape() {
        let payload = build_payload("https://oapi.dingtalk.com/robot/send?access_token=x", "hi");
        assert_eq!(payload["msgtype"], "text");
        assert_eq!(payload["text"]["content"], "hi");
    }

    #[test]
    fn feishu_urls_use_feishu_payload_shape() {
        let payload = build_payload("https://open.feishu.cn/open-apis/bot/v2/hook/x", "hi");
        assert_eq!(payload["msg_type"], "text");
        assert_eq!(payload["content"]["text"], "hi");
    }

    #[test]
    fn unknown_urls_fall_back_to_generic_text_payload() {
        let payload = build_payload("https://example.com/hook", "hi");
        assert_eq!(payload["text"], "hi");
    }
}
