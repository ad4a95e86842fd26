//! Per-account OAuth lifecycle: device-code enrollment, credential load/save
//! with legacy-key migration, and expiry-driven refresh guarded by a
//! distributed lock so stateless instances racing on expiry cannot both
//! rotate the same refresh token.

use crate::blob_store::{BlobStore, BlobStoreExt};
use crate::credential::{canonicalize_key, legacy_key, Credential};
use crate::metrics::GatewayMetrics;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{info, warn};

const DEVICE_CODE_URL: &str = "https://chat.qwen.ai/api/v1/oauth2/device/code";
const TOKEN_URL: &str = "https://chat.qwen.ai/api/v1/oauth2/token";
const REFRESH_LOCK_TTL_SECS: u64 = 60;
const REFRESH_WAIT_ATTEMPTS: u32 = 30;
const REFRESH_WAIT_INTERVAL: Duration = Duration::from_millis(500);
const MEMORY_CACHE_TTL_MS: i64 = 5_000;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("NO_CREDS")]
    NoCreds,
    #[error("AUTH_EXPIRED")]
    AuthExpired,
    #[error("Timeout or failure waiting for token update")]
    RefreshTimeout,
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Serialize)]
pub struct DeviceAuthStart {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: String,
    pub expires_in: u64,
    pub interval: u64,
}

#[derive(Debug, Deserialize)]
struct DeviceAuthResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    verification_uri_complete: String,
    expires_in: u64,
    #[serde(default = "default_poll_interval")]
    interval: u64,
}

fn default_poll_interval() -> u64 {
    5
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    resource_url: Option<String>,
    expires_in: i64,
    #[serde(default)]
    error: Option<String>,
}

pub enum ExchangeOutcome {
    Credential(Credential),
    Pending,
}

struct MemoryCache {
    creds: Credential,
    loaded_at_ms: i64,
}

pub struct AuthManager {
    creds_key: String,
    client_id: String,
    http: reqwest::Client,
    blob: Arc<dyn BlobStore>,
    metrics: Option<Arc<GatewayMetrics>>,
    memory: Mutex<Option<MemoryCache>>,
    legacy_checked: Mutex<bool>,
}

impl AuthManager {
    pub fn new(creds_key: String, client_id: String, blob: Arc<dyn BlobStore>, http: reqwest::Client) -> Self {
        Self {
            creds_key: canonicalize_key(&creds_key),
            client_id,
            http,
            blob,
            metrics: None,
            memory: Mutex::new(None),
            legacy_checked: Mutex::new(false),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn creds_key(&self) -> &str {
        &self.creds_key
    }

    pub async fn start_device_auth(&self, code_challenge: &str) -> Result<DeviceAuthStart, AuthError> {
        let params = [
            ("client_id", self.client_id.as_str()),
            ("scope", "openid profile email model.completion"),
            ("code_challenge", code_challenge),
            ("code_challenge_method", "S256"),
        ];
        let resp = self
            .http
            .post(DEVICE_CODE_URL)
            .form(&params)
            .send()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(AuthError::Transport(format!(
                "device code endpoint returned {}",
                resp.status()
            )));
        }
        let body: DeviceAuthResponse = resp
            .json()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;
        Ok(DeviceAuthStart {
            device_code: body.device_code,
            user_code: body.user_code,
            verification_uri: body.verification_uri,
            verification_uri_complete: body.verification_uri_complete,
            expires_in: body.expires_in,
            interval: body.interval,
        })
    }

    pub async fn exchange_device_code(
        &self,
        device_code: &str,
        code_verifier: &str,
    ) -> Result<ExchangeOutcome, AuthError> {
        let params = [
            ("grant_type", "urn:ietf:params:oauth:grant-type:device_code"),
            ("client_id", self.client_id.as_str()),
            ("device_code", device_code),
            ("code_verifier", code_verifier),
        ];
        let resp = self
            .http
            .post(TOKEN_URL)
            .form(&params)
            .send()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;
        let status = resp.status();
        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        if let Some(err) = body.error.as_deref() {
            if err == "authorization_pending" || err == "slow_down" {
                return Ok(ExchangeOutcome::Pending);
            }
            return Err(AuthError::Transport(format!("device exchange error: {err}")));
        }
        if !status.is_success() {
            return Err(AuthError::Transport(format!("token endpoint returned {status}")));
        }

        let now_ms = Utc::now().timestamp_millis();
        let cred = Credential {
            access_token: body.access_token,
            refresh_token: body.refresh_token,
            token_type: body.token_type,
            scope: body.scope,
            resource_url: body.resource_url,
            expiry_unix_ms: Some(now_ms + body.expires_in * 1000),
            alias: None,
        };
        self.blob
            .set_json(&self.creds_key, &cred, None)
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;
        Ok(ExchangeOutcome::Credential(cred))
    }

    async fn migrate_legacy_if_needed(&self) -> Result<(), AuthError> {
        let mut checked = self.legacy_checked.lock().await;
        if *checked {
            return Ok(());
        }
        *checked = true;
        let legacy = legacy_key(&self.creds_key);
        match self
            .blob
            .get_json::<Credential>(&legacy)
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?
        {
            Some(cred) => {
                info!(key = %self.creds_key, "Migrating legacy credential key");
                self.blob
                    .set_json(&self.creds_key, &cred, None)
                    .await
                    .map_err(|e| AuthError::Transport(e.to_string()))?;
                self.blob
                    .delete(&legacy)
                    .await
                    .map_err(|e| AuthError::Transport(e.to_string()))?;
            }
            None => {}
        }
        Ok(())
    }

    pub async fn get_valid(&self) -> Result<Credential, AuthError> {
        self.migrate_legacy_if_needed().await?;

        let now_ms = Utc::now().timestamp_millis();
        {
            let guard = self.memory.lock().await;
            if let Some(cache) = guard.as_ref() {
                if now_ms - cache.loaded_at_ms <= MEMORY_CACHE_TTL_MS {
                    let creds = cache.creds.clone();
                    drop(guard);
                    return self.refresh_if_needed(creds, now_ms).await;
                }
            }
        }

        let stored = self
            .blob
            .get_json::<Credential>(&self.creds_key)
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?
            .ok_or(AuthError::NoCreds)?;

        {
            let mut guard = self.memory.lock().await;
            *guard = Some(MemoryCache {
                creds: stored.clone(),
                loaded_at_ms: now_ms,
            });
        }

        self.refresh_if_needed(stored, now_ms).await
    }

    async fn refresh_if_needed(&self, creds: Credential, now_ms: i64) -> Result<Credential, AuthError> {
        if creds.needs_refresh(now_ms) {
            self.refresh(&creds.refresh_token).await
        } else {
            Ok(creds)
        }
    }

    /// Refreshes the access token, guarded by `lock:token_refresh:<credsKey>`.
    /// Without this lock two instances racing on expiry would each rotate the
    /// refresh token and one would be silently invalidated by the vendor.
    pub async fn refresh(&self, refresh_token: &str) -> Result<Credential, AuthError> {
        let lock_name = format!("token_refresh:{}", self.creds_key);
        let token = self
            .blob
            .acquire(&lock_name, REFRESH_LOCK_TTL_SECS)
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        let Some(token) = token else {
            if let Some(metrics) = &self.metrics {
                metrics.record_refresh_lock(false);
            }
            return self.wait_for_rotated_token(refresh_token).await;
        };
        if let Some(metrics) = &self.metrics {
            metrics.record_refresh_lock(true);
        }

        let result = self.refresh_locked(refresh_token).await;
        if let Err(err) = self.blob.release(&lock_name, &token).await {
            warn!(?err, key = %self.creds_key, "Failed to release token refresh lock");
        }
        result
    }

    async fn wait_for_rotated_token(&self, stale_refresh_token: &str) -> Result<Credential, AuthError> {
        for _ in 0..REFRESH_WAIT_ATTEMPTS {
            sleep(REFRESH_WAIT_INTERVAL).await;
            if let Ok(Some(latest)) = self.blob.get_json::<Credential>(&self.creds_key).await {
                if latest.refresh_token != stale_refresh_token {
                    let mut guard = self.memory.lock().await;
                    *guard = Some(MemoryCache {
                        creds: latest.clone(),
                        loaded_at_ms: Utc::now().timestamp_millis(),
                    });
                    return Ok(latest);
                }
            }
        }
        Err(AuthError::RefreshTimeout)
    }

    async fn refresh_locked(&self, refresh_token: &str) -> Result<Credential, AuthError> {
        // Reload latest: another writer may have already rotated the token
        // while we were waiting on the lock.
        if let Ok(Some(latest)) = self.blob.get_json::<Credential>(&self.creds_key).await {
            if latest.refresh_token != refresh_token {
                let mut guard = self.memory.lock().await;
                *guard = Some(MemoryCache {
                    creds: latest.clone(),
                    loaded_at_ms: Utc::now().timestamp_millis(),
                });
                return Ok(latest);
            }
        }

        let params = [
            ("grant_type", "refresh_token"),
            ("client_id", self.client_id.as_str()),
            ("refresh_token", refresh_token),
        ];
        let resp = self
            .http
            .post(TOKEN_URL)
            .form(&params)
            .send()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;
        let status = resp.status();
        if status.as_u16() == 400 || status.as_u16() == 401 {
            return Err(AuthError::AuthExpired);
        }
        if !status.is_success() {
            return Err(AuthError::Transport(format!("refresh endpoint returned {status}")));
        }
        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        let preserved_alias = {
            let guard = self.memory.lock().await;
            guard.as_ref().and_then(|c| c.creds.alias.clone())
        };
        let preserved_resource_url = {
            let guard = self.memory.lock().await;
            guard.as_ref().and_then(|c| c.creds.resource_url.clone())
        };

        let now_ms = Utc::now().timestamp_millis();
        let new_creds = Credential {
            access_token: body.access_token,
            refresh_token: body.refresh_token,
            token_type: body.token_type,
            scope: body.scope,
            resource_url: body.resource_url.or(preserved_resource_url),
            expiry_unix_ms: Some(now_ms + body.expires_in * 1000),
            alias: preserved_alias,
        };

        self.blob
            .set_json(&self.creds_key, &new_creds, None)
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        let mut guard = self.memory.lock().await;
        *guard = Some(MemoryCache {
            creds: new_creds.clone(),
            loaded_at_ms: now_ms,
        });

        Ok(new_creds)
    }

    /// 5-second-timeout minimal chat probe used for one-shot validity checks.
    pub async fn probe_status(&self, creds: &Credential) -> Option<u16> {
        let base = creds.normalized_base_url("https://dashscope.aliyuncs.com/api/v1");
        let url = format!("{base}/chat/completions");
        let resp = self
            .http
            .post(url)
            .bearer_auth(&creds.access_token)
            .timeout(Duration::from_secs(5))
            .json(&serde_json::json!({
                "model": "qwen-probe",
                "messages": [{"role": "user", "content": "ping"}],
                "max_tokens": 1,
            }))
            .send()
            .await
            .ok()?;
        Some(resp.status().as_u16())
    }

    pub async fn cached_alias(&self) -> Option<String> {
        let guard = self.memory.lock().await;
        if let Some(cache) = guard.as_ref() {
            if let Some(alias) = cache.creds.alias.clone() {
                return Some(alias);
            }
        }
        drop(guard);
        Some(strip_known_affixes(&self.creds_key))
    }
}

fn strip_known_affixes(id: &str) -> String {
    let without_ext = id.strip_suffix(".json").unwrap_or(id);
    without_ext
        .strip_prefix("qwen_creds_")
        .or_else(|| without_ext.strip_prefix("oauth_creds_"))
        .unwrap_or(without_ext)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::InMemoryBlobStore;

    fn manager(blob: Arc<dyn BlobStore>) -> AuthManager {
        AuthManager::new(
            "qwen_creds_aaaaaaaa.json".into(),
            "test-client".into(),
            blob,
            reqwest::Client::new(),
        )
    }

    #[tokio::test]
    async fn get_valid_fails_with_no_creds_when_store_empty() {
        let blob: Arc<dyn BlobStore> = Arc::new(InMemoryBlobStore::new());
        let auth = manager(blob);
        let err = auth.get_valid().await.unwrap_err();
        assert!(matches!(err, AuthError::NoCreds));
    }

    #[tokio::test]
    async fn get_valid_migrates_legacy_key_on_first_read() {
        let blob: Arc<dyn BlobStore> = Arc::new(InMemoryBlobStore::new());
        let cred = Credential {
            access_token: "at".into(),
            refresh_token: "rt".into(),
            token_type: None,
            scope: None,
            resource_url: None,
            expiry_unix_ms: Some(Utc::now().timestamp_millis() + 3_600_000),
            alias: None,
        };
        blob.set_json("./qwen_creds_aaaaaaaa.json", &cred, None)
            .await
            .unwrap();
        let auth = manager(blob.clone());
        let loaded = auth.get_valid().await.unwrap();
        assert_eq!(loaded.access_token, "at");
        assert!(blob
            .get_json::<Credential>("./qwen_creds_aaaaaaaa.json")
            .await
            .unwrap()
            .is_none());
        assert!(blob
            .get_json::<Credential>("qwen_creds_aaaaaaaa.json")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn cached_alias_falls_back_to_stripped_id() {
        let blob: Arc<dyn BlobStore> = Arc::new(InMemoryBlobStore::new());
        let auth = manager(blob);
        assert_eq!(auth.cached_alias().await, Some("aaaaaaaa".to_string()));
    }
}
