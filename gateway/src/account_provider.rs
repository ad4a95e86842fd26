//! Owns one account's [`AuthManager`], builds upstream requests, classifies
//! outcomes, and enforces a per-instance cooldown after failure.

use crate::auth_manager::{AuthError, AuthManager};
use crate::credential::Credential;
use crate::deferred::DeferredWork;
use crate::quota::{Kind, QuotaManager};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

const COOLDOWN_MS: i64 = 15_000;
const CHAT_TIMEOUT_SECS: u64 = 60;
const SEARCH_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStatus {
    Initializing,
    Active,
    Error,
    Inactive,
}

#[derive(Debug, Clone)]
pub struct ProviderRuntimeState {
    pub id: String,
    pub alias: Option<String>,
    pub status: ProviderStatus,
    pub last_error: Option<String>,
    pub total_requests: u64,
    pub error_count: u64,
    pub last_latency_ms: Option<u64>,
    pub last_used_at: Option<chrono::DateTime<Utc>>,
    pub retry_after_ms: Option<i64>,
}

impl ProviderRuntimeState {
    fn new(id: String) -> Self {
        Self {
            id,
            alias: None,
            status: ProviderStatus::Initializing,
            last_error: None,
            total_requests: 0,
            error_count: 0,
            last_latency_ms: None,
            last_used_at: None,
            retry_after_ms: None,
        }
    }
}

/// Typed failure classification. The source this system descends from
/// classified failures by matching substrings in an error message; this
/// models the same four categories as a closed enum instead, which is the
/// idiomatic Rust shape and lets the pool match exhaustively rather than
/// string-sniffing.
#[derive(Debug, Clone)]
pub enum DispatchFailure {
    AuthExpired,
    QuotaExceeded,
    RateLimited,
    Upstream { status: u16, detail: String },
    Timeout,
}

impl DispatchFailure {
    pub fn message(&self) -> String {
        match self {
            DispatchFailure::AuthExpired => "Unauthorized (Please Login)".to_string(),
            DispatchFailure::QuotaExceeded => "Quota exceeded (Qwen free tier)".to_string(),
            DispatchFailure::RateLimited => "Rate limited".to_string(),
            DispatchFailure::Upstream { status, .. } => format!("Upstream Error: {status}"),
            DispatchFailure::Timeout => format!("Upstream Timeout ({CHAT_TIMEOUT_SECS}s)"),
        }
    }
}

pub enum ChatBody {
    /// Non-streaming JSON, buffered in full.
    Buffered(bytes::Bytes),
    /// `text/event-stream` content negotiated upstream: forwarded live so the
    /// dispatcher can pipe it through [`crate::stream_dedup::StreamDedup`]
    /// chunk-by-chunk instead of buffering the whole completion.
    EventStream(reqwest::Response),
}

pub struct ChatResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: ChatBody,
    pub provider_id: String,
}

pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub content: String,
    pub score: f64,
    pub published_date: Option<String>,
}

pub struct SearchResponse {
    pub query: String,
    pub results: Vec<SearchResult>,
}

pub struct AccountProvider {
    pub auth: AuthManager,
    http: reqwest::Client,
    default_base_url: String,
    metrics: Option<Arc<crate::metrics::GatewayMetrics>>,
    state: Mutex<ProviderRuntimeState>,
}

impl AccountProvider {
    pub fn new(auth: AuthManager, http: reqwest::Client, default_base_url: String) -> Self {
        let id = auth.creds_key().to_string();
        Self {
            auth,
            http,
            default_base_url,
            metrics: None,
            state: Mutex::new(ProviderRuntimeState::new(id)),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<crate::metrics::GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn id(&self) -> &str {
        self.auth.creds_key()
    }

    pub async fn snapshot(&self) -> ProviderRuntimeState {
        self.state.lock().await.clone()
    }

    pub async fn set_alias(&self, alias: Option<String>) {
        self.state.lock().await.alias = alias;
    }

    /// Assumes active without probing: probing on init would consume free
    /// quota and, under cold-start fan-out across many accounts, can produce
    /// a spurious 429 storm.
    pub async fn initialize(&self) {
        match self.auth.get_valid().await {
            Ok(_) => {
                let mut state = self.state.lock().await;
                state.status = ProviderStatus::Active;
                state.last_error = None;
            }
            Err(AuthError::NoCreds) => {
                let mut state = self.state.lock().await;
                state.status = ProviderStatus::Error;
                state.last_error = Some("Missing Credentials".to_string());
            }
            Err(AuthError::AuthExpired) => {
                let mut state = self.state.lock().await;
                state.status = ProviderStatus::Error;
                state.last_error = Some("Unauthorized (Please Login)".to_string());
            }
            Err(err) => {
                let mut state = self.state.lock().await;
                state.status = ProviderStatus::Error;
                state.last_error = Some(err.to_string());
            }
        }
    }

    pub async fn can_attempt(&self, now_ms: i64) -> bool {
        let state = self.state.lock().await;
        match state.retry_after_ms {
            Some(retry_after) => now_ms >= retry_after,
            None => true,
        }
    }

    async fn mark_failure(&self, detail: &str) {
        let mut state = self.state.lock().await;
        state.error_count += 1;
        state.status = ProviderStatus::Error;
        state.last_error = Some(detail.to_string());
        state.retry_after_ms = Some(Utc::now().timestamp_millis() + COOLDOWN_MS);
    }

    async fn mark_success(&self, latency_ms: u64) {
        let mut state = self.state.lock().await;
        state.status = ProviderStatus::Active;
        state.last_error = None;
        state.retry_after_ms = None;
        state.total_requests += 1;
        state.last_latency_ms = Some(latency_ms);
        state.last_used_at = Some(Utc::now());
    }

    pub async fn handle_chat(
        &self,
        quota: &Arc<QuotaManager>,
        deferred: &DeferredWork,
        mut payload: Value,
    ) -> Result<ChatResponse, DispatchFailure> {
        let started = Instant::now();
        let creds = match self.auth.get_valid().await {
            Ok(creds) => creds,
            Err(err) => {
                let failure = map_auth_error(err);
                self.mark_failure(&failure.message()).await;
                quota.record_failure(self.id(), Kind::Chat, "auth_expired").await;
                return Err(failure);
            }
        };

        prepare_chat_payload(&mut payload);

        let mut resp = match self.post_chat(&creds, &payload).await {
            Ok(resp) => resp,
            Err(_) => {
                self.mark_failure(&DispatchFailure::Timeout.message()).await;
                quota.record_failure(self.id(), Kind::Chat, "runtime_error").await;
                return Err(DispatchFailure::Timeout);
            }
        };

        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            let refreshed = match self.auth.refresh(&creds.refresh_token).await {
                Ok(refreshed) => refreshed,
                Err(err) => {
                    let failure = map_auth_error(err);
                    self.mark_failure(&failure.message()).await;
                    quota.record_failure(self.id(), Kind::Chat, "auth_expired").await;
                    return Err(failure);
                }
            };
            resp = match self.post_chat(&refreshed, &payload).await {
                Ok(resp) => resp,
                Err(_) => {
                    self.mark_failure(&DispatchFailure::Timeout.message()).await;
                    quota.record_failure(self.id(), Kind::Chat, "runtime_error").await;
                    return Err(DispatchFailure::Timeout);
                }
            };
        }

        let status = resp.status();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            let failure = classify_upstream_failure(status.as_u16(), &body_text);
            self.mark_failure(&failure.message()).await;
            let reason = match &failure {
                DispatchFailure::QuotaExceeded => "upstream_quota_exceeded".to_string(),
                DispatchFailure::RateLimited => "upstream_429".to_string(),
                DispatchFailure::Upstream { status, .. } => format!("upstream_{status}"),
                _ => "upstream_error".to_string(),
            };
            quota.record_failure(self.id(), Kind::Chat, &reason).await;
            return Err(failure);
        }

        let latency_ms = started.elapsed().as_millis() as u64;
        self.mark_success(latency_ms).await;
        if let Some(metrics) = &self.metrics {
            metrics.observe_upstream_latency(latency_ms as f64 / 1000.0);
        }

        let quota = quota.clone();
        let provider_id = self.id().to_string();
        deferred.spawn(async move {
            quota.increment_usage(&provider_id, Kind::Chat).await;
        });

        let is_event_stream = content_type
            .as_deref()
            .is_some_and(|ct| ct.contains("text/event-stream"));
        let body = if is_event_stream {
            ChatBody::EventStream(resp)
        } else {
            let bytes = resp.bytes().await.map_err(|_| DispatchFailure::Timeout)?;
            ChatBody::Buffered(bytes)
        };
        Ok(ChatResponse {
            status: status.as_u16(),
            content_type,
            body,
            provider_id: self.id().to_string(),
        })
    }

    async fn post_chat(&self, creds: &Credential, payload: &Value) -> Result<reqwest::Response, reqwest::Error> {
        let base = creds.normalized_base_url(&self.default_base_url);
        let url = format!("{base}/chat/completions");
        self.http
            .post(url)
            .bearer_auth(&creds.access_token)
            .header("X-DashScope-AuthType", "qwen-oauth")
            .header("X-DashScope-CacheControl", "enable")
            .header("X-DashScope-UserAgent", "QwenCode/0.9.1 (linux; x64)")
            .header("User-Agent", "QwenCode/0.9.1 (linux; x64)")
            .timeout(std::time::Duration::from_secs(CHAT_TIMEOUT_SECS))
            .json(payload)
            .send()
            .await
    }

    pub async fn handle_search(
        &self,
        quota: &Arc<QuotaManager>,
        deferred: &DeferredWork,
        query: &str,
    ) -> Result<SearchResponse, DispatchFailure> {
        let creds = match self.auth.get_valid().await {
            Ok(creds) => creds,
            Err(err) => {
                let failure = map_auth_error(err);
                self.mark_failure(&failure.message()).await;
                quota.record_failure(self.id(), Kind::Search, "auth_expired").await;
                return Err(failure);
            }
        };
        let base = creds.normalized_base_url(&self.default_base_url);
        let url = format!("{base}/api/v1/indices/plugin/web_search");

        let resp = self
            .http
            .post(url)
            .bearer_auth(&creds.access_token)
            .timeout(std::time::Duration::from_secs(SEARCH_TIMEOUT_SECS))
            .json(&json!({ "uq": query, "page": 1, "rows": 10 }))
            .send()
            .await
            .map_err(|_| DispatchFailure::Timeout)?;

        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            let failure = classify_upstream_failure(status.as_u16(), &body_text);
            self.mark_failure(&failure.message()).await;
            quota.record_failure(self.id(), Kind::Search, "upstream_error").await;
            return Err(failure);
        }

        let body: Value = resp.json().await.map_err(|_| DispatchFailure::Timeout)?;
        let data_status = body.get("status").and_then(Value::as_i64).unwrap_or(0);
        if data_status != 0 {
            self.mark_failure("invalid_payload").await;
            quota.record_failure(self.id(), Kind::Search, "invalid_payload").await;
            return Err(DispatchFailure::Upstream {
                status: 200,
                detail: "invalid_payload".to_string(),
            });
        }

        let latency_ms = 0;
        self.mark_success(latency_ms).await;
        let quota = quota.clone();
        let provider_id = self.id().to_string();
        deferred.spawn(async move {
            quota.increment_usage(&provider_id, Kind::Search).await;
        });

        let items = body
            .get("data")
            .and_then(|d| d.get("items"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let results = items
            .into_iter()
            .map(|item| SearchResult {
                title: item.get("title").and_then(Value::as_str).unwrap_or_default().to_string(),
                url: item.get("url").and_then(Value::as_str).unwrap_or_default().to_string(),
                content: item.get("snippet").and_then(Value::as_str).unwrap_or_default().to_string(),
                score: item.get("_score").and_then(Value::as_f64).unwrap_or(0.0),
                published_date: item
                    .get("timestamp_format")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            })
            .collect();

        Ok(SearchResponse {
            query: query.to_string(),
            results,
        })
    }
}

fn map_auth_error(err: AuthError) -> DispatchFailure {
    match err {
        AuthError::NoCreds | AuthError::AuthExpired => DispatchFailure::AuthExpired,
        AuthError::RefreshTimeout => DispatchFailure::Timeout,
        AuthError::Transport(detail) => DispatchFailure::Upstream { status: 0, detail },
    }
}

/// `insufficient_quota` / `free allocated quota exceeded` (case-insensitive)
/// on a 429 is a distinct category from an ordinary rate limit.
fn classify_upstream_failure(status: u16, body: &str) -> DispatchFailure {
    if status == 429 {
        let lowered = body.to_ascii_lowercase();
        if lowered.contains("insufficient_quota") || lowered.contains("free allocated quota exceeded") {
            return DispatchFailure::QuotaExceeded;
        }
        return DispatchFailure::RateLimited;
    }
    DispatchFailure::Upstream {
        status,
        detail: body.to_string(),
    }
}

/// Injects the default system message when absent and marks the system
/// message plus the last text part of the last message with the upstream
/// provider's prompt-cache hint (`cache_control: {type: "ephemeral"}`).
pub fn prepare_chat_payload(payload: &mut Value) {
    let Some(messages) = payload.get_mut("messages").and_then(Value::as_array_mut) else {
        return;
    };

    let has_system = messages
        .iter()
        .any(|m| m.get("role").and_then(Value::as_str) == Some("system"));

    if !has_system {
        messages.insert(
            0,
            json!({
                "role": "system",
                "content": promote_to_cache_parts("你是助手"),
            }),
        );
    } else if let Some(system_msg) = messages
        .iter_mut()
        .find(|m| m.get("role").and_then(Value::as_str) == Some("system"))
    {
        mark_cache_control(system_msg);
    }

    if let Some(last) = messages.last_mut() {
        mark_cache_control(last);
    }
}

fn mark_cache_control(message: &mut Value) {
    let Some(content) = message.get("content").cloned() else {
        return;
    };
    if let Some(text) = content.as_str() {
        message["content"] = promote_to_cache_parts(text);
    } else if let Some(parts) = content.as_array() {
        let mut parts = parts.clone();
        if let Some(last_part) = parts.last_mut() {
            last_part["cache_control"] = json!({ "type": "ephemeral" });
        }
        message["content"] = Value::Array(parts);
    }
}

fn promote_to_cache_parts(text: &str) -> Value {
    json!([{ "type": "text", "text": text, "cache_control": { "type": "ephemeral" } }])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_exceeded_is_distinguished_from_plain_rate_limit() {
        let quota = classify_upstream_failure(429, r#"{"error":"insufficient_quota"}"#);
        assert!(matches!(quota, DispatchFailure::QuotaExceeded));
        let rate_limited = classify_upstream_failure(429, "Too Many Requests");
        assert!(matches!(rate_limited, DispatchFailure::RateLimited));
    }

    #[test]
    fn quota_exceeded_detection_is_case_insensitive() {
        let failure = classify_upstream_failure(429, "FREE ALLOCATED QUOTA EXCEEDED");
        assert!(matches!(failure, DispatchFailure::QuotaExceeded));
    }

    #[test]
    fn system_message_is_injected_when_absent() {
        let mut payload = json!({
            "messages": [{"role": "user", "content": "hi"}]
        });
        prepare_chat_payload(&mut payload);
        let messages = payload["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn existing_system_message_is_not_duplicated() {
        let mut payload = json!({
            "messages": [
                {"role": "system", "content": "custom"},
                {"role": "user", "content": "hi"}
            ]
        });
        prepare_chat_payload(&mut payload);
        let messages = payload["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["content"][0]["text"], "custom");
    }

    #[test]
    fn dispatch_failure_messages_match_spec_text() {
        assert_eq!(DispatchFailure::RateLimited.message(), "Rate limited");
        assert_eq!(
            DispatchFailure::QuotaExceeded.message(),
            "Quota exceeded (Qwen free tier)"
        );
        assert_eq!(
            DispatchFailure::Upstream { status: 500, detail: String::new() }.message(),
            "Upstream Error: 500"
        );
    }
}
