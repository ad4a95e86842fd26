use anyhow::{Context, Result};
use std::env;

#[derive(Debug, Clone, Copy)]
pub struct QuotaLimits {
    pub daily: u32,
    pub rpm: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct QuotaConfig {
    pub chat: QuotaLimits,
    pub search: QuotaLimits,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub api_key: String,
    pub admin_key: String,
    pub qwen_oauth_client_id: String,
    pub qwen_default_base_url: String,
    pub quota: QuotaConfig,
    pub audit_success_logs: bool,
    pub provider_scan_secs: u64,
    pub provider_full_kv_scan_minutes: u64,
    pub static_auth_files: Vec<String>,
    pub redis_url: String,
    pub redis_prefix: String,
    pub database_url: String,
    pub alert_tick_secs: u64,
    pub alert_webhook_url: Option<String>,
    pub alert_auth_failed_threshold: usize,
    pub alert_daily_quota_threshold_percent: f64,
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let api_key = env::var("API_KEY").context("API_KEY must be set")?;
        let admin_key = env::var("ADMIN_KEY").context("ADMIN_KEY must be set")?;
        let qwen_oauth_client_id =
            env::var("QWEN_OAUTH_CLIENT_ID").context("QWEN_OAUTH_CLIENT_ID must be set")?;
        let qwen_default_base_url = env::var("QWEN_DEFAULT_BASE_URL")
            .unwrap_or_else(|_| "https://dashscope.aliyuncs.com/api/v1".to_string());
        let redis_url = env::var("REDIS_URL").context("REDIS_URL must be set")?;
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let redis_prefix =
            env::var("GATEWAY_BLOB_PREFIX").unwrap_or_else(|_| "qwen-gateway".to_string());

        let quota = QuotaConfig {
            chat: QuotaLimits {
                daily: env_u32("QUOTA_CHAT_DAILY", 0),
                rpm: env_u32("QUOTA_CHAT_RPM", 0),
            },
            search: QuotaLimits {
                daily: env_u32("QUOTA_SEARCH_DAILY", 0),
                rpm: env_u32("QUOTA_SEARCH_RPM", 0),
            },
        };

        let static_auth_files = env::var("PROVIDERS_QWEN_AUTH_FILES")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(crate::credential::canonicalize_key)
            .collect();

        Ok(Self {
            api_key,
            admin_key,
            qwen_oauth_client_id,
            qwen_default_base_url,
            quota,
            audit_success_logs: env_bool("AUDIT_SUCCESS_LOGS", true),
            provider_scan_secs: env_u64("TUNING_PROVIDER_SCAN_SECONDS", 30).max(5),
            provider_full_kv_scan_minutes: env_u64("TUNING_PROVIDER_FULL_KV_SCAN_MINUTES", 0),
            static_auth_files,
            redis_url,
            redis_prefix,
            database_url,
            alert_tick_secs: env_u64("ALERT_TICK_SECONDS", 300),
            alert_webhook_url: env::var("ALERT_WEBHOOK_URL").ok(),
            alert_auth_failed_threshold: env_u32("ALERT_AUTH_FAILED_THRESHOLD", 1) as usize,
            alert_daily_quota_threshold_percent: env_f64("ALERT_DAILY_QUOTA_THRESHOLD_PERCENT", 80.0),
        })
    }
}
