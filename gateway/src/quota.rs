//! Per-account quota accounting: in-memory RPM counters, buffered daily and
//! minute-audit writes with a single-threaded flush serializer, pre-flight
//! admission control, and short-TTL snapshot reads.
//!
//! Daily usage is only ever bumped by [`QuotaManager::increment_usage`] — a
//! rejected-at-admission or failed attempt still consumes an RPM slot (so
//! repeated blocked attempts keep the provider skipped on the next rotation)
//! but never inflates the `usage_stats` row, matching the "a rejected dispatch
//! does not increment UsageBucket" invariant.

use crate::clock::{beijing_date, beijing_minute};
use crate::config::QuotaConfig;
use chrono::Utc;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Chat,
    Search,
}

impl Kind {
    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Chat => "chat",
            Kind::Search => "search",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LimitUsage {
    pub used: i64,
    pub limit: u32,
    pub percent: f64,
}

fn percent_of(used: i64, limit: u32) -> f64 {
    if limit == 0 {
        0.0
    } else {
        (used as f64 / limit as f64 * 100.0).min(100.0)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct KindUsage {
    pub daily: LimitUsage,
    pub rpm: LimitUsage,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProviderUsage {
    pub chat: KindUsage,
    pub search: KindUsage,
}

#[derive(Debug, Clone, Copy)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub reason: Option<&'static str>,
}

#[derive(Debug, Clone)]
pub struct AuditRow {
    pub minute_bucket: String,
    pub provider_id: String,
    pub kind: String,
    pub outcome: String,
    pub count: i64,
}

#[derive(Default)]
struct RpmCounter {
    minute: String,
    count: u32,
}

#[derive(Clone, Default)]
struct CachedUsage {
    usage: ProviderUsage,
    cached_at_ms: i64,
}

const CACHE_TTL_MS: i64 = 5_000;

struct PendingWrites {
    usage: HashMap<(String, String, &'static str), i64>,
    audit: HashMap<(String, String, &'static str, String), i64>,
    global: HashMap<String, i64>,
}

impl PendingWrites {
    fn new() -> Self {
        Self {
            usage: HashMap::new(),
            audit: HashMap::new(),
            global: HashMap::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.usage.is_empty() && self.audit.is_empty() && self.global.is_empty()
    }
}

pub struct QuotaManager {
    pool: PgPool,
    config: QuotaConfig,
    audit_success_logs: bool,
    rpm_counters: Mutex<HashMap<(String, &'static str), RpmCounter>>,
    cache: Mutex<HashMap<String, CachedUsage>>,
    pending: Mutex<PendingWrites>,
    flush_lock: Mutex<()>,
}

impl QuotaManager {
    pub fn new(pool: PgPool, config: QuotaConfig, audit_success_logs: bool) -> Arc<Self> {
        Arc::new(Self {
            pool,
            config,
            audit_success_logs,
            rpm_counters: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
            pending: Mutex::new(PendingWrites::new()),
            flush_lock: Mutex::new(()),
        })
    }

    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS usage_stats (
                date TEXT NOT NULL,
                provider_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                count BIGINT NOT NULL DEFAULT 0,
                UNIQUE(date, provider_id, kind)
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS request_audit_minute (
                minute_bucket TEXT NOT NULL,
                provider_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                outcome TEXT NOT NULL,
                count BIGINT NOT NULL DEFAULT 0,
                PRIMARY KEY (minute_bucket, provider_id, kind, outcome)
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS global_monitor (
                key TEXT PRIMARY KEY,
                value BIGINT NOT NULL DEFAULT 0
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn limits(&self, kind: Kind) -> (u32, u32) {
        match kind {
            Kind::Chat => (self.config.chat.daily, self.config.chat.rpm),
            Kind::Search => (self.config.search.daily, self.config.search.rpm),
        }
    }

    async fn current_rpm_count(&self, provider_id: &str, kind: Kind) -> u32 {
        let minute = beijing_minute(Utc::now());
        let mut guard = self.rpm_counters.lock().await;
        let entry = guard
            .entry((provider_id.to_string(), kind.as_str()))
            .or_insert_with(|| RpmCounter {
                minute: minute.clone(),
                count: 0,
            });
        if entry.minute != minute {
            entry.minute = minute;
            entry.count = 0;
        }
        entry.count
    }

    async fn bump_rpm(&self, provider_id: &str, kind: Kind) {
        let minute = beijing_minute(Utc::now());
        let mut guard = self.rpm_counters.lock().await;
        let entry = guard
            .entry((provider_id.to_string(), kind.as_str()))
            .or_insert_with(|| RpmCounter {
                minute: minute.clone(),
                count: 0,
            });
        if entry.minute != minute {
            entry.minute = minute;
            entry.count = 0;
        }
        entry.count += 1;
    }

    async fn cached_daily_used(&self, provider_id: &str, kind: Kind) -> i64 {
        let now_ms = Utc::now().timestamp_millis();
        {
            let guard = self.cache.lock().await;
            if let Some(cached) = guard.get(provider_id) {
                if now_ms - cached.cached_at_ms < CACHE_TTL_MS {
                    return match kind {
                        Kind::Chat => cached.usage.chat.daily.used,
                        Kind::Search => cached.usage.search.daily.used,
                    };
                }
            }
        }
        let usage = self.load_usage_from_store(provider_id).await;
        let mut guard = self.cache.lock().await;
        guard.insert(
            provider_id.to_string(),
            CachedUsage {
                usage,
                cached_at_ms: now_ms,
            },
        );
        match kind {
            Kind::Chat => usage.chat.daily.used,
            Kind::Search => usage.search.daily.used,
        }
    }

    async fn load_usage_from_store(&self, provider_id: &str) -> ProviderUsage {
        let date = beijing_date(Utc::now());
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT kind, count FROM usage_stats WHERE date = $1 AND provider_id = $2",
        )
        .bind(&date)
        .bind(provider_id)
        .fetch_all(&self.pool)
        .await
        .unwrap_or_else(|err| {
            warn!(?err, provider_id, "Failed to read usage_stats; falling back to zero");
            Vec::new()
        });

        let mut usage = ProviderUsage::default();
        for (kind, count) in rows {
            match kind.as_str() {
                "chat" => {
                    usage.chat.daily.used = count;
                    usage.chat.daily.limit = self.config.chat.daily;
                    usage.chat.daily.percent = percent_of(count, self.config.chat.daily);
                }
                "search" => {
                    usage.search.daily.used = count;
                    usage.search.daily.limit = self.config.search.daily;
                    usage.search.daily.percent = percent_of(count, self.config.search.daily);
                }
                _ => {}
            }
        }
        usage
    }

    fn merge_cache_delta(&self, guard: &mut HashMap<String, CachedUsage>, provider_id: &str, kind: Kind, delta: i64) {
        let now_ms = Utc::now().timestamp_millis();
        let entry = guard.entry(provider_id.to_string()).or_insert_with(|| CachedUsage {
            usage: ProviderUsage::default(),
            cached_at_ms: now_ms,
        });
        let slot = match kind {
            Kind::Chat => &mut entry.usage.chat.daily,
            Kind::Search => &mut entry.usage.search.daily,
        };
        slot.used += delta;
        let limit = match kind {
            Kind::Chat => self.config.chat.daily,
            Kind::Search => self.config.search.daily,
        };
        slot.limit = limit;
        slot.percent = percent_of(slot.used, limit);
    }

    pub async fn check_quota(&self, provider_id: &str, kind: Kind) -> QuotaDecision {
        let (daily_limit, rpm_limit) = self.limits(kind);

        if daily_limit > 0 {
            let used = self.cached_daily_used(provider_id, kind).await;
            if used >= daily_limit as i64 {
                self.record_limit_hit(provider_id, kind, "daily").await;
                return QuotaDecision {
                    allowed: false,
                    reason: Some("daily"),
                };
            }
        }

        if rpm_limit > 0 {
            let current = self.current_rpm_count(provider_id, kind).await;
            if current >= rpm_limit {
                self.record_limit_hit(provider_id, kind, "rpm").await;
                return QuotaDecision {
                    allowed: false,
                    reason: Some("rpm"),
                };
            }
        }

        QuotaDecision {
            allowed: true,
            reason: None,
        }
    }

    async fn record_limit_hit(&self, provider_id: &str, kind: Kind, reason: &'static str) {
        self.bump_rpm(provider_id, kind).await;
        let minute = beijing_minute(Utc::now());
        let outcome = format!("limited:{reason}");
        {
            let mut pending = self.pending.lock().await;
            *pending
                .audit
                .entry((minute, provider_id.to_string(), kind.as_str(), outcome))
                .or_insert(0) += 1;
            *pending.global.entry(format!("{}_total", kind.as_str())).or_insert(0) += 1;
            *pending
                .global
                .entry(format!("{}_rate_limited", kind.as_str()))
                .or_insert(0) += 1;
        }
        self.flush_buffered_writes().await;
    }

    /// Called only on a successful upstream response.
    pub async fn increment_usage(&self, provider_id: &str, kind: Kind) {
        self.bump_rpm(provider_id, kind).await;
        let date = beijing_date(Utc::now());
        let minute = beijing_minute(Utc::now());
        {
            let mut pending = self.pending.lock().await;
            *pending
                .usage
                .entry((date, provider_id.to_string(), kind.as_str()))
                .or_insert(0) += 1;
            *pending
                .audit
                .entry((minute, provider_id.to_string(), kind.as_str(), "success".to_string()))
                .or_insert(0) += 1;
            *pending.global.entry(format!("{}_total", kind.as_str())).or_insert(0) += 1;
            *pending.global.entry(format!("{}_success", kind.as_str())).or_insert(0) += 1;
        }
        {
            let mut cache = self.cache.lock().await;
            self.merge_cache_delta(&mut cache, provider_id, kind, 1);
        }
        self.flush_buffered_writes().await;
    }

    pub async fn record_failure(&self, provider_id: &str, kind: Kind, reason: &str) {
        self.bump_rpm(provider_id, kind).await;
        let minute = beijing_minute(Utc::now());
        let outcome = format!("error:{reason}");
        {
            let mut pending = self.pending.lock().await;
            *pending
                .audit
                .entry((minute, provider_id.to_string(), kind.as_str(), outcome))
                .or_insert(0) += 1;
            *pending.global.entry(format!("{}_total", kind.as_str())).or_insert(0) += 1;
            *pending.global.entry(format!("{}_error", kind.as_str())).or_insert(0) += 1;
        }
        self.flush_buffered_writes().await;
    }

    /// Composes the three pending maps into a batch of commutative upserts,
    /// clears them before dispatch, and serializes the dispatch itself behind
    /// `flush_lock` so concurrent callers observe FIFO durability of their
    /// batch without holding a mutex across the network call.
    async fn flush_buffered_writes(&self) {
        let (usage, audit, global) = {
            let mut pending = self.pending.lock().await;
            if pending.is_empty() {
                return;
            }
            let usage = std::mem::take(&mut pending.usage);
            let audit = std::mem::take(&mut pending.audit);
            let global = std::mem::take(&mut pending.global);
            (usage, audit, global)
        };

        let _serialize = self.flush_lock.lock().await;
        if let Err(err) = self.dispatch_batch(usage, audit, global).await {
            warn!(?err, "Failed to flush quota batch; counters are best-effort");
        }
    }

    async fn dispatch_batch(
        &self,
        usage: HashMap<(String, String, &'static str), i64>,
        audit: HashMap<(String, String, &'static str, String), i64>,
        global: HashMap<String, i64>,
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        for ((date, provider_id, kind), delta) in usage {
            sqlx::query(
                "INSERT INTO usage_stats (date, provider_id, kind, count) VALUES ($1, $2, $3, $4)
                 ON CONFLICT (date, provider_id, kind)
                 DO UPDATE SET count = usage_stats.count + excluded.count",
            )
            .bind(date)
            .bind(provider_id)
            .bind(kind)
            .bind(delta)
            .execute(&mut *tx)
            .await?;
        }
        for ((minute_bucket, provider_id, kind, outcome), delta) in audit {
            sqlx::query(
                "INSERT INTO request_audit_minute (minute_bucket, provider_id, kind, outcome, count)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (minute_bucket, provider_id, kind, outcome)
                 DO UPDATE SET count = request_audit_minute.count + excluded.count",
            )
            .bind(minute_bucket)
            .bind(provider_id)
            .bind(kind)
            .bind(outcome)
            .bind(delta)
            .execute(&mut *tx)
            .await?;
        }
        for (key, delta) in global {
            sqlx::query(
                "INSERT INTO global_monitor (key, value) VALUES ($1, $2)
                 ON CONFLICT (key) DO UPDATE SET value = global_monitor.value + excluded.value",
            )
            .bind(key)
            .bind(delta)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn set_global(&self, key: &str, value: i64) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO global_monitor (key, value) VALUES ($1, $2)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// RPM is read from the current minute-bucket audit row (summed over all
    /// outcomes) because it is the one source of truth shared across
    /// instances; the in-memory counter is only a same-process fast path.
    async fn rpm_from_store(&self, provider_id: &str, kind: Kind) -> i64 {
        let minute = beijing_minute(Utc::now());
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT COALESCE(SUM(count), 0) FROM request_audit_minute
             WHERE minute_bucket = $1 AND provider_id = $2 AND kind = $3",
        )
        .bind(minute)
        .bind(provider_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await
        .unwrap_or(None);
        row.map(|(v,)| v).unwrap_or(0)
    }

    pub async fn get_usage(&self, provider_id: &str) -> ProviderUsage {
        let mut usage = self.load_usage_from_store(provider_id).await;
        for kind in [Kind::Chat, Kind::Search] {
            let rpm_used = self.rpm_from_store(provider_id, kind).await;
            let (_, rpm_limit) = self.limits(kind);
            let slot = match kind {
                Kind::Chat => &mut usage.chat.rpm,
                Kind::Search => &mut usage.search.rpm,
            };
            slot.used = rpm_used;
            slot.limit = rpm_limit;
            slot.percent = percent_of(rpm_used, rpm_limit);
        }
        usage
    }

    pub async fn get_usage_batch(&self, ids: &[String]) -> HashMap<String, ProviderUsage> {
        let mut result: HashMap<String, ProviderUsage> = ids
            .iter()
            .map(|id| (id.clone(), ProviderUsage::default()))
            .collect();
        if ids.is_empty() {
            return result;
        }

        let date = beijing_date(Utc::now());
        let daily_rows: Vec<(String, String, i64)> = sqlx::query_as(
            "SELECT provider_id, kind, count FROM usage_stats WHERE date = $1 AND provider_id = ANY($2)",
        )
        .bind(&date)
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .unwrap_or_default();
        for (provider_id, kind, count) in daily_rows {
            if let Some(usage) = result.get_mut(&provider_id) {
                let slot = match kind.as_str() {
                    "chat" => &mut usage.chat.daily,
                    "search" => &mut usage.search.daily,
                    _ => continue,
                };
                slot.used = count;
            }
        }

        let minute = beijing_minute(Utc::now());
        let rpm_rows: Vec<(String, String, i64)> = sqlx::query_as(
            "SELECT provider_id, kind, COALESCE(SUM(count), 0) FROM request_audit_minute
             WHERE minute_bucket = $1 AND provider_id = ANY($2)
             GROUP BY provider_id, kind",
        )
        .bind(&minute)
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .unwrap_or_default();
        for (provider_id, kind, count) in rpm_rows {
            if let Some(usage) = result.get_mut(&provider_id) {
                let slot = match kind.as_str() {
                    "chat" => &mut usage.chat.rpm,
                    "search" => &mut usage.search.rpm,
                    _ => continue,
                };
                slot.used = count;
            }
        }

        for usage in result.values_mut() {
            usage.chat.daily.limit = self.config.chat.daily;
            usage.chat.daily.percent = percent_of(usage.chat.daily.used, self.config.chat.daily);
            usage.chat.rpm.limit = self.config.chat.rpm;
            usage.chat.rpm.percent = percent_of(usage.chat.rpm.used, self.config.chat.rpm);
            usage.search.daily.limit = self.config.search.daily;
            usage.search.daily.percent = percent_of(usage.search.daily.used, self.config.search.daily);
            usage.search.rpm.limit = self.config.search.rpm;
            usage.search.rpm.percent = percent_of(usage.search.rpm.used, self.config.search.rpm);
        }

        result
    }

    fn recent_minute_buckets(&self, window_minutes: i64) -> Vec<String> {
        (0..window_minutes)
            .map(|back| beijing_minute(Utc::now() - chrono::Duration::minutes(back)))
            .collect()
    }

    /// Providers with at least one `error:auth_expired` chat outcome and zero
    /// successes within the trailing window — the AlertEngine's auth-failed
    /// candidate set, sorted for stable fingerprinting.
    pub async fn auth_failed_without_success(&self, window_minutes: i64) -> Vec<String> {
        let buckets = self.recent_minute_buckets(window_minutes);
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            "SELECT provider_id, outcome, SUM(count) FROM request_audit_minute
             WHERE kind = 'chat' AND minute_bucket = ANY($1)
             GROUP BY provider_id, outcome",
        )
        .bind(&buckets)
        .fetch_all(&self.pool)
        .await
        .unwrap_or_default();

        let mut auth_failed: HashMap<String, i64> = HashMap::new();
        let mut succeeded: HashMap<String, i64> = HashMap::new();
        for (provider_id, outcome, count) in rows {
            if outcome == "error:auth_expired" {
                *auth_failed.entry(provider_id).or_insert(0) += count;
            } else if outcome == "success" {
                *succeeded.entry(provider_id).or_insert(0) += count;
            }
        }

        let mut flagged: Vec<String> = auth_failed
            .into_iter()
            .filter(|(id, count)| *count > 0 && succeeded.get(id).copied().unwrap_or(0) == 0)
            .map(|(id, _)| id)
            .collect();
        flagged.sort();
        flagged
    }

    /// Today's total chat request count across all providers, for the
    /// daily-quota alert (`total / (providerCount * perAccountDailyLimit)`).
    pub async fn todays_chat_total(&self) -> i64 {
        let date = beijing_date(Utc::now());
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT COALESCE(SUM(count), 0) FROM usage_stats WHERE date = $1 AND kind = 'chat'",
        )
        .bind(date)
        .fetch_optional(&self.pool)
        .await
        .unwrap_or(None);
        row.map(|(v,)| v).unwrap_or(0)
    }

    pub fn chat_daily_limit(&self) -> u32 {
        self.config.chat.daily
    }

    pub async fn get_recent_audit(&self, limit: i64) -> Vec<AuditRow> {
        let query = if self.audit_success_logs {
            "SELECT minute_bucket, provider_id, kind, outcome, count FROM request_audit_minute
             ORDER BY minute_bucket DESC LIMIT $1"
        } else {
            "SELECT minute_bucket, provider_id, kind, outcome, count FROM request_audit_minute
             WHERE outcome <> 'success' ORDER BY minute_bucket DESC LIMIT $1"
        };
        let rows: Vec<(String, String, String, String, i64)> = sqlx::query_as(query)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .unwrap_or_default();
        rows.into_iter()
            .map(|(minute_bucket, provider_id, kind, outcome, count)| AuditRow {
                minute_bucket,
                provider_id,
                kind,
                outcome,
                count,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_is_zero_when_limit_is_zero() {
        assert_eq!(percent_of(1_000_000, 0), 0.0);
    }

    #[test]
    fn percent_is_capped_at_one_hundred() {
        assert_eq!(percent_of(500, 100), 100.0);
    }

    #[test]
    fn kind_label_matches_column_values() {
        assert_eq!(Kind::Chat.as_str(), "chat");
        assert_eq!(Kind::Search.as_str(), "search");
    }
}
