//! Durable table of known account IDs and aliases. Self-heals from historical
//! usage rows when empty, converting the first light scan after a fresh
//! deploy into a migration point instead of an empty-pool 500.

use chrono::Utc;
use sqlx::PgPool;
use tracing::warn;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProviderRecord {
    pub id: String,
    pub alias: Option<String>,
    pub updated_at: chrono::DateTime<Utc>,
}

#[derive(Clone)]
pub struct ProviderRegistry {
    pool: PgPool,
}

impl ProviderRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS providers (
                id TEXT PRIMARY KEY,
                alias TEXT,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list(&self) -> anyhow::Result<Vec<ProviderRecord>> {
        let rows = sqlx::query_as::<_, ProviderRecord>(
            "SELECT id, alias, updated_at FROM providers ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Insert or touch `updated_at` for an account ID discovered during a scan.
    pub async fn upsert_id(&self, id: &str) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO providers (id, updated_at) VALUES ($1, now())
             ON CONFLICT (id) DO UPDATE SET updated_at = EXCLUDED.updated_at",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_alias(&self, id: &str, alias: Option<&str>) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO providers (id, alias, updated_at) VALUES ($1, $2, now())
             ON CONFLICT (id) DO UPDATE SET alias = EXCLUDED.alias, updated_at = EXCLUDED.updated_at",
        )
        .bind(id)
        .bind(alias)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove(&self, id: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM providers WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn is_empty(&self) -> anyhow::Result<bool> {
        let row: (i64,) = sqlx::query_as("SELECT count(*) FROM providers")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0 == 0)
    }

    /// Bootstrap provider IDs from historical `usage_stats` rows when the
    /// registry is empty and no static seed list is configured, so a fresh
    /// deploy against an already-populated audit store does not start with an
    /// empty pool.
    pub async fn self_heal_from_usage(&self) -> anyhow::Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT provider_id FROM usage_stats")
                .fetch_all(&self.pool)
                .await?;
        let ids: Vec<String> = rows.into_iter().map(|(id,)| id).collect();
        if ids.is_empty() {
            return Ok(ids);
        }
        warn!(count = ids.len(), "Self-healing provider registry from usage history");
        for id in &ids {
            self.upsert_id(id).await?;
        }
        Ok(ids)
    }
}
