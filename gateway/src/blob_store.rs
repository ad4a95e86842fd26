//! Abstract key-value store with TTL, prefix listing, and a best-effort
//! distributed lock. Credentials, the provider alias cache, and the
//! alert-engine's dedup state all live behind this interface.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum BlobStoreError {
    #[error("blob store transport error: {0}")]
    Transport(#[from] redis::RedisError),
    #[error("failed to decode stored value: {0}")]
    Decode(#[from] serde_json::Error),
}

pub type BlobResult<T> = Result<T, BlobStoreError>;

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get_raw(&self, key: &str) -> BlobResult<Option<String>>;
    async fn set_raw(&self, key: &str, value: String, ttl_secs: Option<u64>) -> BlobResult<()>;
    async fn delete(&self, key: &str) -> BlobResult<()>;
    async fn list_prefix(&self, prefix: &str) -> BlobResult<Vec<String>>;
    /// CAS-like: mint a fresh token, attempt to claim `lock:<name>`, and return
    /// the token only if this call's write won the race. Never blocks.
    async fn acquire(&self, name: &str, ttl_secs: u64) -> BlobResult<Option<String>>;
    /// Release the lock only if its current value still equals `token`.
    async fn release(&self, name: &str, token: &str) -> BlobResult<()>;
}

/// JSON convenience layer over [`BlobStore`]. Kept as a separate extension
/// trait (rather than default methods on `BlobStore` itself) because a
/// generic method on `BlobStore` would make `dyn BlobStore` non-object-safe,
/// and the gateway passes the store around as `Arc<dyn BlobStore>`.
#[async_trait]
pub trait BlobStoreExt: BlobStore {
    async fn get_json<T: DeserializeOwned + Send>(&self, key: &str) -> BlobResult<Option<T>> {
        match self.get_raw(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set_json<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl_secs: Option<u64>,
    ) -> BlobResult<()> {
        let raw = serde_json::to_string(value)?;
        self.set_raw(key, raw, ttl_secs).await
    }
}

impl<T: BlobStore + ?Sized> BlobStoreExt for T {}

#[derive(Clone)]
pub struct RedisBlobStore {
    manager: ConnectionManager,
    prefix: String,
}

impl RedisBlobStore {
    pub async fn connect(redis_url: &str, prefix: impl Into<String>) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self {
            manager,
            prefix: prefix.into(),
        })
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }
}

#[async_trait]
impl BlobStore for RedisBlobStore {
    async fn get_raw(&self, key: &str) -> BlobResult<Option<String>> {
        let mut conn = self.manager.clone();
        let value: Option<String> = conn.get(self.namespaced(key)).await?;
        Ok(value)
    }

    async fn set_raw(&self, key: &str, value: String, ttl_secs: Option<u64>) -> BlobResult<()> {
        let mut conn = self.manager.clone();
        let namespaced = self.namespaced(key);
        match ttl_secs {
            Some(ttl) if ttl > 0 => {
                let _: () = conn.set_ex(namespaced, value, ttl).await?;
            }
            _ => {
                let _: () = conn.set(namespaced, value).await?;
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> BlobResult<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.del(self.namespaced(key)).await?;
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> BlobResult<Vec<String>> {
        let mut conn = self.manager.clone();
        let pattern = format!("{}*", self.namespaced(prefix));
        let keys: Vec<String> = conn.keys(pattern).await?;
        let strip_len = self.prefix.len() + 1;
        Ok(keys
            .into_iter()
            .map(|k| k.chars().skip(strip_len).collect())
            .collect())
    }

    async fn acquire(&self, name: &str, ttl_secs: u64) -> BlobResult<Option<String>> {
        let mut conn = self.manager.clone();
        let token = Uuid::new_v4().to_string();
        let lock_key = self.namespaced(&format!("lock:{name}"));
        // SET NX PX is the atomic primitive; it is equivalent to "set then
        // read back and compare" because only one caller's SET can succeed.
        let claimed: Option<String> = redis::cmd("SET")
            .arg(&lock_key)
            .arg(&token)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs.max(1))
            .query_async(&mut conn)
            .await?;
        Ok(claimed.map(|_| token))
    }

    async fn release(&self, name: &str, token: &str) -> BlobResult<()> {
        let mut conn = self.manager.clone();
        let lock_key = self.namespaced(&format!("lock:{name}"));
        let current: Option<String> = conn.get(&lock_key).await?;
        if current.as_deref() == Some(token) {
            let _: () = conn.del(&lock_key).await?;
        }
        Ok(())
    }
}

/// In-memory implementation used by unit and integration tests; mirrors the
/// Redis semantics closely enough that lock-contention tests exercise real
/// CAS behavior without a Redis instance.
#[derive(Clone, Default)]
pub struct InMemoryBlobStore {
    inner: std::sync::Arc<tokio::sync::Mutex<std::collections::HashMap<String, String>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn get_raw(&self, key: &str) -> BlobResult<Option<String>> {
        Ok(self.inner.lock().await.get(key).cloned())
    }

    async fn set_raw(&self, key: &str, value: String, _ttl_secs: Option<u64>) -> BlobResult<()> {
        self.inner.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> BlobResult<()> {
        self.inner.lock().await.remove(key);
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> BlobResult<Vec<String>> {
        let guard = self.inner.lock().await;
        Ok(guard
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn acquire(&self, name: &str, _ttl_secs: u64) -> BlobResult<Option<String>> {
        let lock_key = format!("lock:{name}");
        let mut guard = self.inner.lock().await;
        if guard.contains_key(&lock_key) {
            return Ok(None);
        }
        let token = Uuid::new_v4().to_string();
        guard.insert(lock_key, token.clone());
        Ok(Some(token))
    }

    async fn release(&self, name: &str, token: &str) -> BlobResult<()> {
        let lock_key = format!("lock:{name}");
        let mut guard = self.inner.lock().await;
        if guard.get(&lock_key).map(|v| v.as_str()) == Some(token) {
            guard.remove(&lock_key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_is_exclusive_until_released() {
        let store = InMemoryBlobStore::new();
        let first = store.acquire("token_refresh:abc", 60).await.unwrap();
        assert!(first.is_some());
        let second = store.acquire("token_refresh:abc", 60).await.unwrap();
        assert!(second.is_none());
        store
            .release("token_refresh:abc", &first.unwrap())
            .await
            .unwrap();
        let third = store.acquire("token_refresh:abc", 60).await.unwrap();
        assert!(third.is_some());
    }

    #[tokio::test]
    async fn release_with_stale_token_is_a_no_op() {
        let store = InMemoryBlobStore::new();
        let token = store.acquire("lock-a", 60).await.unwrap().unwrap();
        store.release("lock-a", "not-the-token").await.unwrap();
        // still held: a second acquire should fail
        assert!(store.acquire("lock-a", 60).await.unwrap().is_none());
        store.release("lock-a", &token).await.unwrap();
        assert!(store.acquire("lock-a", 60).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn list_prefix_reflects_set_and_delete() {
        let store = InMemoryBlobStore::new();
        store
            .set_raw("qwen_creds_aaaaaaaa.json", "{}".into(), None)
            .await
            .unwrap();
        let listed = store.list_prefix("qwen_creds_").await.unwrap();
        assert_eq!(listed, vec!["qwen_creds_aaaaaaaa.json".to_string()]);
        store.delete("qwen_creds_aaaaaaaa.json").await.unwrap();
        let listed = store.list_prefix("qwen_creds_").await.unwrap();
        assert!(listed.is_empty());
    }
}
