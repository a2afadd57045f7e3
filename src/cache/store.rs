//! Pluggable cache storage adapters.
//!
//! The semantic layer in [`super`] only ever talks to the small, total
//! [`CacheStore`] interface; adapters are registered at startup. The
//! in-memory adapter is the default; a Redis adapter is available behind
//! the `redis-cache` feature.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One cached response. Mutable only in `hit_count`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// 16-hex-char truncated SHA-256 of the normalised query text.
    pub query_hash: String,
    /// Original query text, kept for the semantic scan.
    pub query_text: String,
    /// Cached response body.
    pub response: String,
    /// Provider that produced the response.
    pub provider: String,
    /// Model that produced the response.
    pub model: String,
    /// What the original call cost, USD.
    pub cost: f64,
    /// Tokens billed for the original call.
    pub tokens_used: u64,
    /// Creation time, epoch milliseconds.
    pub created_at: u64,
    /// Expiry time, epoch milliseconds; strictly after `created_at`.
    pub expires_at: u64,
    /// Times this entry has been served.
    pub hit_count: u64,
}

impl CacheEntry {
    /// True once `expires_at` is at or before `now_ms`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at <= now_ms
    }
}

/// Storage adapter failure. Never propagated past the semantic layer:
/// lookups degrade to misses and stores to no-ops.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend I/O or protocol error.
    #[error("cache backend error: {0}")]
    Backend(String),
    /// Entry (de)serialisation failed.
    #[error("cache codec error: {0}")]
    Codec(String),
}

/// Total method set every cache backend must implement.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetch an entry by exact key.
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError>;
    /// Insert or replace an entry.
    async fn set(&self, key: &str, entry: CacheEntry) -> Result<(), StoreError>;
    /// Remove an entry; absent keys are not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
    /// Drop everything.
    async fn clear(&self) -> Result<(), StoreError>;
    /// Number of stored entries.
    async fn size(&self) -> Result<usize, StoreError>;
    /// Snapshot of all entries, in no particular order.
    async fn entries(&self) -> Result<Vec<CacheEntry>, StoreError>;
    /// Adapter name for stats ("memory" or "redis").
    fn backend(&self) -> &'static str;
}

/// In-memory adapter over a concurrent map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: DashMap<String, CacheEntry>,
}

impl MemoryStore {
    /// Empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        Ok(self.map.get(key).map(|e| e.value().clone()))
    }

    async fn set(&self, key: &str, entry: CacheEntry) -> Result<(), StoreError> {
        self.map.insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.map.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.map.clear();
        Ok(())
    }

    async fn size(&self) -> Result<usize, StoreError> {
        Ok(self.map.len())
    }

    async fn entries(&self) -> Result<Vec<CacheEntry>, StoreError> {
        Ok(self.map.iter().map(|e| e.value().clone()).collect())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

/// Redis-backed adapter. Entries are stored as JSON under a shared prefix
/// with a Redis-side expiry matching the entry's `expires_at`.
#[cfg(feature = "redis-cache")]
pub struct RedisStore {
    client: redis::Client,
    prefix: String,
}

#[cfg(feature = "redis-cache")]
impl RedisStore {
    /// Connect and verify with a PING.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(|e| StoreError::Backend(e.to_string()))?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        redis::cmd("PING")
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self { client, prefix: "cascade:cache:".to_string() })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, StoreError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[cfg(feature = "redis-cache")]
#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.full_key(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        match raw {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| StoreError::Codec(e.to_string())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, entry: CacheEntry) -> Result<(), StoreError> {
        let json = serde_json::to_string(&entry).map_err(|e| StoreError::Codec(e.to_string()))?;
        let mut conn = self.conn().await?;
        redis::cmd("SET")
            .arg(self.full_key(key))
            .arg(json)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        redis::cmd("PEXPIREAT")
            .arg(self.full_key(key))
            .arg(entry.expires_at)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        redis::cmd("DEL")
            .arg(self.full_key(key))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let keys = self.all_keys().await?;
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("DEL");
        for k in keys {
            cmd.arg(k);
        }
        cmd.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn size(&self) -> Result<usize, StoreError> {
        Ok(self.all_keys().await?.len())
    }

    async fn entries(&self) -> Result<Vec<CacheEntry>, StoreError> {
        let keys = self.all_keys().await?;
        let mut out = Vec::with_capacity(keys.len());
        let mut conn = self.conn().await?;
        for key in keys {
            let raw: Option<String> = redis::cmd("GET")
                .arg(&key)
                .query_async(&mut conn)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            if let Some(json) = raw {
                let entry =
                    serde_json::from_str(&json).map_err(|e| StoreError::Codec(e.to_string()))?;
                out.push(entry);
            }
        }
        Ok(out)
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

#[cfg(feature = "redis-cache")]
impl RedisStore {
    async fn all_keys(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn().await?;
        redis::cmd("KEYS")
            .arg(format!("{}*", self.prefix))
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(hash: &str, text: &str, expires_at: u64) -> CacheEntry {
        CacheEntry {
            query_hash: hash.to_string(),
            query_text: text.to_string(),
            response: "cached".to_string(),
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            cost: 0.001,
            tokens_used: 42,
            created_at: 1000,
            expires_at,
            hit_count: 0,
        }
    }

    #[tokio::test]
    async fn test_memory_store_set_get_delete() {
        let store = MemoryStore::new();
        store.set("k1", entry("k1", "hello", 10_000)).await.expect("set");
        let got = store.get("k1").await.expect("get");
        assert_eq!(got.map(|e| e.query_text), Some("hello".to_string()));

        store.delete("k1").await.expect("delete");
        assert!(store.get("k1").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn test_memory_store_size_and_entries() {
        let store = MemoryStore::new();
        store.set("a", entry("a", "one", 10_000)).await.expect("set");
        store.set("b", entry("b", "two", 10_000)).await.expect("set");
        assert_eq!(store.size().await.expect("size"), 2);
        let mut texts: Vec<String> = store
            .entries()
            .await
            .expect("entries")
            .into_iter()
            .map(|e| e.query_text)
            .collect();
        texts.sort();
        assert_eq!(texts, vec!["one".to_string(), "two".to_string()]);
    }

    #[tokio::test]
    async fn test_memory_store_clear() {
        let store = MemoryStore::new();
        store.set("a", entry("a", "one", 10_000)).await.expect("set");
        store.clear().await.expect("clear");
        assert_eq!(store.size().await.expect("size"), 0);
    }

    #[tokio::test]
    async fn test_memory_store_delete_missing_is_ok() {
        let store = MemoryStore::new();
        assert!(store.delete("ghost").await.is_ok());
    }

    #[test]
    fn test_entry_expiry_boundary() {
        let e = entry("k", "text", 5000);
        assert!(!e.is_expired(4999));
        assert!(e.is_expired(5000), "expires_at <= now must count as expired");
        assert!(e.is_expired(5001));
    }

    #[test]
    fn test_backend_names() {
        assert_eq!(MemoryStore::new().backend(), "memory");
    }
}
