//! Semantic response cache.
//!
//! A pluggable [`CacheStore`] adapter fronted by an exact-hash index and a
//! linear bag-of-words similarity scan:
//!
//! 1. The normalised query text is hashed (SHA-256, truncated to 16 hex
//!    chars). An exact, non-expired match wins with similarity 1.0.
//! 2. Otherwise every non-expired entry is compared by cosine similarity
//!    over token-count vectors; the best match at or above the threshold
//!    (default 0.82) is served.
//!
//! Storage failures are logged and converted to cache misses; they never
//! abort a request. The scan reads a snapshot and may race with concurrent
//! writes — expired entries are filtered on read, so staleness is bounded
//! by TTL. The vectoriser is a seam: swap [`similarity`] for an external
//! embedding service without touching the store protocol.

pub mod store;

pub use store::{CacheEntry, CacheStore, MemoryStore, StoreError};

use crate::epoch_ms;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Semantic cache tuning.
#[derive(Debug, Clone)]
pub struct SemanticCacheConfig {
    /// Minimum cosine similarity for a semantic hit.
    pub similarity_threshold: f64,
    /// Capacity bound; one entry is evicted per store once reached.
    pub max_entries: usize,
    /// TTL applied when the caller does not supply one.
    pub default_ttl_ms: u64,
}

impl Default for SemanticCacheConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.82,
            max_entries: 1000,
            default_ttl_ms: 60 * 60 * 1000,
        }
    }
}

/// A successful lookup: the entry plus how closely it matched.
#[derive(Debug, Clone)]
pub struct CacheLookup {
    /// The cached entry, hit count already bumped.
    pub entry: CacheEntry,
    /// 1.0 for exact hits, cosine similarity otherwise.
    pub similarity: f64,
}

/// Payload for storing a fresh response.
#[derive(Debug, Clone)]
pub struct NewCacheEntry {
    /// Response body to cache.
    pub response: String,
    /// Provider that produced it.
    pub provider: String,
    /// Model that produced it.
    pub model: String,
    /// What the call cost, USD.
    pub cost: f64,
    /// Tokens billed.
    pub tokens_used: u64,
}

/// Counters exposed for stats and metrics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// Entries currently stored.
    pub entries: usize,
    /// Exact-hash hits served.
    pub exact_hits: u64,
    /// Similarity-scan hits served.
    pub semantic_hits: u64,
    /// Lookups that found nothing.
    pub misses: u64,
    /// Adapter failures absorbed as misses or no-ops.
    pub failures: u64,
    /// Hits over total lookups, 0.0 when idle.
    pub hit_rate: f64,
    /// Adapter name.
    pub backend: &'static str,
}

/// The semantic cache core.
pub struct SemanticCache {
    store: Arc<dyn CacheStore>,
    config: SemanticCacheConfig,
    /// Serialises store mutations (eviction + insert, hit-count bumps).
    write_lock: tokio::sync::Mutex<()>,
    exact_hits: AtomicU64,
    semantic_hits: AtomicU64,
    misses: AtomicU64,
    failures: AtomicU64,
}

impl SemanticCache {
    /// Build over any adapter.
    pub fn new(store: Arc<dyn CacheStore>, config: SemanticCacheConfig) -> Self {
        Self {
            store,
            config,
            write_lock: tokio::sync::Mutex::new(()),
            exact_hits: AtomicU64::new(0),
            semantic_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// In-memory cache with the given config.
    pub fn in_memory(config: SemanticCacheConfig) -> Self {
        Self::new(Arc::new(MemoryStore::new()), config)
    }

    /// Truncated SHA-256 key over lowercased, trimmed text.
    pub fn query_hash(text: &str) -> String {
        let normalised = text.trim().to_lowercase();
        let digest = Sha256::digest(normalised.as_bytes());
        let hex = format!("{digest:x}");
        hex[..16].to_string()
    }

    /// Look up a query. Returns `None` on miss, expiry, or adapter failure.
    pub async fn lookup(&self, text: &str) -> Option<CacheLookup> {
        let now = epoch_ms();
        let hash = Self::query_hash(text);

        // Exact index first.
        match self.store.get(&hash).await {
            Ok(Some(entry)) if !entry.is_expired(now) => {
                let entry = self.bump_hit_count(entry).await;
                self.exact_hits.fetch_add(1, Ordering::Relaxed);
                debug!(hash = hash.as_str(), "cache hit (exact)");
                return Some(CacheLookup { entry, similarity: 1.0 });
            }
            Ok(_) => {}
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "cache get failed, treating as miss");
                return None;
            }
        }

        // Linear similarity scan over non-expired entries.
        let entries = match self.store.entries().await {
            Ok(entries) => entries,
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "cache scan failed, treating as miss");
                return None;
            }
        };

        let query_tokens = tokenize(text);
        let mut best: Option<(CacheEntry, f64)> = None;
        for entry in entries.into_iter().filter(|e| !e.is_expired(now)) {
            let sim = similarity(&query_tokens, &tokenize(&entry.query_text));
            if best.as_ref().map_or(true, |(_, b)| sim > *b) {
                best = Some((entry, sim));
            }
        }

        match best {
            Some((entry, sim)) if sim >= self.config.similarity_threshold => {
                let entry = self.bump_hit_count(entry).await;
                self.semantic_hits.fetch_add(1, Ordering::Relaxed);
                debug!(similarity = sim, hash = entry.query_hash.as_str(), "cache hit (semantic)");
                Some(CacheLookup { entry, similarity: sim })
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(hash = hash.as_str(), "cache miss");
                None
            }
        }
    }

    /// Store a response. Evicts the least valuable entry (fewest hits,
    /// oldest first) when at capacity. Failures are absorbed.
    pub async fn store(&self, text: &str, new: NewCacheEntry, ttl_ms: Option<u64>) {
        let _guard = self.write_lock.lock().await;
        let now = epoch_ms();
        let ttl = ttl_ms.unwrap_or(self.config.default_ttl_ms);

        match self.store.size().await {
            Ok(size) if size >= self.config.max_entries => {
                if let Err(e) = self.evict_one().await {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "cache eviction failed, skipping store");
                    return;
                }
            }
            Ok(_) => {}
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "cache size check failed, skipping store");
                return;
            }
        }

        let hash = Self::query_hash(text);
        let entry = CacheEntry {
            query_hash: hash.clone(),
            query_text: text.to_string(),
            response: new.response,
            provider: new.provider,
            model: new.model,
            cost: new.cost,
            tokens_used: new.tokens_used,
            created_at: now,
            expires_at: now + ttl.max(1),
            hit_count: 0,
        };

        if let Err(e) = self.store.set(&hash, entry).await {
            self.failures.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, hash = hash.as_str(), "cache store failed");
        } else {
            debug!(hash = hash.as_str(), ttl_ms = ttl, "cached response");
        }
    }

    /// Delete every expired entry; returns how many were removed.
    pub async fn prune_expired(&self) -> usize {
        let _guard = self.write_lock.lock().await;
        let now = epoch_ms();
        let entries = match self.store.entries().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "cache prune scan failed");
                return 0;
            }
        };
        let mut removed = 0usize;
        for entry in entries.into_iter().filter(|e| e.is_expired(now)) {
            if self.store.delete(&entry.query_hash).await.is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "pruned expired cache entries");
        }
        removed
    }

    /// Drop everything.
    pub async fn clear(&self) {
        let _guard = self.write_lock.lock().await;
        if let Err(e) = self.store.clear().await {
            warn!(error = %e, "cache clear failed");
        }
    }

    /// Snapshot of up to `limit` entries for inspection surfaces.
    pub async fn entries_snapshot(&self, limit: usize) -> Vec<CacheEntry> {
        match self.store.entries().await {
            Ok(mut entries) => {
                // Most recently created first.
                entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                entries.truncate(limit);
                entries
            }
            Err(e) => {
                warn!(error = %e, "cache snapshot failed");
                Vec::new()
            }
        }
    }

    /// Counter snapshot.
    pub async fn stats(&self) -> CacheStats {
        let entries = self.store.size().await.unwrap_or(0);
        let exact = self.exact_hits.load(Ordering::Relaxed);
        let semantic = self.semantic_hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = exact + semantic + misses;
        CacheStats {
            entries,
            exact_hits: exact,
            semantic_hits: semantic,
            misses,
            failures: self.failures.load(Ordering::Relaxed),
            hit_rate: if total == 0 { 0.0 } else { (exact + semantic) as f64 / total as f64 },
            backend: self.store.backend(),
        }
    }

    // ── Internals ──────────────────────────────────────────────────────

    /// Monotonic hit-count bump. A racing bump may overwrite by one; that
    /// is acceptable, the counter never goes backwards from a reader's
    /// point of view.
    async fn bump_hit_count(&self, mut entry: CacheEntry) -> CacheEntry {
        entry.hit_count += 1;
        if let Err(e) = self.store.set(&entry.query_hash, entry.clone()).await {
            warn!(error = %e, "hit count persist failed");
        }
        entry
    }

    /// Evict the entry with the fewest hits, oldest first.
    async fn evict_one(&self) -> Result<(), StoreError> {
        let entries = self.store.entries().await?;
        let victim = entries
            .into_iter()
            .min_by(|a, b| {
                a.hit_count
                    .cmp(&b.hit_count)
                    .then(a.created_at.cmp(&b.created_at))
            });
        if let Some(v) = victim {
            debug!(hash = v.query_hash.as_str(), hits = v.hit_count, "evicting cache entry");
            self.store.delete(&v.query_hash).await?;
        }
        Ok(())
    }
}

// ── Similarity ─────────────────────────────────────────────────────────

/// Lowercase, strip non-word characters, split on whitespace, drop tokens
/// of length <= 1.
fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .filter(|t| t.len() > 1)
        .map(str::to_string)
        .collect()
}

/// Cosine similarity over token-count vectors. The vocabulary is implicit:
/// counting maps give the same dot product as a dense union vector.
fn similarity(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    fn count(tokens: &[String]) -> HashMap<&str, f64> {
        let mut m: HashMap<&str, f64> = HashMap::new();
        for t in tokens {
            *m.entry(t.as_str()).or_insert(0.0) += 1.0;
        }
        m
    }
    let ca = count(a);
    let cb = count(b);
    let dot: f64 = ca
        .iter()
        .filter_map(|(tok, &na)| cb.get(tok).map(|&nb| na * nb))
        .sum();
    let mag = |m: &HashMap<&str, f64>| m.values().map(|v| v * v).sum::<f64>().sqrt();
    let denom = mag(&ca) * mag(&cb);
    if denom < 1e-9 {
        0.0
    } else {
        (dot / denom).clamp(0.0, 1.0)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
