//! Adaptive Cache
//!
//! TTL + usage-scored key/value store for query results:
//! - Lazy expiry on read, proactive sweep on a schedule
//! - Batch eviction: lowest `access_count / (1 + age_seconds)` 25% removed
//! - Deterministic cache keys from canonicalized filter sets
//! - TTL classes for low-churn vs high-churn data
//! - Pluggable payload transform with an identity default

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// One cached value with its bookkeeping
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    /// Stored value (post-transform)
    pub value: V,
    /// Insertion time
    pub created_at: Instant,
    /// Time-to-live from insertion
    pub ttl: Duration,
    /// Estimated payload size
    pub size_bytes: usize,
    /// Reads since insertion
    pub access_count: u64,
    /// Last read time
    pub last_access: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) > self.ttl
    }

    /// Eviction score: frequency blended against age, lower evicts first
    fn eviction_score(&self, now: Instant) -> f64 {
        let age_seconds = now.duration_since(self.created_at).as_secs_f64();
        self.access_count as f64 / (1.0 + age_seconds)
    }
}

/// Cache hit/miss accounting
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Successful reads
    pub hits: u64,
    /// Absent or expired reads
    pub misses: u64,
    /// Entries removed by capacity eviction
    pub evictions: u64,
    /// Entries removed by expiry (lazy or sweep)
    pub expirations: u64,
}

impl CacheStats {
    /// Hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

/// Payload transform applied on insert. The source system's "compression"
/// was effectively an identity step; real hosts may substitute a genuine
/// codec. A transform failure degrades to a dropped insert, never an error.
pub trait PayloadCodec<V>: Send + Sync {
    /// Transform the value before storage
    fn transform(&self, value: V) -> anyhow::Result<V>;
    /// Estimated stored size
    fn size_hint(&self, _value: &V) -> usize {
        std::mem::size_of::<V>()
    }
}

/// Default codec: stores values unchanged
pub struct IdentityCodec;

impl<V> PayloadCodec<V> for IdentityCodec {
    fn transform(&self, value: V) -> anyhow::Result<V> {
        Ok(value)
    }
}

/// TTL scaling classes: low-churn data lives longer, high-churn data shorter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlClass {
    /// User settings and other rarely changing data (x5 base TTL)
    Settings,
    /// Ordinary query results (x1)
    Default,
    /// Search results and other rapidly churning data (x0.5)
    SearchResults,
}

impl TtlClass {
    /// Scale a base TTL for this class
    pub fn scale(&self, base: Duration) -> Duration {
        match self {
            TtlClass::Settings => base * 5,
            TtlClass::Default => base,
            TtlClass::SearchResults => base / 2,
        }
    }
}

/// Deterministic cache key from a canonicalized filter set: sorted
/// `key=value` pairs, pipe-joined, behind a namespace prefix
pub fn filter_cache_key(prefix: &str, filters: &HashMap<String, String>) -> String {
    let mut pairs: Vec<String> = filters.iter().map(|(k, v)| format!("{k}={v}")).collect();
    pairs.sort();
    if pairs.is_empty() {
        prefix.to_string()
    } else {
        format!("{prefix}|{}", pairs.join("|"))
    }
}

/// TTL + usage-scored eviction key/value store.
///
/// The whole map sits behind one mutex so the read-modify-write eviction
/// sequence stays atomic on a multi-threaded runtime.
pub struct AdaptiveCache<V: Clone> {
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
    max_size: Mutex<usize>,
    default_ttl: Duration,
    codec: Arc<dyn PayloadCodec<V>>,
    stats: Mutex<CacheStats>,
}

impl<V: Clone> AdaptiveCache<V> {
    /// Create a cache with the identity payload codec
    pub fn new(max_size: usize, default_ttl: Duration) -> Self {
        Self::with_codec(max_size, default_ttl, Arc::new(IdentityCodec))
    }

    /// Create a cache with a custom payload codec
    pub fn with_codec(
        max_size: usize,
        default_ttl: Duration,
        codec: Arc<dyn PayloadCodec<V>>,
    ) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_size: Mutex::new(max_size.max(1)),
            default_ttl,
            codec,
            stats: Mutex::new(CacheStats::default()),
        }
    }

    /// Insert a value. At capacity, the lowest-scoring 25% of entries
    /// (minimum one) are evicted first. A codec failure drops the insert.
    pub fn set(&self, key: &str, value: V, ttl: Option<Duration>) {
        let value = match self.codec.transform(value) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(key, "cache set dropped, payload transform failed: {e:#}");
                return;
            }
        };
        let now = Instant::now();
        let size_bytes = self.codec.size_hint(&value);
        let mut entries = self.entries.lock();
        let max_size = *self.max_size.lock();
        if !entries.contains_key(key) && entries.len() >= max_size {
            let evicted = evict_batch(&mut entries, now);
            self.stats.lock().evictions += evicted as u64;
        }
        entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                created_at: now,
                ttl: ttl.unwrap_or(self.default_ttl),
                size_bytes,
                access_count: 0,
                last_access: now,
            },
        );
    }

    /// Read a value. Expired entries are removed and reported as a miss.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                let mut stats = self.stats.lock();
                stats.expirations += 1;
                stats.misses += 1;
                None
            }
            Some(entry) => {
                entry.access_count += 1;
                entry.last_access = now;
                let value = entry.value.clone();
                self.stats.lock().hits += 1;
                Some(value)
            }
            None => {
                self.stats.lock().misses += 1;
                None
            }
        }
    }

    /// Whether a live (non-expired) entry exists, without touching its stats
    pub fn has(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .lock()
            .get(key)
            .map(|e| !e.is_expired(now))
            .unwrap_or(false)
    }

    /// Remove an entry; returns whether it existed
    pub fn delete(&self, key: &str) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    /// Remove everything
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Live entry count (expired entries still pending sweep included)
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Proactively remove expired entries; returns how many were removed.
    /// The coordinator schedules this every two minutes.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        let removed = before - entries.len();
        if removed > 0 {
            self.stats.lock().expirations += removed as u64;
            tracing::debug!(removed, "cache sweep removed expired entries");
        }
        removed
    }

    /// Retune capacity on profile reclassification. Shrinking below the
    /// current population triggers eviction on the next insert.
    pub fn set_capacity(&self, max_size: usize) {
        *self.max_size.lock() = max_size.max(1);
    }

    /// Current capacity in entries
    pub fn capacity(&self) -> usize {
        *self.max_size.lock()
    }

    /// Snapshot of hit/miss accounting
    pub fn stats(&self) -> CacheStats {
        self.stats.lock().clone()
    }
}

/// Remove the lowest-scoring 25% of entries (minimum one); returns the count
fn evict_batch<V>(entries: &mut HashMap<String, CacheEntry<V>>, now: Instant) -> usize {
    if entries.is_empty() {
        return 0;
    }
    let mut scored: Vec<(String, f64)> = entries
        .iter()
        .map(|(k, e)| (k.clone(), e.eviction_score(now)))
        .collect();
    scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
    let batch = ((scored.len() as f64) * 0.25).ceil() as usize;
    let batch = batch.max(1);
    for (key, _) in scored.iter().take(batch) {
        entries.remove(key);
    }
    batch
}
