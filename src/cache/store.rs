//! Byte-bounded fingerprint cache with tiered eviction

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Access count above which an entry is promoted to HOT
const HOT_THRESHOLD: u64 = 10;
/// Access count above which an entry is promoted to WARM
const WARM_THRESHOLD: u64 = 5;
/// Idle time after which the sweep demotes an entry to ARCHIVE
const ARCHIVE_AFTER: Duration = Duration::from_secs(600);

/// Cache errors
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("entry of {size} bytes exceeds cache capacity of {capacity} bytes")]
    EntryTooLarge { size: usize, capacity: u64 },

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Heat classification driving eviction order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    Hot,
    Warm,
    Cold,
    Archive,
}

struct Entry {
    payload: Vec<u8>,
    size: usize,
    access_count: u64,
    inserted_at: Instant,
    last_access: Instant,
    expires_at: Option<Instant>,
    tags: HashSet<String>,
    tier: CacheTier,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| at < now)
    }

    fn promote(&mut self) {
        self.tier = if self.access_count > HOT_THRESHOLD {
            CacheTier::Hot
        } else if self.access_count > WARM_THRESHOLD {
            CacheTier::Warm
        } else {
            CacheTier::Cold
        };
    }
}

/// Counters exposed through the status payload
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStats {
    /// Hit fraction over all lookups so far
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CacheInner {
    entries: HashMap<String, Entry>,
    current_bytes: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// Content-addressed artifact store bounded by a byte ceiling
///
/// One mutex guards all state; every operation takes it for the duration of
/// the call, which keeps eviction decisions and size accounting atomic.
pub struct FingerprintCache {
    inner: Mutex<CacheInner>,
    capacity_bytes: u64,
}

impl FingerprintCache {
    /// Create a cache bounded at `capacity_bytes`
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                current_bytes: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
            capacity_bytes,
        }
    }

    /// Look up a fingerprint
    ///
    /// A hit bumps the access counter, refreshes recency, and re-evaluates
    /// the entry's tier. An entry found expired is removed inline and
    /// reported as a miss.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let expired = match inner.entries.get(key) {
            Some(entry) => entry.is_expired(now),
            None => {
                inner.misses += 1;
                return None;
            }
        };

        if expired {
            if let Some(entry) = inner.entries.remove(key) {
                inner.current_bytes = inner.current_bytes.saturating_sub(entry.size as u64);
            }
            inner.misses += 1;
            return None;
        }

        inner.hits += 1;
        let entry = inner.entries.get_mut(key)?;
        entry.access_count += 1;
        entry.last_access = now;
        entry.promote();
        Some(entry.payload.clone())
    }

    /// Insert a payload under a fingerprint
    ///
    /// Evicts per the hybrid policy until the entry fits. Replacing an
    /// existing key subtracts the prior size before the fit check.
    pub fn insert(
        &self,
        key: &str,
        payload: Vec<u8>,
        ttl: Option<Duration>,
        tags: impl IntoIterator<Item = String>,
    ) -> CacheResult<()> {
        let size = payload.len();
        if size as u64 > self.capacity_bytes {
            return Err(CacheError::EntryTooLarge {
                size,
                capacity: self.capacity_bytes,
            });
        }

        let now = Instant::now();
        let mut inner = self.inner.lock();

        if let Some(prior) = inner.entries.remove(key) {
            inner.current_bytes = inner.current_bytes.saturating_sub(prior.size as u64);
        }

        while inner.current_bytes + size as u64 > self.capacity_bytes && !inner.entries.is_empty()
        {
            Self::evict_one(&mut inner, now);
        }

        inner.current_bytes += size as u64;
        inner.entries.insert(
            key.to_string(),
            Entry {
                payload,
                size,
                access_count: 0,
                inserted_at: now,
                last_access: now,
                expires_at: ttl.map(|ttl| now + ttl),
                tags: tags.into_iter().collect(),
                tier: CacheTier::Cold,
            },
        );
        Ok(())
    }

    /// Evict exactly one entry per the hybrid policy:
    /// expired first, then coldest by (access count, oldest insert) among
    /// COLD/ARCHIVE, then least recently accessed overall.
    fn evict_one(inner: &mut CacheInner, now: Instant) {
        let victim = inner
            .entries
            .iter()
            .find(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .or_else(|| {
                inner
                    .entries
                    .iter()
                    .filter(|(_, e)| matches!(e.tier, CacheTier::Cold | CacheTier::Archive))
                    .min_by_key(|(_, e)| (e.access_count, e.inserted_at))
                    .map(|(k, _)| k.clone())
            })
            .or_else(|| {
                inner
                    .entries
                    .iter()
                    .min_by_key(|(_, e)| e.last_access)
                    .map(|(k, _)| k.clone())
            });

        if let Some(key) = victim {
            if let Some(entry) = inner.entries.remove(&key) {
                inner.current_bytes = inner.current_bytes.saturating_sub(entry.size as u64);
                inner.evictions += 1;
                tracing::debug!(key = %key, tier = ?entry.tier, "evicted cache entry");
            }
        }
    }

    /// Remove every entry whose tag set intersects `tags`; returns the count
    pub fn invalidate_tags(&self, tags: &[String]) -> usize {
        let mut inner = self.inner.lock();
        let keys: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| tags.iter().any(|t| e.tags.contains(t)))
            .map(|(k, _)| k.clone())
            .collect();

        for key in &keys {
            if let Some(entry) = inner.entries.remove(key) {
                inner.current_bytes = inner.current_bytes.saturating_sub(entry.size as u64);
            }
        }
        keys.len()
    }

    /// Drop expired entries and demote long-idle ones to ARCHIVE
    ///
    /// Called by the controller's cleanup worker; returns the number of
    /// expired entries removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            if let Some(entry) = inner.entries.remove(key) {
                inner.current_bytes = inner.current_bytes.saturating_sub(entry.size as u64);
            }
        }

        for entry in inner.entries.values_mut() {
            if now.duration_since(entry.last_access) > ARCHIVE_AFTER {
                entry.tier = CacheTier::Archive;
            }
        }

        expired.len()
    }

    /// Current counters
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.entries.len(),
            bytes: inner.current_bytes,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
        }
    }

    /// Tier of an entry, for diagnostics
    pub fn tier_of(&self, key: &str) -> Option<CacheTier> {
        self.inner.lock().entries.get(key).map(|e| e.tier)
    }

    /// Remove everything
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.current_bytes = 0;
    }
}
