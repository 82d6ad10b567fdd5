//! Bounded in-memory record cache.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use lru::LruCache;
use strata_core::{CacheHeaders, EvictionConfig, Record, StorageError, StrataResult};

use super::traits::{remove_cascading, CacheStats, NormalizedCache};

/// Bounds applied by [`LruNormalizedCache`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionPolicy {
    pub max_entries: Option<usize>,
    pub max_size_bytes: Option<u64>,
    pub expire_after_write: Option<Duration>,
    pub expire_after_access: Option<Duration>,
}

impl EvictionPolicy {
    /// Never evict.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries);
        self
    }

    pub fn with_max_size_bytes(mut self, max_size_bytes: u64) -> Self {
        self.max_size_bytes = Some(max_size_bytes);
        self
    }

    pub fn with_expire_after_write(mut self, ttl: Duration) -> Self {
        self.expire_after_write = Some(ttl);
        self
    }

    pub fn with_expire_after_access(mut self, ttl: Duration) -> Self {
        self.expire_after_access = Some(ttl);
        self
    }
}

impl From<&EvictionConfig> for EvictionPolicy {
    fn from(config: &EvictionConfig) -> Self {
        Self {
            max_entries: config.max_entries,
            max_size_bytes: config.max_size_bytes,
            expire_after_write: config.expire_after_write(),
            expire_after_access: config.expire_after_access(),
        }
    }
}

struct Entry {
    record: Record,
    size: u64,
    written_at: DateTime<Utc>,
    accessed_at: DateTime<Utc>,
}

struct Inner {
    entries: LruCache<String, Entry>,
    total_bytes: u64,
    stats: CacheStats,
}

impl Inner {
    fn pop(&mut self, key: &str) -> Option<Entry> {
        let entry = self.entries.pop(key)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.size);
        Some(entry)
    }
}

/// LRU record cache bounded by entry count, estimated size and age.
pub struct LruNormalizedCache {
    inner: Mutex<Inner>,
    policy: EvictionPolicy,
}

impl LruNormalizedCache {
    pub fn new(policy: EvictionPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                total_bytes: 0,
                stats: CacheStats::default(),
            }),
            policy,
        }
    }

    pub fn unbounded() -> Self {
        Self::new(EvictionPolicy::none())
    }

    pub fn policy(&self) -> &EvictionPolicy {
        &self.policy
    }

    fn lock(&self) -> StrataResult<MutexGuard<'_, Inner>> {
        Ok(self.inner.lock().map_err(|_| StorageError::LockPoisoned)?)
    }

    fn is_expired(&self, entry: &Entry, now: DateTime<Utc>) -> bool {
        let written = self
            .policy
            .expire_after_write
            .map(|ttl| now - entry.written_at > ttl)
            .unwrap_or(false);
        let accessed = self
            .policy
            .expire_after_access
            .map(|ttl| now - entry.accessed_at > ttl)
            .unwrap_or(false);
        written || accessed
    }

    fn enforce_bounds(&self, inner: &mut Inner) {
        loop {
            let over_entries = self
                .policy
                .max_entries
                .map(|max| inner.entries.len() > max)
                .unwrap_or(false);
            let over_bytes = self
                .policy
                .max_size_bytes
                .map(|max| inner.total_bytes > max)
                .unwrap_or(false);
            if !(over_entries || over_bytes) {
                break;
            }
            let Some((key, entry)) = inner.entries.pop_lru() else {
                break;
            };
            inner.total_bytes = inner.total_bytes.saturating_sub(entry.size);
            inner.stats.evictions += 1;
            tracing::trace!(key = %key, "evicted record");
        }
    }
}

impl Default for LruNormalizedCache {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl NormalizedCache for LruNormalizedCache {
    fn load_record(&self, key: &str, headers: &CacheHeaders) -> StrataResult<Option<Record>> {
        let mut inner = self.lock()?;
        let now = Utc::now();

        let expired = match inner.entries.peek(key) {
            Some(entry) => self.is_expired(entry, now),
            None => {
                inner.stats.misses += 1;
                return Ok(None);
            }
        };
        if expired {
            inner.pop(key);
            inner.stats.evictions += 1;
            inner.stats.misses += 1;
            return Ok(None);
        }

        let record = match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.accessed_at = now;
                entry.record.clone()
            }
            None => return Ok(None),
        };
        inner.stats.hits += 1;

        if headers.evict_after_read() {
            inner.pop(key);
        }
        Ok(Some(record))
    }

    fn merge(&self, record: Record, headers: &CacheHeaders) -> StrataResult<BTreeSet<String>> {
        if headers.do_not_store() {
            return Ok(BTreeSet::new());
        }
        let mut inner = self.lock()?;
        let now = Utc::now();

        let key = record.key().to_string();
        let previous = inner
            .pop(&key)
            .filter(|entry| !self.is_expired(entry, now))
            .map(|entry| entry.record);

        let (stored, changed) = match previous {
            Some(mut existing) => {
                let changed = existing.merge_from(&record);
                (existing, changed)
            }
            None => {
                let changed = record.field_keys();
                (record, changed)
            }
        };

        let size = stored.size_estimate() as u64;
        inner.total_bytes += size;
        inner.entries.push(
            key,
            Entry {
                record: stored,
                size,
                written_at: now,
                accessed_at: now,
            },
        );
        self.enforce_bounds(&mut inner);
        Ok(changed)
    }

    fn remove(&self, key: &str, cascade: bool) -> StrataResult<bool> {
        let mut inner = self.lock()?;
        remove_cascading(key, cascade, |k| {
            Ok(inner.pop(k).map(|entry| entry.record.references()))
        })
    }

    fn clear_all(&self) -> StrataResult<()> {
        let mut inner = self.lock()?;
        inner.entries.clear();
        inner.total_bytes = 0;
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        match self.inner.lock() {
            Ok(inner) => CacheStats {
                entry_count: inner.entries.len() as u64,
                memory_bytes: inner.total_bytes,
                ..inner.stats.clone()
            },
            Err(_) => CacheStats::default(),
        }
    }

    fn dump(&self) -> StrataResult<Vec<Record>> {
        let inner = self.lock()?;
        Ok(inner.entries.iter().map(|(_, e)| e.record.clone()).collect())
    }
}
