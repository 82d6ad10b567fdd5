//! Record cache trait and statistics.

use std::collections::{BTreeSet, HashSet};

use strata_core::{CacheHeaders, CacheReference, Record, StrataResult};

/// Pluggable backend storing normalized records.
///
/// Implementations are synchronous and internally synchronized; the store
/// facade serializes writers against readers with its own lock, so a cache
/// never observes a torn multi-record merge.
///
/// # Merge contract
///
/// `merge` is a field-wise union. A field whose value differs (including a
/// transition to or from null) is overwritten and reported as
/// `recordKey.fieldKey`; fields absent from the incoming record are untouched.
pub trait NormalizedCache: Send + Sync {
    /// Load one record, or `None` if it is not stored.
    fn load_record(&self, key: &str, headers: &CacheHeaders) -> StrataResult<Option<Record>>;

    /// Load several records, skipping missing ones.
    fn load_records(&self, keys: &[String], headers: &CacheHeaders) -> StrataResult<Vec<Record>> {
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(record) = self.load_record(key, headers)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Merge one record, returning the changed field keys.
    fn merge(&self, record: Record, headers: &CacheHeaders) -> StrataResult<BTreeSet<String>>;

    /// Merge many records, returning the union of changed field keys.
    fn merge_all(
        &self,
        records: Vec<Record>,
        headers: &CacheHeaders,
    ) -> StrataResult<BTreeSet<String>> {
        let mut changed = BTreeSet::new();
        for record in records {
            changed.extend(self.merge(record, headers)?);
        }
        Ok(changed)
    }

    /// Remove a record. With `cascade`, also remove every record reachable
    /// through its references.
    fn remove(&self, key: &str, cascade: bool) -> StrataResult<bool>;

    /// Remove every record.
    fn clear_all(&self) -> StrataResult<()>;

    /// Get cache statistics.
    fn stats(&self) -> CacheStats {
        CacheStats::default()
    }

    /// Every stored record, for debugging.
    fn dump(&self) -> StrataResult<Vec<Record>> {
        Ok(Vec::new())
    }
}

/// Walk references from `key` with an explicit stack, calling `take` on every
/// record to remove. `take` returns the removed record's references, or `None`
/// if nothing was stored under that key.
///
/// Returns whether the root record existed.
pub fn remove_cascading(
    key: &str,
    cascade: bool,
    mut take: impl FnMut(&str) -> StrataResult<Option<Vec<CacheReference>>>,
) -> StrataResult<bool> {
    let mut visited = HashSet::new();
    let mut pending = vec![key.to_string()];
    let mut root_found = false;

    while let Some(current) = pending.pop() {
        if !visited.insert(current.clone()) {
            continue;
        }
        let Some(references) = take(&current)? else {
            continue;
        };
        if current == key {
            root_found = true;
        }
        if cascade {
            pending.extend(references.into_iter().map(|r| r.key().to_string()));
        }
    }

    Ok(root_found)
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
    /// Approximate memory usage in bytes.
    pub memory_bytes: u64,
    /// Number of evictions due to capacity or expiry.
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Combine the statistics of chained members.
    pub fn combine(&self, other: &CacheStats) -> CacheStats {
        CacheStats {
            hits: self.hits + other.hits,
            misses: self.misses + other.misses,
            entry_count: self.entry_count + other.entry_count,
            memory_bytes: self.memory_bytes + other.memory_bytes,
            evictions: self.evictions + other.evictions,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
