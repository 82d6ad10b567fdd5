//! Optimistic layer over a base cache.
//!
//! Speculative writes never touch the base cache. Each record key with
//! pending patches owns a journal: the patches in application order plus a
//! snapshot folding them together. Reads overlay the snapshot on the base
//! record, so rolling back one mutation id only has to drop that id's
//! patches and refold the rest; fields written by other mutations or by
//! confirmed merges are never disturbed.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use strata_core::{CacheHeaders, Record, StorageError, StrataResult};
use uuid::Uuid;

use super::traits::{remove_cascading, CacheStats, NormalizedCache};

struct Journal {
    snapshot: Record,
    patches: Vec<Record>,
}

impl Journal {
    fn new(patch: Record) -> Self {
        Self {
            snapshot: patch.clone(),
            patches: vec![patch],
        }
    }

    fn apply(&mut self, patch: Record) -> BTreeSet<String> {
        let changed = self.snapshot.merge_from(&patch);
        self.patches.push(patch);
        changed
    }

    /// Drop the patches of `mutation_id`, returning the fields they touched.
    fn revert(&mut self, mutation_id: Uuid) -> BTreeSet<String> {
        let (removed, kept): (Vec<Record>, Vec<Record>) = std::mem::take(&mut self.patches)
            .into_iter()
            .partition(|patch| patch.mutation_id() == Some(mutation_id));
        self.patches = kept;
        if removed.is_empty() {
            return BTreeSet::new();
        }

        let mut snapshot = Record::new(self.snapshot.key());
        for patch in &self.patches {
            snapshot.merge_from(patch);
        }
        self.snapshot = snapshot;

        removed.iter().flat_map(Record::field_keys).collect()
    }
}

pub struct OptimisticCache {
    base: Arc<dyn NormalizedCache>,
    journals: RwLock<HashMap<String, Journal>>,
}

impl OptimisticCache {
    pub fn new(base: Arc<dyn NormalizedCache>) -> Self {
        Self {
            base,
            journals: RwLock::new(HashMap::new()),
        }
    }

    pub fn base(&self) -> &Arc<dyn NormalizedCache> {
        &self.base
    }

    fn read_journals(&self) -> StrataResult<RwLockReadGuard<'_, HashMap<String, Journal>>> {
        Ok(self.journals.read().map_err(|_| StorageError::LockPoisoned)?)
    }

    fn write_journals(&self) -> StrataResult<RwLockWriteGuard<'_, HashMap<String, Journal>>> {
        Ok(self.journals.write().map_err(|_| StorageError::LockPoisoned)?)
    }

    /// Apply speculative records. Each record should carry its mutation id.
    pub fn merge_optimistic(&self, records: Vec<Record>) -> StrataResult<BTreeSet<String>> {
        let mut journals = self.write_journals()?;
        let mut changed = BTreeSet::new();
        for record in records {
            match journals.get_mut(record.key()) {
                Some(journal) => changed.extend(journal.apply(record)),
                None => {
                    changed.extend(record.field_keys());
                    journals.insert(record.key().to_string(), Journal::new(record));
                }
            }
        }
        Ok(changed)
    }

    /// Remove every patch tagged with `mutation_id`.
    ///
    /// Journals left without patches are dropped, so records that only the
    /// patch created disappear entirely. Calling this twice is a no-op.
    pub fn rollback(&self, mutation_id: Uuid) -> StrataResult<BTreeSet<String>> {
        let mut journals = self.write_journals()?;
        let mut changed = BTreeSet::new();
        for journal in journals.values_mut() {
            changed.extend(journal.revert(mutation_id));
        }
        journals.retain(|_, journal| !journal.patches.is_empty());
        Ok(changed)
    }

    /// Number of record keys with pending patches.
    pub fn pending_keys(&self) -> usize {
        self.journals.read().map(|j| j.len()).unwrap_or(0)
    }
}

impl NormalizedCache for OptimisticCache {
    fn load_record(&self, key: &str, headers: &CacheHeaders) -> StrataResult<Option<Record>> {
        let base = self.base.load_record(key, headers)?;
        let journals = self.read_journals()?;
        Ok(match (base, journals.get(key)) {
            (Some(mut record), Some(journal)) => {
                record.merge_from(&journal.snapshot);
                Some(record)
            }
            (None, Some(journal)) => Some(journal.snapshot.clone()),
            (base, None) => base,
        })
    }

    fn merge(&self, record: Record, headers: &CacheHeaders) -> StrataResult<BTreeSet<String>> {
        self.base.merge(record, headers)
    }

    fn merge_all(
        &self,
        records: Vec<Record>,
        headers: &CacheHeaders,
    ) -> StrataResult<BTreeSet<String>> {
        self.base.merge_all(records, headers)
    }

    fn remove(&self, key: &str, cascade: bool) -> StrataResult<bool> {
        let mut journals = self.write_journals()?;
        remove_cascading(key, cascade, |current| {
            let overlay = journals.remove(current);
            let stored = self.base.load_record(current, &CacheHeaders::none())?;
            let removed = self.base.remove(current, false)?;
            if overlay.is_none() && stored.is_none() && !removed {
                return Ok(None);
            }
            let mut references = overlay.map(|j| j.snapshot.references()).unwrap_or_default();
            references.extend(stored.map(|r| r.references()).unwrap_or_default());
            Ok(Some(references))
        })
    }

    fn clear_all(&self) -> StrataResult<()> {
        self.write_journals()?.clear();
        self.base.clear_all()
    }

    fn stats(&self) -> CacheStats {
        self.base.stats()
    }

    fn dump(&self) -> StrataResult<Vec<Record>> {
        let journals = self.read_journals()?;
        let mut records = self.base.dump()?;
        for record in records.iter_mut() {
            if let Some(journal) = journals.get(record.key()) {
                record.merge_from(&journal.snapshot);
            }
        }
        let stored: std::collections::HashSet<String> =
            records.iter().map(|r| r.key().to_string()).collect();
        for (key, journal) in journals.iter() {
            if !stored.contains(key) {
                records.push(journal.snapshot.clone());
            }
        }
        Ok(records)
    }
}
