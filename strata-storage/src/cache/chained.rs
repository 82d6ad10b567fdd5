//! Chained caches with read-through repopulation.
//!
//! Members are ordered fastest first. A read that misses the front members
//! but hits a later one copies the record forward; writes, removals and
//! clears reach every member.

use std::collections::BTreeSet;
use std::sync::Arc;

use strata_core::{CacheHeaders, Record, StrataResult};

use super::traits::{remove_cascading, CacheStats, NormalizedCache};

#[derive(Clone)]
pub struct ChainedCache {
    members: Vec<Arc<dyn NormalizedCache>>,
}

impl ChainedCache {
    pub fn new(front: Arc<dyn NormalizedCache>) -> Self {
        Self {
            members: vec![front],
        }
    }

    /// Append a slower member behind the existing ones.
    pub fn chain(mut self, next: Arc<dyn NormalizedCache>) -> Self {
        self.members.push(next);
        self
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl NormalizedCache for ChainedCache {
    fn load_record(&self, key: &str, headers: &CacheHeaders) -> StrataResult<Option<Record>> {
        for (index, member) in self.members.iter().enumerate() {
            let Some(record) = member.load_record(key, headers)? else {
                continue;
            };
            if !headers.evict_after_read() {
                for earlier in &self.members[..index] {
                    earlier.merge(record.clone(), &CacheHeaders::none())?;
                }
            }
            if index > 0 {
                tracing::trace!(key = %key, member = index, "repopulated front cache");
            }
            return Ok(Some(record));
        }
        Ok(None)
    }

    fn merge(&self, record: Record, headers: &CacheHeaders) -> StrataResult<BTreeSet<String>> {
        let mut changed = BTreeSet::new();
        for member in &self.members {
            changed.extend(member.merge(record.clone(), headers)?);
        }
        Ok(changed)
    }

    fn remove(&self, key: &str, cascade: bool) -> StrataResult<bool> {
        // Members may hold different subsets, so references are gathered
        // from every member before each one drops the record.
        remove_cascading(key, cascade, |current| {
            let mut references = Vec::new();
            let mut found = false;
            for member in &self.members {
                if let Some(record) = member.load_record(current, &CacheHeaders::none())? {
                    references.extend(record.references());
                    found = true;
                }
                found |= member.remove(current, false)?;
            }
            Ok(found.then_some(references))
        })
    }

    fn clear_all(&self) -> StrataResult<()> {
        for member in &self.members {
            member.clear_all()?;
        }
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        self.members
            .iter()
            .fold(CacheStats::default(), |acc, m| acc.combine(&m.stats()))
    }

    fn dump(&self) -> StrataResult<Vec<Record>> {
        let mut seen = std::collections::HashSet::new();
        let mut records = Vec::new();
        for member in &self.members {
            for record in member.dump()? {
                if seen.insert(record.key().to_string()) {
                    records.push(record);
                }
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::LruNormalizedCache;
    use serde_json::json;
    use strata_core::FieldValue;

    fn chain() -> (Arc<LruNormalizedCache>, Arc<LruNormalizedCache>, ChainedCache) {
        let front = Arc::new(LruNormalizedCache::unbounded());
        let back = Arc::new(LruNormalizedCache::unbounded());
        let chained = ChainedCache::new(front.clone()).chain(back.clone());
        (front, back, chained)
    }

    #[test]
    fn test_read_through_repopulates_front() {
        let (front, back, chained) = chain();
        back.merge(
            Record::builder("1000").scalar("name", json!("Luke")).build(),
            &CacheHeaders::none(),
        )
        .unwrap();

        assert!(front.load_record("1000", &CacheHeaders::none()).unwrap().is_none());
        assert!(chained.load_record("1000", &CacheHeaders::none()).unwrap().is_some());
        assert!(front.load_record("1000", &CacheHeaders::none()).unwrap().is_some());
    }

    #[test]
    fn test_writes_reach_every_member() {
        let (front, back, chained) = chain();
        chained
            .merge(
                Record::builder("1000").scalar("name", json!("Luke")).build(),
                &CacheHeaders::none(),
            )
            .unwrap();
        assert!(front.load_record("1000", &CacheHeaders::none()).unwrap().is_some());
        assert!(back.load_record("1000", &CacheHeaders::none()).unwrap().is_some());
    }

    #[test]
    fn test_cascade_uses_references_from_any_member() {
        let (front, back, chained) = chain();
        back.merge(
            Record::builder("a").field("b", FieldValue::reference("b")).build(),
            &CacheHeaders::none(),
        )
        .unwrap();
        front
            .merge(Record::builder("b").scalar("x", json!(1)).build(), &CacheHeaders::none())
            .unwrap();

        assert!(chained.remove("a", true).unwrap());
        assert!(front.load_record("b", &CacheHeaders::none()).unwrap().is_none());
        assert!(back.load_record("a", &CacheHeaders::none()).unwrap().is_none());
    }

    #[test]
    fn test_clear_all_clears_members() {
        let (front, back, chained) = chain();
        chained
            .merge(Record::builder("a").scalar("x", json!(1)).build(), &CacheHeaders::none())
            .unwrap();
        chained.clear_all().unwrap();
        assert_eq!(front.stats().entry_count + back.stats().entry_count, 0);
    }
}
