//! Subscriber registry used for change notification.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Handle returned by `subscribe`.
pub type SubscriptionId = u64;

/// Observer of record changes.
pub trait RecordChangeSubscriber: Send + Sync {
    fn on_records_changed(&self, changed_keys: &HashSet<String>);
}

struct Entry {
    dependent_keys: HashSet<String>,
    subscriber: Arc<dyn RecordChangeSubscriber>,
}

/// Subscribers keyed by id, each with its current dependent-key set.
#[derive(Default)]
pub struct SubscriberRegistry {
    next_id: AtomicU64,
    entries: Mutex<HashMap<SubscriptionId, Entry>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<SubscriptionId, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(
        &self,
        dependent_keys: HashSet<String>,
        subscriber: Arc<dyn RecordChangeSubscriber>,
    ) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.entries().insert(
            id,
            Entry {
                dependent_keys,
                subscriber,
            },
        );
        id
    }

    pub fn update(&self, id: SubscriptionId, dependent_keys: HashSet<String>) {
        if let Some(entry) = self.entries().get_mut(&id) {
            entry.dependent_keys = dependent_keys;
        }
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.entries().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke matching subscribers outside the registry lock, so a
    /// subscriber may re-enter the registry from its callback.
    pub fn publish(&self, changed_keys: &HashSet<String>) {
        if changed_keys.is_empty() {
            return;
        }
        let matching: Vec<Arc<dyn RecordChangeSubscriber>> = self
            .entries()
            .values()
            .filter(|entry| keys_intersect(&entry.dependent_keys, changed_keys))
            .map(|entry| entry.subscriber.clone())
            .collect();

        tracing::debug!(
            changed = changed_keys.len(),
            notified = matching.len(),
            "publishing record changes"
        );
        for subscriber in matching {
            subscriber.on_records_changed(changed_keys);
        }
    }
}

/// Intersection test iterating the smaller set into the larger.
pub fn keys_intersect(a: &HashSet<String>, b: &HashSet<String>) -> bool {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    small.iter().any(|key| large.contains(key))
}
