//! Bookkeeping of in-flight calls and live watchers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use strata_core::StrataResult;

/// Something that can be told to fetch again, e.g. a watcher refetched by
/// name after a mutation.
pub trait Refetchable: Send + Sync {
    fn refetch(&self) -> StrataResult<()>;
}

type IdleCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
pub struct CallTracker {
    active_calls: AtomicUsize,
    idle_callback: Mutex<Option<IdleCallback>>,
    watchers: Mutex<HashMap<String, Vec<(u64, Weak<dyn Refetchable>)>>>,
}

impl std::fmt::Debug for CallTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallTracker")
            .field("active_calls", &self.active_call_count())
            .field("active_watchers", &self.active_watcher_count())
            .finish()
    }
}

impl CallTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_call(&self) {
        self.active_calls.fetch_add(1, Ordering::SeqCst);
    }

    /// Fires the idle callback when the last active call goes away.
    pub fn unregister_call(&self) {
        let previous = self
            .active_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if previous == Ok(1) {
            let callback = self
                .idle_callback
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(callback) = callback {
                callback();
            }
        }
    }

    pub fn active_call_count(&self) -> usize {
        self.active_calls.load(Ordering::SeqCst)
    }

    pub fn set_idle_callback(&self, callback: Option<IdleCallback>) {
        *self.idle_callback.lock().unwrap_or_else(PoisonError::into_inner) = callback;
    }

    pub fn register_watcher(&self, operation_name: &str, id: u64, watcher: Weak<dyn Refetchable>) {
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(operation_name.to_string())
            .or_default()
            .push((id, watcher));
    }

    pub fn unregister_watcher(&self, operation_name: &str, id: u64) {
        let mut watchers = self.watchers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entries) = watchers.get_mut(operation_name) {
            entries.retain(|(existing, _)| *existing != id);
            if entries.is_empty() {
                watchers.remove(operation_name);
            }
        }
    }

    /// Live watchers registered under an operation name.
    pub fn watchers_named(&self, operation_name: &str) -> Vec<Arc<dyn Refetchable>> {
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(operation_name)
            .map(|entries| entries.iter().filter_map(|(_, w)| w.upgrade()).collect())
            .unwrap_or_default()
    }

    pub fn active_watcher_count(&self) -> usize {
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_idle_callback_fires_when_last_call_ends() {
        let tracker = CallTracker::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        tracker.set_idle_callback(Some(Arc::new(move || flag.store(true, Ordering::SeqCst))));

        tracker.register_call();
        tracker.register_call();
        tracker.unregister_call();
        assert!(!fired.load(Ordering::SeqCst));
        tracker.unregister_call();
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(tracker.active_call_count(), 0);
    }

    #[test]
    fn test_unregister_never_underflows() {
        let tracker = CallTracker::new();
        tracker.unregister_call();
        assert_eq!(tracker.active_call_count(), 0);
    }

    struct Counter(AtomicUsize);

    impl Refetchable for Counter {
        fn refetch(&self) -> StrataResult<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_watchers_by_name() {
        let tracker = CallTracker::new();
        let watcher: Arc<dyn Refetchable> = Arc::new(Counter(AtomicUsize::new(0)));
        tracker.register_watcher("HeroName", 1, Arc::downgrade(&watcher));

        let found = tracker.watchers_named("HeroName");
        assert_eq!(found.len(), 1);
        found[0].refetch().unwrap();
        assert!(tracker.watchers_named("Other").is_empty());

        tracker.unregister_watcher("HeroName", 1);
        assert_eq!(tracker.active_watcher_count(), 0);
    }
}
