//! Weak-valued registry of prunable resources.
//!
//! Tracks resources that accumulate reclaimable state without owning them:
//! entries hold `Weak` references, so a resource disappears from the
//! registry as soon as its strong holder drops it. Lookups purge dead
//! entries from the bucket they touch.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};
use std::sync::{Arc, Weak};

use log::warn;
use parking_lot::Mutex;

const BUCKETS: usize = 64;

/// A resource from which obsolete state can be reclaimed.
pub trait Prune {
    fn prune(&self) -> anyhow::Result<()>;
}

/// Bucketed, weak-valued map from `K` to prunable resources.
///
/// Each bucket has its own lock; a global [`prune_all`](Self::prune_all)
/// never holds any bucket lock while a resource's `prune` runs.
pub struct PruneRegistry<K, T> {
    buckets: Vec<Mutex<Vec<(K, Weak<T>)>>>,
    hasher: RandomState,
}

impl<K: Hash + Eq, T: Prune> PruneRegistry<K, T> {
    pub fn new() -> Self {
        Self {
            buckets: (0..BUCKETS).map(|_| Mutex::new(Vec::new())).collect(),
            hasher: RandomState::new(),
        }
    }

    fn bucket(&self, key: &K) -> &Mutex<Vec<(K, Weak<T>)>> {
        let idx = self.hasher.hash_one(key) as usize % BUCKETS;
        &self.buckets[idx]
    }

    /// Register `value` under `key`, replacing any previous entry.
    pub fn insert(&self, key: K, value: &Arc<T>) {
        let mut bucket = self.bucket(&key).lock();
        bucket.retain(|(k, weak)| *k != key && weak.strong_count() > 0);
        bucket.push((key, Arc::downgrade(value)));
    }

    /// Look up the live resource under `key`.
    ///
    /// Entries whose resource has been dropped are removed from the bucket,
    /// wherever in the bucket they sit.
    pub fn get(&self, key: &K) -> Option<Arc<T>> {
        let mut bucket = self.bucket(key).lock();
        bucket.retain(|(_, weak)| weak.strong_count() > 0);
        bucket
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, weak)| weak.upgrade())
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.buckets
            .iter()
            .map(|b| b.lock().iter().filter(|(_, w)| w.strong_count() > 0).count())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Prune every live resource.
    ///
    /// Live values are snapshotted bucket by bucket first; `prune` runs with
    /// no bucket lock held. Per-resource failures are logged and do not stop
    /// the sweep.
    pub fn prune_all(&self) {
        let mut live = Vec::new();
        for bucket in &self.buckets {
            let mut bucket = bucket.lock();
            bucket.retain(|(_, weak)| weak.strong_count() > 0);
            live.extend(bucket.iter().filter_map(|(_, weak)| weak.upgrade()));
        }
        for resource in live {
            if let Err(e) = resource.prune() {
                warn!("prune failed: {e:#}");
            }
        }
    }
}

impl<K: Hash + Eq, T: Prune> Default for PruneRegistry<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter {
        pruned: AtomicUsize,
        fail: bool,
    }

    impl Prune for Counter {
        fn prune(&self) -> anyhow::Result<()> {
            self.pruned.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("prune refused");
            }
            Ok(())
        }
    }

    #[test]
    fn lookup_returns_live_entries_only() {
        let registry = PruneRegistry::new();
        let kept = Arc::new(Counter::default());
        let dropped = Arc::new(Counter::default());

        registry.insert(1u32, &kept);
        registry.insert(2u32, &dropped);
        assert_eq!(registry.len(), 2);

        drop(dropped);
        assert!(registry.get(&2).is_none());
        assert!(registry.get(&1).is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn insert_replaces_same_key() {
        let registry = PruneRegistry::new();
        let first = Arc::new(Counter::default());
        let second = Arc::new(Counter::default());

        registry.insert(7u32, &first);
        registry.insert(7u32, &second);
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.get(&7).unwrap(), &second));
    }

    #[test]
    fn prune_all_visits_live_and_survives_failures() {
        let registry = PruneRegistry::new();
        let ok = Arc::new(Counter::default());
        let failing = Arc::new(Counter {
            pruned: AtomicUsize::new(0),
            fail: true,
        });
        let gone = Arc::new(Counter::default());

        registry.insert(1u32, &ok);
        registry.insert(2u32, &failing);
        registry.insert(3u32, &gone);
        drop(gone);

        registry.prune_all();
        assert_eq!(ok.pruned.load(Ordering::SeqCst), 1);
        assert_eq!(failing.pruned.load(Ordering::SeqCst), 1);
    }
}
