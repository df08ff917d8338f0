//! In-memory caches: the segment cache and a generic LRU.

use crate::error::Result;
use crate::segment::{Segment, SegmentId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Cache hit/miss counters.
#[derive(Debug, Default)]
pub struct Stats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Stats {
    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns `(hits, misses)`.
    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

/// A weight-bounded LRU map.
///
/// Entries are evicted least-recently-used first once the total weight
/// exceeds the budget. Lookups refresh recency.
pub(crate) struct Lru<K, V> {
    entries: HashMap<K, (V, u64)>,
    order: BTreeMap<u64, K>,
    weigher: fn(&K, &V) -> usize,
    weight: usize,
    budget: usize,
    clock: u64,
}

impl<K: Eq + Hash + Clone, V: Clone> Lru<K, V> {
    /// Creates a cache bounded by `budget` total weight.
    pub(crate) fn new(budget: usize, weigher: fn(&K, &V) -> usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            weigher,
            weight: 0,
            budget,
            clock: 0,
        }
    }

    /// Creates a cache bounded by an entry count.
    pub(crate) fn with_capacity(entries: usize) -> Self {
        Self::new(entries, |_, _| 1)
    }

    pub(crate) fn get(&mut self, key: &K) -> Option<V> {
        let (value, slot) = self.entries.get(key)?;
        let value = value.clone();
        let slot = *slot;

        self.clock += 1;
        let clock = self.clock;
        self.order.remove(&slot);
        self.order.insert(clock, key.clone());
        if let Some(entry) = self.entries.get_mut(key) {
            entry.1 = clock;
        }
        Some(value)
    }

    pub(crate) fn insert(&mut self, key: K, value: V) {
        let added = (self.weigher)(&key, &value);
        if added > self.budget {
            return;
        }

        if let Some((old, slot)) = self.entries.remove(&key) {
            self.weight -= (self.weigher)(&key, &old);
            self.order.remove(&slot);
        }

        self.clock += 1;
        self.weight += added;
        self.order.insert(self.clock, key.clone());
        self.entries.insert(key, (value, self.clock));

        while self.weight > self.budget {
            let Some((_, victim)) = self.order.pop_first() else {
                break;
            };
            if let Some((value, _)) = self.entries.remove(&victim) {
                self.weight -= (self.weigher)(&victim, &value);
            }
        }
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
        self.weight = 0;
    }

    /// Drops every entry for which the predicate holds.
    pub(crate) fn retain(&mut self, mut keep: impl FnMut(&K, &V) -> bool) {
        let weigher = self.weigher;
        let order = &mut self.order;
        let weight = &mut self.weight;
        self.entries.retain(|key, (value, slot)| {
            if keep(key, value) {
                true
            } else {
                order.remove(slot);
                *weight -= weigher(key, value);
                false
            }
        });
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Byte-bounded cache of parsed segments.
///
/// Hits return the shared [`Segment`] view over the in-memory buffer.
/// Eviction frees the cache copy only; segments stay readable through the
/// archive files.
pub struct SegmentCache {
    lru: Mutex<Lru<SegmentId, Arc<Segment>>>,
    stats: Stats,
    enabled: bool,
}

impl SegmentCache {
    /// Creates a cache bounded by `budget_bytes`. A zero budget disables
    /// caching entirely.
    #[must_use]
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            lru: Mutex::new(Lru::new(budget_bytes.max(1), |_, segment| segment.size())),
            stats: Stats::default(),
            enabled: budget_bytes > 0,
        }
    }

    /// Returns the cached segment or loads, caches and returns it.
    pub fn get_or_load(
        &self,
        id: &SegmentId,
        load: impl FnOnce() -> Result<Arc<Segment>>,
    ) -> Result<Arc<Segment>> {
        if !self.enabled {
            return load();
        }

        if let Some(segment) = self.lru.lock().get(id) {
            self.stats.hit();
            return Ok(segment);
        }
        self.stats.miss();

        let segment = load()?;
        self.lru.lock().insert(id.clone(), Arc::clone(&segment));
        Ok(segment)
    }

    /// Inserts a freshly written segment.
    pub fn put(&self, segment: Arc<Segment>) {
        if self.enabled {
            self.lru.lock().insert(segment.id().clone(), segment);
        }
    }

    /// Drops all cached segments.
    pub fn clear(&self) {
        self.lru.lock().clear();
    }

    /// Drops cached data segments for which the predicate on the stored GC
    /// generation holds.
    pub fn evict_generations(&self, mut evict: impl FnMut(u32) -> bool) {
        self.lru
            .lock()
            .retain(|id, segment| id.is_bulk() || !evict(segment.generation()));
    }

    /// Returns the cache hit/miss counters.
    #[must_use]
    pub fn stats(&self) -> &Stats {
        &self.stats
    }
}
