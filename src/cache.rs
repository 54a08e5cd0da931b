//! Source-side cache of constructed virtual blocks.

use bytes::Bytes;
use std::collections::{HashMap, VecDeque};

/// Identifies a virtual block: the target checkpoint and the checkpoint
/// the requester already holds.
pub type VBlockKey = (u64, u64);

/// Caches serialized virtual blocks so repeated requests from lagging
/// replicas do not rebuild the same pages delta.
///
/// Entries are immutable while cached; eviction is insertion-order once
/// capacity is reached.
pub struct VBlockCache {
    capacity: usize,
    entries: HashMap<VBlockKey, Bytes>,
    order: VecDeque<VBlockKey>,
}

impl VBlockCache {
    /// Create a cache holding at most `capacity` virtual blocks.
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            capacity,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Look up a cached virtual block.
    pub fn get(&self, key: &VBlockKey) -> Option<Bytes> {
        self.entries.get(key).cloned()
    }

    /// Insert a virtual block, evicting the oldest entry at capacity.
    /// Re-inserting an existing key is a no-op (entries are read-only).
    pub fn put(&mut self, key: VBlockKey, vblock: Bytes) {
        if self.entries.contains_key(&key) {
            return;
        }
        if self.entries.len() == self.capacity {
            // Capacity is non-zero, so the order queue is non-empty here.
            let oldest = self.order.pop_front().unwrap();
            self.entries.remove(&oldest);
        }
        self.entries.insert(key, vblock);
        self.order.push_back(key);
    }

    /// Drop every entry at or above `checkpoint` (their contents are
    /// superseded when the local pages change).
    pub fn invalidate_from(&mut self, checkpoint: u64) {
        self.order.retain(|(target, _)| *target < checkpoint);
        self.entries.retain(|(target, _), _| *target < checkpoint);
    }

    /// Number of cached virtual blocks.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get() {
        let mut cache = VBlockCache::new(2);
        assert!(cache.get(&(5, 0)).is_none());
        cache.put((5, 0), Bytes::from_static(b"a"));
        assert_eq!(cache.get(&(5, 0)).unwrap(), Bytes::from_static(b"a"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_evicts_insertion_order() {
        let mut cache = VBlockCache::new(2);
        cache.put((5, 0), Bytes::from_static(b"a"));
        cache.put((5, 1), Bytes::from_static(b"b"));
        cache.put((5, 2), Bytes::from_static(b"c"));
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&(5, 0)).is_none());
        assert!(cache.get(&(5, 1)).is_some());
        assert!(cache.get(&(5, 2)).is_some());
    }

    #[test]
    fn test_reinsert_is_noop() {
        let mut cache = VBlockCache::new(2);
        cache.put((5, 0), Bytes::from_static(b"a"));
        cache.put((5, 0), Bytes::from_static(b"changed"));
        assert_eq!(cache.get(&(5, 0)).unwrap(), Bytes::from_static(b"a"));
    }

    #[test]
    fn test_invalidate_from() {
        let mut cache = VBlockCache::new(4);
        cache.put((4, 0), Bytes::from_static(b"a"));
        cache.put((5, 0), Bytes::from_static(b"b"));
        cache.put((6, 2), Bytes::from_static(b"c"));
        cache.invalidate_from(5);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&(4, 0)).is_some());
        assert!(cache.get(&(5, 0)).is_none());
        assert!(cache.get(&(6, 2)).is_none());

        // Eviction still works after invalidation.
        cache.put((7, 0), Bytes::from_static(b"d"));
        cache.put((7, 1), Bytes::from_static(b"e"));
        cache.put((7, 2), Bytes::from_static(b"f"));
        cache.put((7, 3), Bytes::from_static(b"g"));
        assert_eq!(cache.len(), 4);
        assert!(cache.get(&(4, 0)).is_none());
    }
}
