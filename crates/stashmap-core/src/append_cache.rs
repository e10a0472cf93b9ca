//! Write-back cache for incremental value appends
//!
//! `append_data` accumulates bytes in a per-key buffer instead of touching the
//! value log on every call. Buffers live in a bounded segmented cache (a
//! probational queue for keys seen once, a protected queue for keys touched
//! again); when a buffer falls out, the map flushes it into the log. Buffers
//! themselves are recycled through a small pool so heavy append workloads do
//! not churn allocations.
//!
//! The cache performs no I/O itself: eviction hands the victim buffers back to
//! the caller, which flushes them while holding the storage lock. Queue nodes
//! are invalidated lazily via per-entry stamps, so touches never scan.

use std::collections::VecDeque;

use hashbrown::HashMap;

/// Bounded pool of reusable append buffers.
pub struct BufferPool {
    buffers: Vec<Vec<u8>>,
    capacity: usize,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        Self { buffers: Vec::new(), capacity }
    }

    /// Take a cleared buffer from the pool, or allocate a fresh one.
    pub fn alloc(&mut self) -> Vec<u8> {
        self.buffers.pop().unwrap_or_default()
    }

    /// Return a buffer. Cleared on the way in; dropped if the pool is full.
    pub fn recycle(&mut self, mut buf: Vec<u8>) {
        buf.clear();
        if self.buffers.len() < self.capacity {
            self.buffers.push(buf);
        }
    }

    #[cfg(test)]
    fn pooled(&self) -> usize {
        self.buffers.len()
    }
}

struct Slot {
    buf: Vec<u8>,
    protected: bool,
    /// Stamp of this entry's current queue node; older nodes are stale.
    stamp: u64,
}

/// Buffers evicted by a cache touch, to be flushed by the caller.
pub type Evicted = Vec<(Vec<u8>, Vec<u8>)>;

/// Segmented (probational/protected) bounded cache of append buffers.
pub struct AppendCache {
    entries: HashMap<Vec<u8>, Slot>,
    probational: VecDeque<(Vec<u8>, u64)>,
    protected: VecDeque<(Vec<u8>, u64)>,
    probational_cap: usize,
    protected_cap: usize,
    probational_len: usize,
    protected_len: usize,
    next_stamp: u64,
}

impl AppendCache {
    pub fn new(protected_cap: usize, probational_cap: usize) -> Self {
        Self {
            entries: HashMap::new(),
            probational: VecDeque::new(),
            protected: VecDeque::new(),
            probational_cap,
            protected_cap,
            probational_len: 0,
            protected_len: 0,
            next_stamp: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Make sure an entry for `key` exists and count this as a touch.
    /// Returns the buffers that fell out of the cache to make room; the
    /// caller must flush them before anything else happens to those keys.
    pub fn touch(&mut self, key: &[u8], pool: &mut BufferPool) -> Evicted {
        let mut evicted = Evicted::new();

        if self.entries.contains_key(key) {
            // Second touch promotes into the protected segment.
            let stamp = self.bump_stamp();
            let slot = match self.entries.get_mut(key) {
                Some(slot) => slot,
                None => return evicted,
            };
            if slot.protected {
                slot.stamp = stamp;
                self.protected.push_back((key.to_vec(), stamp));
            } else {
                slot.protected = true;
                slot.stamp = stamp;
                self.probational_len -= 1;
                self.protected_len += 1;
                self.protected.push_back((key.to_vec(), stamp));
                self.rebalance(&mut evicted);
            }
        } else {
            let stamp = self.bump_stamp();
            self.entries.insert(
                key.to_vec(),
                Slot { buf: pool.alloc(), protected: false, stamp },
            );
            self.probational.push_back((key.to_vec(), stamp));
            self.probational_len += 1;
            self.rebalance(&mut evicted);
        }

        evicted
    }

    /// Mutable access to `key`'s buffer. `touch` must have been called first.
    pub fn buffer_mut(&mut self, key: &[u8]) -> Option<&mut Vec<u8>> {
        self.entries.get_mut(key).map(|slot| &mut slot.buf)
    }

    /// Drop `key`'s entry, handing its buffer back to the caller.
    pub fn remove(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        let slot = self.entries.remove(key)?;
        if slot.protected {
            self.protected_len -= 1;
        } else {
            self.probational_len -= 1;
        }
        Some(slot.buf)
    }

    /// Empty the cache, returning every pending buffer for flushing.
    pub fn drain(&mut self) -> Evicted {
        self.probational.clear();
        self.protected.clear();
        self.probational_len = 0;
        self.protected_len = 0;
        self.entries.drain().map(|(key, slot)| (key, slot.buf)).collect()
    }

    fn bump_stamp(&mut self) -> u64 {
        self.next_stamp += 1;
        self.next_stamp
    }

    /// Restore segment bounds: protected overflow demotes its LRU into the
    /// probational segment, probational overflow evicts outright.
    fn rebalance(&mut self, evicted: &mut Evicted) {
        while self.protected_len > self.protected_cap {
            match self.pop_lru(true) {
                Some(key) => {
                    let stamp = self.bump_stamp();
                    if let Some(slot) = self.entries.get_mut(&key) {
                        slot.protected = false;
                        slot.stamp = stamp;
                        self.protected_len -= 1;
                        self.probational_len += 1;
                        self.probational.push_back((key, stamp));
                    }
                }
                None => break,
            }
        }
        while self.probational_len > self.probational_cap {
            match self.pop_lru(false) {
                Some(key) => {
                    if let Some(slot) = self.entries.remove(&key) {
                        self.probational_len -= 1;
                        evicted.push((key, slot.buf));
                    }
                }
                None => break,
            }
        }
    }

    /// Pop the least-recently-touched live key of a segment, skipping stale
    /// queue nodes left behind by later touches.
    fn pop_lru(&mut self, protected: bool) -> Option<Vec<u8>> {
        loop {
            let queue = if protected { &mut self.protected } else { &mut self.probational };
            let (key, stamp) = queue.pop_front()?;
            let live = self
                .entries
                .get(&key)
                .map(|slot| slot.protected == protected && slot.stamp == stamp)
                .unwrap_or(false);
            if live {
                return Some(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(protected: usize, probational: usize) -> (AppendCache, BufferPool) {
        (AppendCache::new(protected, probational), BufferPool::new(4))
    }

    #[test]
    fn test_pool_recycles_cleared_buffers() {
        let mut pool = BufferPool::new(2);
        let mut buf = pool.alloc();
        buf.extend_from_slice(b"leftover");
        pool.recycle(buf);
        assert_eq!(pool.pooled(), 1);

        let buf = pool.alloc();
        assert!(buf.is_empty());
        assert_eq!(pool.pooled(), 0);
    }

    #[test]
    fn test_pool_capacity_bounds_retention() {
        let mut pool = BufferPool::new(1);
        pool.recycle(Vec::new());
        pool.recycle(Vec::new());
        assert_eq!(pool.pooled(), 1);
    }

    #[test]
    fn test_touch_creates_entry_without_eviction() {
        let (mut cache, mut pool) = cache(4, 4);
        assert!(cache.touch(b"a", &mut pool).is_empty());
        assert!(cache.touch(b"b", &mut pool).is_empty());
        assert_eq!(cache.len(), 2);

        cache.buffer_mut(b"a").unwrap().extend_from_slice(b"payload");
        assert_eq!(cache.buffer_mut(b"a").unwrap().as_slice(), b"payload");
    }

    #[test]
    fn test_probational_overflow_evicts_lru() {
        let (mut cache, mut pool) = cache(4, 2);
        cache.touch(b"a", &mut pool);
        cache.buffer_mut(b"a").unwrap().push(1);
        cache.touch(b"b", &mut pool);
        let evicted = cache.touch(b"c", &mut pool);

        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].0, b"a");
        assert_eq!(evicted[0].1, vec![1]);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_second_touch_protects_from_eviction() {
        let (mut cache, mut pool) = cache(4, 2);
        cache.touch(b"hot", &mut pool);
        cache.touch(b"hot", &mut pool); // promoted
        cache.touch(b"x", &mut pool);
        cache.touch(b"y", &mut pool);
        let evicted = cache.touch(b"z", &mut pool);

        let evicted_keys: Vec<_> = evicted.iter().map(|(k, _)| k.clone()).collect();
        assert!(!evicted_keys.contains(&b"hot".to_vec()));
        assert!(cache.buffer_mut(b"hot").is_some());
    }

    #[test]
    fn test_protected_overflow_demotes() {
        let (mut cache, mut pool) = cache(1, 2);
        cache.touch(b"a", &mut pool);
        cache.touch(b"a", &mut pool); // protected
        cache.touch(b"b", &mut pool);
        cache.touch(b"b", &mut pool); // protected cap hit, "a" demoted

        // Both entries still cached; segments stayed within bounds.
        assert_eq!(cache.len(), 2);
        assert!(cache.buffer_mut(b"a").is_some());
        assert!(cache.buffer_mut(b"b").is_some());
    }

    #[test]
    fn test_remove_returns_buffer() {
        let (mut cache, mut pool) = cache(4, 4);
        cache.touch(b"k", &mut pool);
        cache.buffer_mut(b"k").unwrap().extend_from_slice(b"abc");

        let buf = cache.remove(b"k").unwrap();
        assert_eq!(buf, b"abc");
        assert!(cache.remove(b"k").is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_drain_returns_everything() {
        let (mut cache, mut pool) = cache(4, 4);
        cache.touch(b"a", &mut pool);
        cache.touch(b"b", &mut pool);
        cache.touch(b"b", &mut pool);

        let mut drained = cache.drain();
        drained.sort_by(|(a, _), (b, _)| a.cmp(b));
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].0, b"a");
        assert_eq!(drained[1].0, b"b");
        assert!(cache.is_empty());
    }
}
