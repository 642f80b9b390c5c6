//! Bounded in-memory cache in front of the mapped ring.
//!
//! The cache maps block hashes to slot offsets, never to decoded blocks:
//! the mapped file stays authoritative, and every hit re-checks the slot's
//! hash field before the record is trusted. A small negative cache bounds
//! the cost of repeated lookups for hashes the ring does not hold.

use std::num::NonZeroUsize;

use alloy_primitives::B256;
use lru::LruCache;

const OFFSET_CACHE_SIZE: usize = 2048;
const MISS_CACHE_SIZE: usize = 128;

pub(crate) struct SlotCache {
    offsets: LruCache<B256, u32>,
    misses: LruCache<B256, ()>,
}

impl SlotCache {
    pub(crate) fn new() -> Self {
        Self {
            offsets: LruCache::new(NonZeroUsize::new(OFFSET_CACHE_SIZE).expect("nonzero")),
            misses: LruCache::new(NonZeroUsize::new(MISS_CACHE_SIZE).expect("nonzero")),
        }
    }

    /// Slot offset recorded for the hash, if any.
    pub(crate) fn offset(&mut self, hash: &B256) -> Option<u32> {
        self.offsets.get(hash).copied()
    }

    pub(crate) fn note_found(&mut self, hash: B256, offset: u32) {
        self.misses.pop(&hash);
        self.offsets.put(hash, offset);
    }

    pub(crate) fn note_missing(&mut self, hash: B256) {
        self.misses.put(hash, ());
    }

    /// Whether a recent full scan already failed to find the hash.
    pub(crate) fn is_known_missing(&mut self, hash: &B256) -> bool {
        self.misses.get(hash).is_some()
    }

    /// Drops any record of the hash. Called before a write so a stale
    /// negative entry cannot shadow the new record.
    pub(crate) fn forget(&mut self, hash: &B256) {
        self.offsets.pop(hash);
        self.misses.pop(hash);
    }

    pub(crate) fn clear(&mut self) {
        self.offsets.clear();
        self.misses.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn found_entry_clears_negative_entry() {
        let mut cache = SlotCache::new();
        let hash = B256::from([0xabu8; 32]);
        cache.note_missing(hash);
        assert!(cache.is_known_missing(&hash));
        cache.note_found(hash, 1024);
        assert!(!cache.is_known_missing(&hash));
        assert_eq!(cache.offset(&hash), Some(1024));
    }

    #[test]
    fn forget_drops_both_sides() {
        let mut cache = SlotCache::new();
        let hash = B256::from([0x01u8; 32]);
        cache.note_found(hash, 2048);
        cache.forget(&hash);
        assert_eq!(cache.offset(&hash), None);

        cache.note_missing(hash);
        cache.forget(&hash);
        assert!(!cache.is_known_missing(&hash));
    }
}
