//! CANOPY - Leaf Record Cache
//! Direct-mapped cache of recent leaf lookups. A slot holds either a full record or
//! just the key's path, which may be [`INVALID_PATH`](crate::types::INVALID_PATH) for
//! keys known to be absent.
//!
//! Every slot carries a generation bumped by [`LeafCache::invalidate`]. Readers fill a
//! slot only with the generation they saw before reading the stores, so a lookup that
//! raced with a write cannot cache the value the write replaced.

use bytes::Bytes;
use parking_lot::Mutex;

use crate::types::{key_hash_code, LeafRecord, Path};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedLeaf {
    pub key: Bytes,
    pub path: Path,
    pub value: Option<Bytes>,
}

impl CachedLeaf {
    pub fn to_record(&self) -> Option<LeafRecord> {
        self.value
            .as_ref()
            .map(|value| LeafRecord::new(self.path, self.key.clone(), value.clone()))
    }
}

#[derive(Debug, Default)]
struct Slot {
    entry: Option<CachedLeaf>,
    generation: u64,
}

pub struct LeafCache {
    slots: Vec<Mutex<Slot>>,
}

impl LeafCache {
    /// A cache of `size` slots. Zero disables caching.
    pub fn new(size: usize) -> Self {
        Self {
            slots: (0..size).map(|_| Mutex::new(Slot::default())).collect(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.slots.is_empty()
    }

    fn slot(&self, key: &[u8]) -> Option<&Mutex<Slot>> {
        if self.slots.is_empty() {
            return None;
        }
        let index = key_hash_code(key) as usize % self.slots.len();
        self.slots.get(index)
    }

    pub fn get(&self, key: &[u8]) -> Option<CachedLeaf> {
        self.lookup(key).0
    }

    /// The cached entry of `key`, if any, and the generation of its slot.
    pub fn lookup(&self, key: &[u8]) -> (Option<CachedLeaf>, u64) {
        let Some(slot) = self.slot(key) else {
            return (None, 0);
        };
        let slot = slot.lock();
        let hit = slot.entry.as_ref().filter(|c| c.key.as_ref() == key).cloned();
        (hit, slot.generation)
    }

    /// Cache `entry` unless its slot was invalidated since `generation`.
    pub fn put(&self, entry: CachedLeaf, generation: u64) {
        if let Some(slot) = self.slot(&entry.key) {
            let mut slot = slot.lock();
            if slot.generation == generation {
                slot.entry = Some(entry);
            }
        }
    }

    /// Cache a path without a value, unless the slot already holds this key or was
    /// invalidated since `generation`.
    pub fn put_path_if_absent(&self, key: &Bytes, path: Path, generation: u64) {
        if let Some(slot) = self.slot(key) {
            let mut slot = slot.lock();
            if slot.generation != generation
                || slot.entry.as_ref().is_some_and(|c| c.key == *key)
            {
                return;
            }
            slot.entry = Some(CachedLeaf {
                key: key.clone(),
                path,
                value: None,
            });
        }
    }

    /// Clear the slot of `key` if it still holds that key. Always starts a new
    /// generation, so fills begun before the call are dropped.
    pub fn invalidate(&self, key: &[u8]) {
        if let Some(slot) = self.slot(key) {
            let mut slot = slot.lock();
            slot.generation = slot.generation.wrapping_add(1);
            if slot.entry.as_ref().is_some_and(|c| c.key.as_ref() == key) {
                slot.entry = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::INVALID_PATH;

    fn entry(key: &'static [u8], path: Path, value: Option<&'static [u8]>) -> CachedLeaf {
        CachedLeaf {
            key: Bytes::from_static(key),
            path,
            value: value.map(Bytes::from_static),
        }
    }

    #[test]
    fn test_hit_and_miss() {
        let cache = LeafCache::new(16);
        cache.put(entry(b"a", 3, Some(b"v")), 0);
        let hit = cache.get(b"a").unwrap();
        assert_eq!(hit.to_record().unwrap().value.as_ref(), b"v");
        assert!(cache.get(b"b").is_none());
    }

    #[test]
    fn test_negative_entry() {
        let cache = LeafCache::new(16);
        cache.put_path_if_absent(&Bytes::from_static(b"gone"), INVALID_PATH, 0);
        let hit = cache.get(b"gone").unwrap();
        assert_eq!(hit.path, INVALID_PATH);
        assert!(hit.to_record().is_none());
    }

    #[test]
    fn test_put_path_keeps_full_record() {
        let cache = LeafCache::new(16);
        cache.put(entry(b"a", 3, Some(b"v")), 0);
        cache.put_path_if_absent(&Bytes::from_static(b"a"), 3, 0);
        assert!(cache.get(b"a").unwrap().value.is_some());
    }

    #[test]
    fn test_invalidate_only_matching_key() {
        // One slot: every key collides.
        let cache = LeafCache::new(1);
        cache.put(entry(b"a", 1, Some(b"v")), 0);
        cache.invalidate(b"b");
        assert!(cache.get(b"a").is_some());
        cache.invalidate(b"a");
        assert!(cache.get(b"a").is_none());
    }

    #[test]
    fn test_fill_after_invalidate_is_dropped() {
        let cache = LeafCache::new(4);
        // A reader looks up the old value, then a write invalidates the key.
        let (hit, generation) = cache.lookup(b"a");
        assert!(hit.is_none());
        cache.invalidate(b"a");

        cache.put(entry(b"a", 1, Some(b"old")), generation);
        assert!(cache.get(b"a").is_none());
        cache.put_path_if_absent(&Bytes::from_static(b"a"), INVALID_PATH, generation);
        assert!(cache.get(b"a").is_none());

        // A reader starting after the write may fill the slot.
        let (_, generation) = cache.lookup(b"a");
        cache.put(entry(b"a", 1, Some(b"new")), generation);
        assert_eq!(cache.get(b"a").unwrap().value.unwrap().as_ref(), b"new");
    }

    #[test]
    fn test_disabled_cache() {
        let cache = LeafCache::new(0);
        assert!(!cache.is_enabled());
        cache.put(entry(b"a", 1, None), 0);
        assert!(cache.get(b"a").is_none());
    }
}
