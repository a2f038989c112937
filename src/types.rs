//! CANOPY - Core Type Definitions
//! Defines fundamental types used across the storage engine.

use bytes::Bytes;

/// Position of a node in the backing tree. Negative values are never valid paths.
pub type Path = i64;

/// Marker returned by key lookups that did not resolve to a path.
pub const INVALID_PATH: Path = -1;

/// Inclusive range of leaf paths currently holding valid data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyRange {
    pub min_valid_key: i64,
    pub max_valid_key: i64,
}

impl KeyRange {
    /// Range of an empty tree: nothing is within it.
    pub const INVALID: KeyRange = KeyRange {
        min_valid_key: -1,
        max_valid_key: -1,
    };

    pub fn new(min_valid_key: i64, max_valid_key: i64) -> Self {
        Self {
            min_valid_key,
            max_valid_key,
        }
    }

    /// Check whether a path lies within the range.
    pub fn within_range(&self, path: Path) -> bool {
        path >= 0 && path >= self.min_valid_key && path <= self.max_valid_key
    }

    pub fn is_empty(&self) -> bool {
        self.max_valid_key < 0 || self.max_valid_key < self.min_valid_key
    }
}

impl Default for KeyRange {
    fn default() -> Self {
        KeyRange::INVALID
    }
}

/// Hash of an internal or leaf node, addressed by path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashRecord {
    pub path: Path,
    pub hash: Bytes,
}

impl HashRecord {
    pub fn new(path: Path, hash: impl Into<Bytes>) -> Self {
        Self {
            path,
            hash: hash.into(),
        }
    }
}

/// A leaf: caller-supplied key and value stored at a path.
/// Records in a delete batch only need `path` and `key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafRecord {
    pub path: Path,
    pub key: Bytes,
    pub value: Bytes,
}

impl LeafRecord {
    pub fn new(path: Path, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            path,
            key: key.into(),
            value: value.into(),
        }
    }

    /// A record that only identifies a leaf for deletion.
    pub fn deletion(path: Path, key: impl Into<Bytes>) -> Self {
        Self {
            path,
            key: key.into(),
            value: Bytes::new(),
        }
    }
}

/// Stable hash code of a key, used to pick cache slots.
pub fn key_hash_code(key: &[u8]) -> u32 {
    crc32fast::hash(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_range_contains_nothing() {
        let range = KeyRange::INVALID;
        assert!(range.is_empty());
        assert!(!range.within_range(0));
        assert!(!range.within_range(-1));
    }

    #[test]
    fn test_within_range_is_inclusive() {
        let range = KeyRange::new(5, 10);
        assert!(!range.within_range(4));
        assert!(range.within_range(5));
        assert!(range.within_range(10));
        assert!(!range.within_range(11));
    }

    #[test]
    fn test_key_hash_code_is_stable() {
        assert_eq!(key_hash_code(b"abc"), key_hash_code(b"abc"));
        assert_ne!(key_hash_code(b"abc"), key_hash_code(b"abd"));
    }
}
