//! CANOPY - RAM Hash Store
//! Digests of the low paths of a tree, kept entirely in memory.
//!
//! ## File Format
//! ```text
//! [digest len u32][entry count u64] then per path: [present u8][digest]
//! ```

use std::io::{Cursor, Read};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use parking_lot::RwLock;

use crate::error::{CanopyError, Result};
use crate::fs_util;
use crate::types::Path as TreePath;

#[derive(Debug)]
pub struct HashList {
    digest_len: usize,
    hashes: RwLock<Vec<Option<Bytes>>>,
}

impl HashList {
    pub fn new(digest_len: usize) -> Self {
        Self {
            digest_len,
            hashes: RwLock::new(Vec::new()),
        }
    }

    pub fn get(&self, path: TreePath) -> Option<Bytes> {
        if path < 0 {
            return None;
        }
        self.hashes.read().get(path as usize).cloned().flatten()
    }

    pub fn put(&self, path: TreePath, hash: Bytes) -> Result<()> {
        if path < 0 {
            return Err(CanopyError::InvalidPath(path));
        }
        if hash.len() != self.digest_len {
            return Err(CanopyError::InvalidRecord(format!(
                "hash for path {path} has {} bytes, expected {}",
                hash.len(),
                self.digest_len
            )));
        }
        let mut hashes = self.hashes.write();
        let index = path as usize;
        if index >= hashes.len() {
            hashes.resize(index + 1, None);
        }
        hashes[index] = Some(hash);
        Ok(())
    }

    /// Number of slots, set or not.
    pub fn size(&self) -> usize {
        self.hashes.read().len()
    }

    pub fn memory_usage(&self) -> u64 {
        let hashes = self.hashes.read();
        let stored = hashes.iter().filter(|h| h.is_some()).count();
        (hashes.capacity() * std::mem::size_of::<Option<Bytes>>() + stored * self.digest_len) as u64
    }

    pub fn write_to_file(&self, path: &Path, sync: bool) -> Result<()> {
        let hashes = self.hashes.read();
        let mut buf = Vec::with_capacity(12 + hashes.len() * (1 + self.digest_len));
        buf.write_u32::<LittleEndian>(self.digest_len as u32)?;
        buf.write_u64::<LittleEndian>(hashes.len() as u64)?;
        for hash in hashes.iter() {
            match hash {
                Some(hash) => {
                    buf.push(1);
                    buf.extend_from_slice(hash);
                }
                None => buf.push(0),
            }
        }
        drop(hashes);
        fs_util::write_atomically(path, &buf, sync)
    }

    /// Load from `path`, or start empty if the file does not exist.
    pub fn load(path: &Path, digest_len: usize) -> Result<Self> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new(digest_len)),
            Err(e) => return Err(e.into()),
        };
        let corrupt = |e: std::io::Error| {
            CanopyError::Corruption(format!("hash list file {path:?} is truncated: {e}"))
        };
        let mut cursor = Cursor::new(bytes.as_slice());
        let stored_len = cursor.read_u32::<LittleEndian>().map_err(corrupt)? as usize;
        if stored_len != digest_len {
            return Err(CanopyError::Corruption(format!(
                "hash list file {path:?} holds {stored_len}-byte digests, expected {digest_len}"
            )));
        }
        let count = cursor.read_u64::<LittleEndian>().map_err(corrupt)? as usize;
        let mut hashes = Vec::with_capacity(count.min(bytes.len()));
        for _ in 0..count {
            match cursor.read_u8().map_err(corrupt)? {
                0 => hashes.push(None),
                1 => {
                    let mut digest = vec![0u8; digest_len];
                    cursor.read_exact(&mut digest).map_err(corrupt)?;
                    hashes.push(Some(Bytes::from(digest)));
                }
                flag => {
                    return Err(CanopyError::Corruption(format!(
                        "hash list file {path:?} has presence flag {flag}"
                    )))
                }
            }
        }
        Ok(Self {
            digest_len,
            hashes: RwLock::new(hashes),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get() {
        let list = HashList::new(4);
        list.put(2, Bytes::from_static(b"abcd")).unwrap();
        assert_eq!(list.get(2).unwrap(), Bytes::from_static(b"abcd"));
        assert!(list.get(1).is_none());
        assert!(list.get(99).is_none());
        assert_eq!(list.size(), 3);
    }

    #[test]
    fn test_rejects_wrong_digest_length() {
        let list = HashList::new(4);
        assert!(matches!(
            list.put(0, Bytes::from_static(b"abc")),
            Err(CanopyError::InvalidRecord(_))
        ));
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hashes_ram.hl");
        let list = HashList::new(4);
        list.put(0, Bytes::from_static(b"0000")).unwrap();
        list.put(3, Bytes::from_static(b"3333")).unwrap();
        list.write_to_file(&path, false).unwrap();

        let loaded = HashList::load(&path, 4).unwrap();
        assert_eq!(loaded.get(0).unwrap(), Bytes::from_static(b"0000"));
        assert!(loaded.get(1).is_none());
        assert_eq!(loaded.get(3).unwrap(), Bytes::from_static(b"3333"));
    }

    #[test]
    fn test_digest_length_mismatch_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hashes_ram.hl");
        HashList::new(4).write_to_file(&path, false).unwrap();
        assert!(matches!(
            HashList::load(&path, 8),
            Err(CanopyError::Corruption(_))
        ));
    }
}
