//! CANOPY - Long Lists
//! Dense `index -> u64` arrays used for path-to-location indices and sequential key indices.
//! Zero means "no value". The file form is a raw little-endian u64 array.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::{Mutex, RwLock};

use crate::error::{CanopyError, Result};
use crate::fs_util;

const ENTRY_SIZE: u64 = 8;

/// A growable array of u64 values, kept in memory or in a file.
#[derive(Debug)]
pub enum LongList {
    Memory(RwLock<Vec<u64>>),
    Disk(DiskLongList),
}

/// File-backed list. Works on a private copy of its file.
#[derive(Debug)]
pub struct DiskLongList {
    path: PathBuf,
    file: Mutex<File>,
}

impl LongList {
    pub fn new_memory() -> Self {
        LongList::Memory(RwLock::new(Vec::new()))
    }

    /// Open a list from `path`, or an empty one if the file does not exist.
    pub fn load(path: &Path, disk_based: bool) -> Result<Self> {
        if disk_based {
            return Ok(LongList::Disk(DiskLongList::open(path)?));
        }
        let values = match fs::read(path) {
            Ok(bytes) => {
                if bytes.len() as u64 % ENTRY_SIZE != 0 {
                    return Err(CanopyError::Corruption(format!(
                        "long list file {path:?} has a partial entry"
                    )));
                }
                let mut values = vec![0u64; bytes.len() / ENTRY_SIZE as usize];
                LittleEndian::read_u64_into(&bytes, &mut values);
                values
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(LongList::Memory(RwLock::new(values)))
    }

    pub fn get(&self, index: u64) -> Result<u64> {
        match self {
            LongList::Memory(values) => Ok(values
                .read()
                .get(index as usize)
                .copied()
                .unwrap_or(0)),
            LongList::Disk(list) => list.get(index),
        }
    }

    pub fn put(&self, index: u64, value: u64) -> Result<()> {
        match self {
            LongList::Memory(values) => {
                let mut values = values.write();
                let index = index as usize;
                if index >= values.len() {
                    if value == 0 {
                        return Ok(());
                    }
                    values.resize(index + 1, 0);
                }
                values[index] = value;
                Ok(())
            }
            LongList::Disk(list) => list.put(index, value),
        }
    }

    /// Set `index` to `new` only if it currently holds `expected`.
    pub fn compare_and_set(&self, index: u64, expected: u64, new: u64) -> Result<bool> {
        match self {
            LongList::Memory(values) => {
                let mut values = values.write();
                let current = values.get(index as usize).copied().unwrap_or(0);
                if current != expected {
                    return Ok(false);
                }
                let index = index as usize;
                if index >= values.len() {
                    values.resize(index + 1, 0);
                }
                values[index] = new;
                Ok(true)
            }
            LongList::Disk(list) => list.compare_and_set(index, expected, new),
        }
    }

    /// Clear every entry outside `[min, max]` and shrink to `max + 1` entries.
    /// A negative `max` clears the whole list.
    pub fn update_valid_range(&self, min: i64, max: i64) -> Result<()> {
        let len = if max < 0 { 0 } else { max as u64 + 1 };
        let min = min.max(0) as u64;
        match self {
            LongList::Memory(values) => {
                let mut values = values.write();
                values.truncate(len as usize);
                let clear_to = (min as usize).min(values.len());
                values[..clear_to].iter_mut().for_each(|v| *v = 0);
                Ok(())
            }
            LongList::Disk(list) => list.update_valid_range(min, len),
        }
    }

    /// Number of entries, including unset ones below the highest set index.
    pub fn size(&self) -> Result<u64> {
        match self {
            LongList::Memory(values) => Ok(values.read().len() as u64),
            LongList::Disk(list) => list.size(),
        }
    }

    /// Bytes of memory held by the list.
    pub fn memory_usage(&self) -> u64 {
        match self {
            LongList::Memory(values) => values.read().capacity() as u64 * ENTRY_SIZE,
            LongList::Disk(_) => 0,
        }
    }

    /// Write the list to `path`, replacing any file there atomically.
    pub fn write_to_file(&self, path: &Path, sync: bool) -> Result<()> {
        match self {
            LongList::Memory(values) => {
                let values = values.read();
                let mut bytes = vec![0u8; values.len() * ENTRY_SIZE as usize];
                LittleEndian::write_u64_into(&values, &mut bytes);
                drop(values);
                fs_util::write_atomically(path, &bytes, sync)
            }
            LongList::Disk(list) => list.write_to_file(path, sync),
        }
    }
}

impl DiskLongList {
    fn open(path: &Path) -> Result<Self> {
        if path.exists() {
            // The file may be hard-linked from a snapshot.
            fs_util::unshare_file(path)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        if file.metadata()?.len() % ENTRY_SIZE != 0 {
            return Err(CanopyError::Corruption(format!(
                "long list file {path:?} has a partial entry"
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    fn read_entry(file: &mut File, index: u64) -> Result<u64> {
        let len = file.metadata()?.len();
        let offset = index * ENTRY_SIZE;
        if offset + ENTRY_SIZE > len {
            return Ok(0);
        }
        let mut buf = [0u8; ENTRY_SIZE as usize];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(LittleEndian::read_u64(&buf))
    }

    fn write_entry(file: &mut File, index: u64, value: u64) -> Result<()> {
        let offset = index * ENTRY_SIZE;
        if value == 0 && offset >= file.metadata()?.len() {
            return Ok(());
        }
        let mut buf = [0u8; ENTRY_SIZE as usize];
        LittleEndian::write_u64(&mut buf, value);
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&buf)?;
        Ok(())
    }

    fn get(&self, index: u64) -> Result<u64> {
        Self::read_entry(&mut self.file.lock(), index)
    }

    fn put(&self, index: u64, value: u64) -> Result<()> {
        Self::write_entry(&mut self.file.lock(), index, value)
    }

    fn compare_and_set(&self, index: u64, expected: u64, new: u64) -> Result<bool> {
        let mut file = self.file.lock();
        if Self::read_entry(&mut file, index)? != expected {
            return Ok(false);
        }
        Self::write_entry(&mut file, index, new)?;
        Ok(true)
    }

    fn update_valid_range(&self, min: u64, len: u64) -> Result<()> {
        let mut file = self.file.lock();
        if file.metadata()?.len() > len * ENTRY_SIZE {
            file.set_len(len * ENTRY_SIZE)?;
        }
        let clear_to = min.min(len);
        if clear_to > 0 {
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&vec![0u8; (clear_to * ENTRY_SIZE) as usize])?;
        }
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.file.lock().metadata()?.len() / ENTRY_SIZE)
    }

    fn write_to_file(&self, path: &Path, sync: bool) -> Result<()> {
        let file = self.file.lock();
        if path == self.path {
            if sync {
                file.sync_all()?;
            }
            return Ok(());
        }
        let tmp = fs_util::tmp_path(path);
        fs::copy(&self.path, &tmp)?;
        if sync {
            File::open(&tmp)?.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(list: &LongList) {
        list.put(3, 30).unwrap();
        list.put(10, 100).unwrap();
        assert_eq!(list.get(3).unwrap(), 30);
        assert_eq!(list.get(4).unwrap(), 0);
        assert_eq!(list.get(1000).unwrap(), 0);
        assert_eq!(list.size().unwrap(), 11);

        assert!(!list.compare_and_set(3, 31, 50).unwrap());
        assert!(list.compare_and_set(3, 30, 50).unwrap());
        assert_eq!(list.get(3).unwrap(), 50);

        list.update_valid_range(4, 8).unwrap();
        assert_eq!(list.get(3).unwrap(), 0);
        assert_eq!(list.get(10).unwrap(), 0);
        assert_eq!(list.size().unwrap(), 9);
    }

    #[test]
    fn test_memory_list() {
        exercise(&LongList::new_memory());
    }

    #[test]
    fn test_disk_list() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&LongList::load(&dir.path().join("list.ll"), true).unwrap());
    }

    #[test]
    fn test_memory_list_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.ll");
        let list = LongList::new_memory();
        list.put(0, 7).unwrap();
        list.put(5, 9).unwrap();
        list.write_to_file(&path, false).unwrap();

        assert_eq!(fs::metadata(&path).unwrap().len(), 6 * ENTRY_SIZE);
        let loaded = LongList::load(&path, false).unwrap();
        assert_eq!(loaded.get(0).unwrap(), 7);
        assert_eq!(loaded.get(5).unwrap(), 9);
    }

    #[test]
    fn test_disk_list_does_not_touch_hard_links() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.ll");
        let list = LongList::new_memory();
        list.put(1, 11).unwrap();
        list.write_to_file(&path, false).unwrap();

        let snapshot = dir.path().join("snapshot.ll");
        fs::hard_link(&path, &snapshot).unwrap();

        let disk = LongList::load(&path, true).unwrap();
        disk.put(1, 22).unwrap();
        assert_eq!(disk.get(1).unwrap(), 22);
        assert_eq!(LongList::load(&snapshot, false).unwrap().get(1).unwrap(), 11);
    }

    #[test]
    fn test_clear_all() {
        let list = LongList::new_memory();
        list.put(2, 1).unwrap();
        list.update_valid_range(-1, -1).unwrap();
        assert_eq!(list.size().unwrap(), 0);
    }
}
