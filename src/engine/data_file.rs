//! CANOPY - Data Files
//! Immutable, append-only files holding the items of one store.
//!
//! ## Binary Format
//! ```text
//! header (32 bytes, LE):
//!   [magic "CDF1"][version u16][level u16][file index u32][item count u32][min seq u64][max seq u64]
//! items:
//!   [payload len u32][crc32 u32][seq u64][payload]
//! ```
//! The crc covers the sequence number and the payload. Files are written under a
//! `.tmp` name and renamed once complete, so a visible `.cdf` file is always whole.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::{CanopyError, Result};
use crate::fs_util;

pub const DATA_FILE_EXTENSION: &str = "cdf";
pub const HEADER_SIZE: u64 = 32;
const ITEM_HEADER_SIZE: usize = 16;
const MAGIC: &[u8; 4] = b"CDF1";
const FORMAT_VERSION: u16 = 1;

const OFFSET_BITS: u32 = 40;
const OFFSET_MASK: u64 = (1 << OFFSET_BITS) - 1;

/// Sentinel location for "nothing stored".
pub const NO_LOCATION: u64 = 0;

/// Pack a file index and byte offset into one location value.
pub fn data_location(file_index: u32, offset: u64) -> u64 {
    ((file_index as u64) << OFFSET_BITS) | (offset & OFFSET_MASK)
}

pub fn file_index_of(location: u64) -> u32 {
    (location >> OFFSET_BITS) as u32
}

pub fn offset_of(location: u64) -> u64 {
    location & OFFSET_MASK
}

/// Header at the start of every data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataFileHeader {
    pub level: u16,
    pub index: u32,
    pub item_count: u32,
    pub min_seq: u64,
    pub max_seq: u64,
}

impl DataFileHeader {
    fn encode(&self) -> [u8; HEADER_SIZE as usize] {
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(MAGIC);
        LittleEndian::write_u16(&mut buf[4..6], FORMAT_VERSION);
        LittleEndian::write_u16(&mut buf[6..8], self.level);
        LittleEndian::write_u32(&mut buf[8..12], self.index);
        LittleEndian::write_u32(&mut buf[12..16], self.item_count);
        LittleEndian::write_u64(&mut buf[16..24], self.min_seq);
        LittleEndian::write_u64(&mut buf[24..32], self.max_seq);
        buf
    }

    fn decode(buf: &[u8; HEADER_SIZE as usize]) -> Result<Self> {
        if &buf[0..4] != MAGIC {
            return Err(CanopyError::Corruption("bad data file magic".into()));
        }
        let version = LittleEndian::read_u16(&buf[4..6]);
        if version != FORMAT_VERSION {
            return Err(CanopyError::Corruption(format!(
                "unsupported data file version {version}"
            )));
        }
        Ok(Self {
            level: LittleEndian::read_u16(&buf[6..8]),
            index: LittleEndian::read_u32(&buf[8..12]),
            item_count: LittleEndian::read_u32(&buf[12..16]),
            min_seq: LittleEndian::read_u64(&buf[16..24]),
            max_seq: LittleEndian::read_u64(&buf[24..32]),
        })
    }
}

/// One stored item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataItem {
    pub seq: u64,
    pub payload: Bytes,
}

fn item_crc(seq: u64, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&seq.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// File name of data file `index` of a store.
pub fn data_file_name(store_name: &str, index: u32) -> String {
    format!("{store_name}_{index:06}.{DATA_FILE_EXTENSION}")
}

/// Parse the index out of a data file name written by [`data_file_name`].
pub fn parse_data_file_name(store_name: &str, file_name: &str) -> Option<u32> {
    let rest = file_name.strip_prefix(store_name)?.strip_prefix('_')?;
    let digits = rest.strip_suffix(DATA_FILE_EXTENSION)?.strip_suffix('.')?;
    digits.parse().ok()
}

/// Writes one data file. Dropping an unfinished writer deletes its temporary file.
pub struct DataFileWriter {
    header: DataFileHeader,
    tmp_path: PathBuf,
    final_path: PathBuf,
    writer: Option<BufWriter<File>>,
    offset: u64,
}

impl DataFileWriter {
    pub fn create(dir: &Path, store_name: &str, index: u32, level: u16) -> Result<Self> {
        let final_path = dir.join(data_file_name(store_name, index));
        let tmp_path = fs_util::tmp_path(&final_path);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let header = DataFileHeader {
            level,
            index,
            item_count: 0,
            min_seq: u64::MAX,
            max_seq: 0,
        };
        let mut writer = BufWriter::new(file);
        // Placeholder, rewritten by finish()
        writer.write_all(&header.encode())?;
        Ok(Self {
            header,
            tmp_path,
            final_path,
            writer: Some(writer),
            offset: HEADER_SIZE,
        })
    }

    pub fn index(&self) -> u32 {
        self.header.index
    }

    pub fn item_count(&self) -> u32 {
        self.header.item_count
    }

    /// Append an item and return its location.
    pub fn write(&mut self, seq: u64, payload: &[u8]) -> Result<u64> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| CanopyError::InvalidState("data file writer is finished".into()))?;
        let len = u32::try_from(payload.len())
            .map_err(|_| CanopyError::InvalidRecord(format!("item of {} bytes", payload.len())))?;
        if self.header.item_count == u32::MAX || self.offset > OFFSET_MASK {
            return Err(CanopyError::InvalidState("data file is full".into()));
        }

        let location = data_location(self.header.index, self.offset);
        writer.write_u32::<LittleEndian>(len)?;
        writer.write_u32::<LittleEndian>(item_crc(seq, payload))?;
        writer.write_u64::<LittleEndian>(seq)?;
        writer.write_all(payload)?;

        self.offset += (ITEM_HEADER_SIZE + payload.len()) as u64;
        self.header.item_count += 1;
        self.header.min_seq = self.header.min_seq.min(seq);
        self.header.max_seq = self.header.max_seq.max(seq);
        Ok(location)
    }

    /// Complete the file, rename it into place and open it for reading.
    pub fn finish(mut self, sync: bool) -> Result<DataFileReader> {
        let writer = self
            .writer
            .take()
            .ok_or_else(|| CanopyError::InvalidState("data file writer is finished".into()))?;
        let mut file = writer
            .into_inner()
            .map_err(|e| CanopyError::Io(e.into_error()))?;
        if self.header.item_count == 0 {
            self.header.min_seq = 0;
        }
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&self.header.encode())?;
        if sync {
            file.sync_all()?;
        }
        drop(file);
        fs::rename(&self.tmp_path, &self.final_path)?;
        DataFileReader::open(&self.final_path)
    }
}

impl Drop for DataFileWriter {
    fn drop(&mut self) {
        if self.writer.take().is_some() {
            if let Err(e) = fs::remove_file(&self.tmp_path) {
                log::warn!("Failed to remove abandoned data file {:?}: {}", self.tmp_path, e);
            }
        }
    }
}

/// Read access to a finished data file.
#[derive(Debug)]
pub struct DataFileReader {
    path: PathBuf,
    header: DataFileHeader,
    size: u64,
    file: Mutex<File>,
}

impl DataFileReader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let size = file.metadata()?.len();
        let mut buf = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut buf).map_err(|e| {
            CanopyError::Corruption(format!("data file {path:?} has no header: {e}"))
        })?;
        let header = DataFileHeader::decode(&buf)?;
        Ok(Self {
            path: path.to_path_buf(),
            header,
            size,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &DataFileHeader {
        &self.header
    }

    pub fn index(&self) -> u32 {
        self.header.index
    }

    pub fn level(&self) -> u16 {
        self.header.level
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Read the item at a byte offset.
    pub fn read_at(&self, offset: u64) -> Result<DataItem> {
        if offset < HEADER_SIZE || offset >= self.size {
            return Err(CanopyError::Corruption(format!(
                "offset {offset} outside data file {:?}",
                self.path
            )));
        }
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        read_item(&mut *file, &self.path, self.size - offset)
    }

    /// Iterate over `(location, item)` pairs in file order.
    pub fn iter(&self) -> Result<DataFileIter> {
        let mut reader = BufReader::new(File::open(&self.path)?);
        reader.seek(SeekFrom::Start(HEADER_SIZE))?;
        Ok(DataFileIter {
            reader,
            path: self.path.clone(),
            file_index: self.header.index,
            offset: HEADER_SIZE,
            file_size: self.size,
            remaining: self.header.item_count,
        })
    }
}

/// Read one item from at most `available` bytes.
fn read_item<R: Read>(reader: &mut R, path: &Path, available: u64) -> Result<DataItem> {
    let len = reader.read_u32::<LittleEndian>()?;
    if ITEM_HEADER_SIZE as u64 + u64::from(len) > available {
        return Err(CanopyError::Corruption(format!(
            "item of {len} bytes overruns data file {path:?}"
        )));
    }
    let crc = reader.read_u32::<LittleEndian>()?;
    let seq = reader.read_u64::<LittleEndian>()?;
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    if item_crc(seq, &payload) != crc {
        return Err(CanopyError::Corruption(format!(
            "checksum mismatch in data file {path:?}"
        )));
    }
    Ok(DataItem {
        seq,
        payload: Bytes::from(payload),
    })
}

/// Sequential reader over the items of one file.
pub struct DataFileIter {
    reader: BufReader<File>,
    path: PathBuf,
    file_index: u32,
    offset: u64,
    file_size: u64,
    remaining: u32,
}

impl Iterator for DataFileIter {
    type Item = Result<(u64, DataItem)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let location = data_location(self.file_index, self.offset);
        let available = self.file_size.saturating_sub(self.offset);
        match read_item(&mut self.reader, &self.path, available) {
            Ok(item) => {
                self.offset += (ITEM_HEADER_SIZE + item.payload.len()) as u64;
                Some(Ok((location, item)))
            }
            Err(e) => {
                self.remaining = 0;
                Some(Err(e))
            }
        }
    }
}
