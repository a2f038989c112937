//! CANOPY - Record Payloads
//! Item payloads of the hash and leaf stores. Both start with the tree path.
//!
//! ```text
//! hash: [path i64][digest]
//! leaf: [path i64][key len u32][key][value len u32][value]
//! ```

use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;

use crate::error::{CanopyError, Result};
use crate::types::{HashRecord, LeafRecord, Path};

const PATH_SIZE: usize = 8;
const LEN_SIZE: usize = 4;

/// Tree path at the start of a payload.
pub fn path_of(payload: &[u8]) -> Result<Path> {
    if payload.len() < PATH_SIZE {
        return Err(CanopyError::Corruption(format!(
            "payload of {} bytes has no path",
            payload.len()
        )));
    }
    Ok(LittleEndian::read_i64(&payload[..PATH_SIZE]))
}

pub fn encode_hash(record: &HashRecord) -> Vec<u8> {
    let mut buf = vec![0u8; PATH_SIZE];
    LittleEndian::write_i64(&mut buf, record.path);
    buf.extend_from_slice(&record.hash);
    buf
}

pub fn decode_hash(payload: Bytes) -> Result<HashRecord> {
    let path = path_of(&payload)?;
    Ok(HashRecord {
        path,
        hash: payload.slice(PATH_SIZE..),
    })
}

pub fn encode_leaf(record: &LeafRecord) -> Vec<u8> {
    let mut buf = vec![0u8; PATH_SIZE + 2 * LEN_SIZE + record.key.len() + record.value.len()];
    LittleEndian::write_i64(&mut buf[..PATH_SIZE], record.path);
    let mut pos = PATH_SIZE;
    for part in [&record.key, &record.value] {
        LittleEndian::write_u32(&mut buf[pos..pos + LEN_SIZE], part.len() as u32);
        pos += LEN_SIZE;
        buf[pos..pos + part.len()].copy_from_slice(part);
        pos += part.len();
    }
    buf
}

pub fn decode_leaf(payload: Bytes) -> Result<LeafRecord> {
    let path = path_of(&payload)?;
    let mut pos = PATH_SIZE;
    let read_part = |pos: &mut usize| -> Result<Bytes> {
        let truncated = || CanopyError::Corruption(format!("leaf record at path {path} is truncated"));
        let len_end = *pos + LEN_SIZE;
        if payload.len() < len_end {
            return Err(truncated());
        }
        let len = LittleEndian::read_u32(&payload[*pos..len_end]) as usize;
        let end = len_end + len;
        if payload.len() < end {
            return Err(truncated());
        }
        *pos = end;
        Ok(payload.slice(len_end..end))
    };
    let key = read_part(&mut pos)?;
    let value = read_part(&mut pos)?;
    Ok(LeafRecord { path, key, value })
}
