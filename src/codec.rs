//! CANOPY - Tagged Field Encoding
//! Small protobuf-style encoding used by metadata files: every field is a varint tag
//! (`field << 3 | wire_type`) followed by a varint or a length-delimited byte string.

use crate::error::{CanopyError, Result};

pub const WIRE_VARINT: u8 = 0;
pub const WIRE_LEN: u8 = 2;

const TAG_FIELD_OFFSET: u32 = 3;

/// Append an unsigned LEB128 varint.
pub fn put_varint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

pub fn put_tag(buf: &mut Vec<u8>, field: u32, wire_type: u8) {
    put_varint(buf, ((field << TAG_FIELD_OFFSET) | wire_type as u32) as u64);
}

pub fn put_varint_field(buf: &mut Vec<u8>, field: u32, value: u64) {
    put_tag(buf, field, WIRE_VARINT);
    put_varint(buf, value);
}

pub fn put_bytes_field(buf: &mut Vec<u8>, field: u32, bytes: &[u8]) {
    put_tag(buf, field, WIRE_LEN);
    put_varint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

/// Cursor over a tagged-field buffer.
pub struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn has_remaining(&self) -> bool {
        self.pos < self.buf.len()
    }

    pub fn read_varint(&mut self) -> Result<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = *self
                .buf
                .get(self.pos)
                .ok_or_else(|| CanopyError::Corruption("truncated varint".into()))?;
            self.pos += 1;
            if shift >= 64 {
                return Err(CanopyError::Corruption("varint too long".into()));
            }
            value |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    /// Read a tag and split it into `(field, wire_type)`.
    pub fn read_tag(&mut self) -> Result<(u32, u8)> {
        let tag = self.read_varint()?;
        if tag > u32::MAX as u64 {
            return Err(CanopyError::Corruption(format!("tag out of range: {tag}")));
        }
        let tag = tag as u32;
        Ok((tag >> TAG_FIELD_OFFSET, (tag & 0x7) as u8))
    }

    pub fn read_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_varint()? as usize;
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| CanopyError::Corruption("truncated length-delimited field".into()))?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }
}

/// Fail unless a field arrived with the expected wire type.
pub fn expect_wire(field: u32, actual: u8, expected: u8) -> Result<()> {
    if actual != expected {
        return Err(CanopyError::Corruption(format!(
            "field {field} has wire type {actual}, expected {expected}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_boundaries() {
        for value in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            put_varint(&mut buf, value);
            let mut reader = FieldReader::new(&buf);
            assert_eq!(reader.read_varint().unwrap(), value);
            assert!(!reader.has_remaining());
        }
    }

    #[test]
    fn test_single_byte_varint() {
        let mut buf = Vec::new();
        put_varint(&mut buf, 127);
        assert_eq!(buf, vec![0x7f]);
    }

    #[test]
    fn test_fields_in_sequence() {
        let mut buf = Vec::new();
        put_varint_field(&mut buf, 1, 42);
        put_bytes_field(&mut buf, 2, b"name");

        let mut reader = FieldReader::new(&buf);
        assert_eq!(reader.read_tag().unwrap(), (1, WIRE_VARINT));
        assert_eq!(reader.read_varint().unwrap(), 42);
        assert_eq!(reader.read_tag().unwrap(), (2, WIRE_LEN));
        assert_eq!(reader.read_bytes().unwrap(), b"name");
        assert!(!reader.has_remaining());
    }

    #[test]
    fn test_truncated_bytes_is_corruption() {
        let mut buf = Vec::new();
        put_tag(&mut buf, 2, WIRE_LEN);
        put_varint(&mut buf, 10);
        buf.extend_from_slice(b"abc");

        let mut reader = FieldReader::new(&buf);
        reader.read_tag().unwrap();
        assert!(matches!(reader.read_bytes(), Err(CanopyError::Corruption(_))));
    }
}
