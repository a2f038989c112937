//! CANOPY - Table Configuration
//! Immutable per-table settings and their tagged-field encoding.

pub mod metadata;

use crate::codec::{self, FieldReader, WIRE_VARINT};
use crate::error::{CanopyError, Result};

pub use metadata::{DatabaseMetadata, TableMetadata};

const FIELD_DIGEST: u32 = 1;
const FIELD_PREFER_DISK: u32 = 2;
const FIELD_MAX_KEYS: u32 = 3;
const FIELD_THRESHOLD: u32 = 4;
const FIELD_KEY_ENCODING: u32 = 5;

/// Digest algorithm of the hashes stored in a table. Only its length matters to storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestKind {
    Sha384,
    Sha256,
}

impl DigestKind {
    pub fn id(self) -> u32 {
        match self {
            DigestKind::Sha384 => 1,
            DigestKind::Sha256 => 2,
        }
    }

    pub fn from_id(id: u32) -> Result<Self> {
        match id {
            1 => Ok(DigestKind::Sha384),
            2 => Ok(DigestKind::Sha256),
            other => Err(CanopyError::Corruption(format!("unknown digest id {other}"))),
        }
    }

    /// Length in bytes of one digest.
    pub fn digest_len(self) -> usize {
        match self {
            DigestKind::Sha384 => 48,
            DigestKind::Sha256 => 32,
        }
    }
}

/// How leaf keys map onto the key index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyEncoding {
    /// Dense integer keys: exactly 8 bytes, little-endian u64.
    Sequential,
    /// Any byte string.
    #[default]
    Arbitrary,
}

impl KeyEncoding {
    fn id(self) -> u64 {
        match self {
            KeyEncoding::Arbitrary => 0,
            KeyEncoding::Sequential => 1,
        }
    }

    fn from_id(id: u64) -> Result<Self> {
        match id {
            0 => Ok(KeyEncoding::Arbitrary),
            1 => Ok(KeyEncoding::Sequential),
            other => Err(CanopyError::Corruption(format!("unknown key encoding {other}"))),
        }
    }
}

/// Settings fixed when a table is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableConfig {
    digest: DigestKind,
    max_number_of_keys: u64,
    hashes_ram_to_disk_threshold: i64,
    prefer_disk_based_indices: bool,
    key_encoding: KeyEncoding,
}

impl TableConfig {
    pub fn new(
        digest: DigestKind,
        max_number_of_keys: u64,
        hashes_ram_to_disk_threshold: i64,
    ) -> Result<Self> {
        if max_number_of_keys == 0 {
            return Err(CanopyError::Config(
                "max number of keys must be greater than 0".into(),
            ));
        }
        if hashes_ram_to_disk_threshold < 0 {
            return Err(CanopyError::Config(format!(
                "hashes RAM/disk threshold must be non-negative, got {hashes_ram_to_disk_threshold}"
            )));
        }
        Ok(Self {
            digest,
            max_number_of_keys,
            hashes_ram_to_disk_threshold,
            prefer_disk_based_indices: false,
            key_encoding: KeyEncoding::default(),
        })
    }

    pub fn with_prefer_disk_based_indices(mut self, prefer: bool) -> Self {
        self.prefer_disk_based_indices = prefer;
        self
    }

    pub fn with_key_encoding(mut self, encoding: KeyEncoding) -> Self {
        self.key_encoding = encoding;
        self
    }

    /// An independent value with identical fields.
    pub fn copy(&self) -> Self {
        self.clone()
    }

    pub fn digest(&self) -> DigestKind {
        self.digest
    }

    pub fn max_number_of_keys(&self) -> u64 {
        self.max_number_of_keys
    }

    /// Upper bound on the paths of a tree with `max_number_of_keys` leaves.
    pub fn max_path(&self) -> i64 {
        let max = self.max_number_of_keys.saturating_mul(2).min(i64::MAX as u64);
        (max as i64).max(1)
    }

    pub fn hashes_ram_to_disk_threshold(&self) -> i64 {
        self.hashes_ram_to_disk_threshold
    }

    pub fn prefer_disk_based_indices(&self) -> bool {
        self.prefer_disk_based_indices
    }

    pub fn key_encoding(&self) -> KeyEncoding {
        self.key_encoding
    }

    /// Whether any hashes live in the RAM store.
    pub fn has_ram_hash_store(&self) -> bool {
        self.hashes_ram_to_disk_threshold > 0
    }

    /// Whether any hashes live in the on-disk store.
    pub fn has_disk_hash_store(&self) -> bool {
        self.hashes_ram_to_disk_threshold < i64::MAX
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        codec::put_varint_field(&mut buf, FIELD_DIGEST, self.digest.id() as u64);
        if self.prefer_disk_based_indices {
            codec::put_varint_field(&mut buf, FIELD_PREFER_DISK, 1);
        }
        codec::put_varint_field(&mut buf, FIELD_MAX_KEYS, self.max_number_of_keys);
        if self.hashes_ram_to_disk_threshold != 0 {
            codec::put_varint_field(
                &mut buf,
                FIELD_THRESHOLD,
                self.hashes_ram_to_disk_threshold as u64,
            );
        }
        if self.key_encoding != KeyEncoding::Arbitrary {
            codec::put_varint_field(&mut buf, FIELD_KEY_ENCODING, self.key_encoding.id());
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = FieldReader::new(bytes);
        let mut digest = None;
        let mut max_keys = 0u64;
        let mut threshold = 0u64;
        let mut prefer_disk = false;
        let mut key_encoding = KeyEncoding::default();

        while reader.has_remaining() {
            let (field, wire) = reader.read_tag()?;
            codec::expect_wire(field, wire, WIRE_VARINT)?;
            let value = reader.read_varint()?;
            match field {
                FIELD_DIGEST => {
                    let id = u32::try_from(value).map_err(|_| {
                        CanopyError::Corruption(format!("digest id out of range: {value}"))
                    })?;
                    digest = Some(DigestKind::from_id(id)?);
                }
                FIELD_PREFER_DISK => prefer_disk = value != 0,
                FIELD_MAX_KEYS => max_keys = value,
                FIELD_THRESHOLD => threshold = value,
                FIELD_KEY_ENCODING => key_encoding = KeyEncoding::from_id(value)?,
                other => {
                    return Err(CanopyError::Corruption(format!(
                        "unknown table config field {other}"
                    )))
                }
            }
        }

        let digest =
            digest.ok_or_else(|| CanopyError::Corruption("table config without digest".into()))?;
        if threshold > i64::MAX as u64 {
            return Err(CanopyError::Corruption(format!(
                "hashes RAM/disk threshold out of range: {threshold}"
            )));
        }
        let config = TableConfig::new(digest, max_keys, threshold as i64)
            .map_err(|e| CanopyError::Corruption(e.to_string()))?;
        Ok(config
            .with_prefer_disk_based_indices(prefer_disk)
            .with_key_encoding(key_encoding))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_zero_max_keys() {
        let result = TableConfig::new(DigestKind::Sha384, 0, 0);
        assert!(matches!(result, Err(CanopyError::Config(_))));
    }

    #[test]
    fn test_rejects_negative_threshold() {
        let result = TableConfig::new(DigestKind::Sha384, 10, -1);
        assert!(matches!(result, Err(CanopyError::Config(_))));
    }

    #[test]
    fn test_encode_decode_preserves_fields() {
        let config = TableConfig::new(DigestKind::Sha256, 1_000_000, 4096)
            .unwrap()
            .with_prefer_disk_based_indices(true)
            .with_key_encoding(KeyEncoding::Sequential);
        let decoded = TableConfig::decode(&config.encode()).unwrap();
        assert_eq!(decoded, config);
    }

    #[test]
    fn test_optional_fields_are_omitted() {
        let config = TableConfig::new(DigestKind::Sha384, 5, 0).unwrap();
        // digest tag + value, max keys tag + value
        assert_eq!(config.encode().len(), 4);
    }

    #[test]
    fn test_unknown_field_is_corruption() {
        let mut bytes = TableConfig::new(DigestKind::Sha384, 5, 0).unwrap().encode();
        codec::put_varint_field(&mut bytes, 9, 1);
        assert!(matches!(
            TableConfig::decode(&bytes),
            Err(CanopyError::Corruption(_))
        ));
    }

    #[test]
    fn test_missing_max_keys_is_corruption() {
        let mut bytes = Vec::new();
        codec::put_varint_field(&mut bytes, FIELD_DIGEST, 1);
        assert!(matches!(
            TableConfig::decode(&bytes),
            Err(CanopyError::Corruption(_))
        ));
    }

    #[test]
    fn test_store_presence_follows_threshold() {
        let all_disk = TableConfig::new(DigestKind::Sha384, 5, 0).unwrap();
        assert!(!all_disk.has_ram_hash_store());
        assert!(all_disk.has_disk_hash_store());

        let all_ram = TableConfig::new(DigestKind::Sha384, 5, i64::MAX).unwrap();
        assert!(all_ram.has_ram_hash_store());
        assert!(!all_ram.has_disk_hash_store());
    }

    #[test]
    fn test_max_path_bounds() {
        assert_eq!(TableConfig::new(DigestKind::Sha384, 1, 0).unwrap().max_path(), 2);
        assert_eq!(TableConfig::new(DigestKind::Sha384, 1000, 0).unwrap().max_path(), 2000);
        assert_eq!(
            TableConfig::new(DigestKind::Sha384, u64::MAX, 0).unwrap().max_path(),
            i64::MAX
        );
    }

    #[test]
    fn test_oversized_digest_id_is_corruption() {
        let mut bytes = Vec::new();
        codec::put_varint_field(&mut bytes, FIELD_DIGEST, u64::from(u32::MAX) + 2);
        codec::put_varint_field(&mut bytes, FIELD_MAX_KEYS, 5);
        assert!(matches!(
            TableConfig::decode(&bytes),
            Err(CanopyError::Corruption(_))
        ));
    }

    #[test]
    fn test_copy_is_equal() {
        let config = TableConfig::new(DigestKind::Sha384, 7, 3).unwrap();
        let copy = config.copy();
        assert_eq!(copy, config);
    }
}
