//! CANOPY - Metadata Files
//! Encoding of the per-database table list (`metadata.cdb`) and the per-table
//! valid key range (`table.meta`).
//!
//! ## Database Metadata Format (current)
//! ```text
//! repeated field 1 (length-delimited) {
//!     1: table id     (varint)
//!     2: table name   (bytes, UTF-8)
//!     3: table config (bytes, see TableConfig::encode)
//!     4: primary      (varint, present only when set)
//! }
//! ```
//! The legacy layout is a bincode-encoded [`legacy::LegacyMetadata`]. It is still read
//! when the current format does not parse, and never written.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::codec::{self, FieldReader, WIRE_LEN, WIRE_VARINT};
use crate::error::{CanopyError, Result};
use crate::fs_util;
use crate::types::KeyRange;

use super::TableConfig;

const FIELD_TABLE: u32 = 1;

const FIELD_TABLE_ID: u32 = 1;
const FIELD_TABLE_NAME: u32 = 2;
const FIELD_TABLE_CONFIG: u32 = 3;
const FIELD_PRIMARY: u32 = 4;

const FIELD_MIN_VALID_KEY: u32 = 1;
const FIELD_MAX_VALID_KEY: u32 = 2;

/// Durable identity of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMetadata {
    pub table_id: u32,
    pub table_name: String,
    pub table_config: TableConfig,
}

impl TableMetadata {
    pub fn new(table_id: u32, table_name: impl Into<String>, table_config: TableConfig) -> Self {
        Self {
            table_id,
            table_name: table_name.into(),
            table_config,
        }
    }

    /// Directory name of this table under `tables/`.
    pub fn dir_name(&self) -> String {
        format!("{}-{}", self.table_name, self.table_id)
    }
}

/// One entry of the metadata file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredTable {
    pub metadata: TableMetadata,
    pub primary: bool,
}

/// Parsed contents of a database metadata file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatabaseMetadata {
    pub tables: Vec<StoredTable>,
}

/// Which layout a metadata file was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataFormat {
    Current,
    Legacy,
}

impl DatabaseMetadata {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for table in &self.tables {
            let mut record = Vec::new();
            codec::put_varint_field(&mut record, FIELD_TABLE_ID, table.metadata.table_id as u64);
            codec::put_bytes_field(
                &mut record,
                FIELD_TABLE_NAME,
                table.metadata.table_name.as_bytes(),
            );
            codec::put_bytes_field(
                &mut record,
                FIELD_TABLE_CONFIG,
                &table.metadata.table_config.encode(),
            );
            if table.primary {
                codec::put_varint_field(&mut record, FIELD_PRIMARY, 1);
            }
            codec::put_bytes_field(&mut buf, FIELD_TABLE, &record);
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = FieldReader::new(bytes);
        let mut tables = Vec::new();
        while reader.has_remaining() {
            let (field, wire) = reader.read_tag()?;
            if field != FIELD_TABLE {
                return Err(CanopyError::Corruption(format!(
                    "unknown metadata field {field}"
                )));
            }
            codec::expect_wire(field, wire, WIRE_LEN)?;
            tables.push(decode_table(reader.read_bytes()?)?);
        }
        Ok(Self { tables })
    }

    /// Parse the legacy layout. Every table is primary unless a later table reuses its name.
    pub fn decode_legacy(bytes: &[u8]) -> Result<Self> {
        let legacy: legacy::LegacyMetadata = bincode::deserialize(bytes)?;
        let mut newest: HashMap<&str, u32> = HashMap::new();
        for table in &legacy.tables {
            let id = newest.entry(table.name.as_str()).or_insert(table.id);
            *id = (*id).max(table.id);
        }
        let mut tables = Vec::with_capacity(legacy.tables.len());
        for table in &legacy.tables {
            let config = table.config.to_table_config()?;
            tables.push(StoredTable {
                metadata: TableMetadata::new(table.id, table.name.clone(), config),
                primary: newest.get(table.name.as_str()) == Some(&table.id),
            });
        }
        Ok(Self { tables })
    }

    /// Read a metadata file. Returns `None` if it does not exist.
    pub fn load(
        path: &Path,
        max_tables: usize,
        legacy_fallback: bool,
    ) -> Result<Option<(Self, MetadataFormat)>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let (metadata, format) = match Self::decode(&bytes) {
            Ok(metadata) => (metadata, MetadataFormat::Current),
            Err(current_err) if legacy_fallback => match Self::decode_legacy(&bytes) {
                Ok(metadata) => {
                    log::info!(
                        "Metadata file {:?} is in the legacy format ({} tables)",
                        path,
                        metadata.tables.len()
                    );
                    (metadata, MetadataFormat::Legacy)
                }
                Err(legacy_err) => {
                    return Err(CanopyError::Corruption(format!(
                        "cannot read metadata file {path:?}: {current_err}; legacy: {legacy_err}"
                    )))
                }
            },
            Err(e) => return Err(e),
        };

        metadata.validate(max_tables)?;
        Ok(Some((metadata, format)))
    }

    /// Write the current format, replacing the file atomically.
    pub fn store(&self, path: &Path, sync: bool) -> Result<()> {
        fs_util::write_atomically(path, &self.encode(), sync)
    }

    fn validate(&self, max_tables: usize) -> Result<()> {
        let mut seen = vec![false; max_tables];
        for table in &self.tables {
            let id = table.metadata.table_id as usize;
            if id >= max_tables {
                return Err(CanopyError::Corruption(format!(
                    "table id {id} out of range (max {max_tables})"
                )));
            }
            if seen[id] {
                return Err(CanopyError::Corruption(format!("duplicate table id {id}")));
            }
            seen[id] = true;
        }
        Ok(())
    }
}

fn decode_table(bytes: &[u8]) -> Result<StoredTable> {
    let mut reader = FieldReader::new(bytes);
    let mut table_id = None;
    let mut table_name = None;
    let mut table_config = None;
    let mut primary = false;

    while reader.has_remaining() {
        let (field, wire) = reader.read_tag()?;
        match field {
            FIELD_TABLE_ID => {
                codec::expect_wire(field, wire, WIRE_VARINT)?;
                let id = reader.read_varint()?;
                let id = u32::try_from(id)
                    .map_err(|_| CanopyError::Corruption(format!("table id {id} out of range")))?;
                table_id = Some(id);
            }
            FIELD_TABLE_NAME => {
                codec::expect_wire(field, wire, WIRE_LEN)?;
                let name = std::str::from_utf8(reader.read_bytes()?)
                    .map_err(|e| CanopyError::Corruption(format!("table name: {e}")))?;
                table_name = Some(name.to_string());
            }
            FIELD_TABLE_CONFIG => {
                codec::expect_wire(field, wire, WIRE_LEN)?;
                table_config = Some(TableConfig::decode(reader.read_bytes()?)?);
            }
            FIELD_PRIMARY => {
                codec::expect_wire(field, wire, WIRE_VARINT)?;
                primary = reader.read_varint()? != 0;
            }
            other => {
                return Err(CanopyError::Corruption(format!(
                    "unknown table metadata field {other}"
                )))
            }
        }
    }

    match (table_id, table_name, table_config) {
        (Some(table_id), Some(table_name), Some(table_config)) => Ok(StoredTable {
            metadata: TableMetadata {
                table_id,
                table_name,
                table_config,
            },
            primary,
        }),
        _ => Err(CanopyError::Corruption("incomplete table metadata".into())),
    }
}

/// Encode a table's valid key range for `table.meta`.
pub fn encode_key_range(range: KeyRange) -> Vec<u8> {
    let mut buf = Vec::with_capacity(20);
    if range.min_valid_key != 0 {
        codec::put_varint_field(&mut buf, FIELD_MIN_VALID_KEY, range.min_valid_key as u64);
    }
    if range.max_valid_key != 0 {
        codec::put_varint_field(&mut buf, FIELD_MAX_VALID_KEY, range.max_valid_key as u64);
    }
    buf
}

pub fn decode_key_range(bytes: &[u8]) -> Result<KeyRange> {
    let mut reader = FieldReader::new(bytes);
    let mut range = KeyRange::new(0, 0);
    while reader.has_remaining() {
        let (field, wire) = reader.read_tag()?;
        codec::expect_wire(field, wire, WIRE_VARINT)?;
        let value = reader.read_varint()? as i64;
        match field {
            FIELD_MIN_VALID_KEY => range.min_valid_key = value,
            FIELD_MAX_VALID_KEY => range.max_valid_key = value,
            other => {
                return Err(CanopyError::Corruption(format!(
                    "unknown table.meta field {other}"
                )))
            }
        }
    }
    Ok(range)
}

pub mod legacy {
    //! Read-only legacy metadata layout.

    use serde::{Deserialize, Serialize};

    use crate::error::Result;
    use crate::table::{DigestKind, TableConfig};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct LegacyMetadata {
        pub tables: Vec<LegacyTable>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct LegacyTable {
        pub id: u32,
        pub name: String,
        pub config: LegacyTableConfig,
    }

    /// The serialization version fields are unused and only kept so old files parse.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct LegacyTableConfig {
        pub hashes_version: u16,
        pub keys_version: u16,
        pub values_version: u16,
        pub digest_id: u32,
        pub max_number_of_keys: u64,
        pub hashes_ram_to_disk_threshold: i64,
        pub prefer_disk_based_indices: bool,
    }

    impl LegacyTableConfig {
        pub fn to_table_config(&self) -> Result<TableConfig> {
            let digest = DigestKind::from_id(self.digest_id)?;
            Ok(TableConfig::new(
                digest,
                self.max_number_of_keys,
                self.hashes_ram_to_disk_threshold,
            )
            .map_err(|e| crate::error::CanopyError::Corruption(e.to_string()))?
            .with_prefer_disk_based_indices(self.prefer_disk_based_indices))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::legacy::*;
    use super::*;
    use crate::table::DigestKind;

    fn config(threshold: i64) -> TableConfig {
        TableConfig::new(DigestKind::Sha384, 100, threshold).unwrap()
    }

    fn sample() -> DatabaseMetadata {
        DatabaseMetadata {
            tables: vec![
                StoredTable {
                    metadata: TableMetadata::new(0, "accounts", config(10)),
                    primary: true,
                },
                StoredTable {
                    metadata: TableMetadata::new(7, "accounts", config(10)),
                    primary: false,
                },
                StoredTable {
                    metadata: TableMetadata::new(3, "storage", config(0)),
                    primary: true,
                },
            ],
        }
    }

    fn legacy_bytes() -> Vec<u8> {
        let legacy_config = |threshold| LegacyTableConfig {
            hashes_version: 1,
            keys_version: 1,
            values_version: 1,
            digest_id: 1,
            max_number_of_keys: 100,
            hashes_ram_to_disk_threshold: threshold,
            prefer_disk_based_indices: false,
        };
        bincode::serialize(&LegacyMetadata {
            tables: vec![
                LegacyTable {
                    id: 1,
                    name: "accounts".into(),
                    config: legacy_config(10),
                },
                LegacyTable {
                    id: 4,
                    name: "accounts".into(),
                    config: legacy_config(10),
                },
                LegacyTable {
                    id: 2,
                    name: "storage".into(),
                    config: legacy_config(0),
                },
            ],
        })
        .unwrap()
    }

    #[test]
    fn test_current_format_round_trip() {
        let metadata = sample();
        assert_eq!(DatabaseMetadata::decode(&metadata.encode()).unwrap(), metadata);
    }

    #[test]
    fn test_legacy_marks_newest_name_primary() {
        let metadata = DatabaseMetadata::decode_legacy(&legacy_bytes()).unwrap();
        let primary: Vec<u32> = metadata
            .tables
            .iter()
            .filter(|t| t.primary)
            .map(|t| t.metadata.table_id)
            .collect();
        assert_eq!(primary, vec![4, 2]);
    }

    #[test]
    fn test_load_falls_back_to_legacy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.cdb");
        fs::write(&path, legacy_bytes()).unwrap();

        let (metadata, format) = DatabaseMetadata::load(&path, 16, true).unwrap().unwrap();
        assert_eq!(format, MetadataFormat::Legacy);
        assert_eq!(metadata.tables.len(), 3);

        metadata.store(&path, false).unwrap();
        let (reloaded, format) = DatabaseMetadata::load(&path, 16, true).unwrap().unwrap();
        assert_eq!(format, MetadataFormat::Current);
        assert_eq!(reloaded, metadata);
    }

    #[test]
    fn test_legacy_rejected_without_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.cdb");
        fs::write(&path, legacy_bytes()).unwrap();
        assert!(DatabaseMetadata::load(&path, 16, false).is_err());
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = DatabaseMetadata::load(&dir.path().join("metadata.cdb"), 16, true).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_out_of_range_table_id_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.cdb");
        sample().store(&path, false).unwrap();
        let result = DatabaseMetadata::load(&path, 4, true);
        assert!(matches!(result, Err(CanopyError::Corruption(_))));
    }

    #[test]
    fn test_unknown_table_field_is_corruption() {
        let mut record = Vec::new();
        codec::put_varint_field(&mut record, FIELD_TABLE_ID, 1);
        codec::put_varint_field(&mut record, 12, 1);
        let mut bytes = Vec::new();
        codec::put_bytes_field(&mut bytes, FIELD_TABLE, &record);
        assert!(matches!(
            DatabaseMetadata::decode(&bytes),
            Err(CanopyError::Corruption(_))
        ));
    }

    #[test]
    fn test_key_range_encoding() {
        for range in [
            KeyRange::INVALID,
            KeyRange::new(0, 0),
            KeyRange::new(5, 9),
            KeyRange::new(0, 1 << 40),
        ] {
            assert_eq!(decode_key_range(&encode_key_range(range)).unwrap(), range);
        }
        assert!(encode_key_range(KeyRange::new(0, 0)).is_empty());
    }

    #[test]
    fn test_dir_name() {
        let table = TableMetadata::new(12, "accounts", config(0));
        assert_eq!(table.dir_name(), "accounts-12");
    }
}
