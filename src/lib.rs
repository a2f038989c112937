//! CANOPY - Table Storage Engine for Merkle Trees
//!
//! An embedded storage engine that persists, per table, the node hashes of a tree by
//! path, a key-to-path index and the leaf records by path.
//!
//! ## Features
//! - **Hybrid hash store**: low paths in RAM, the rest in append-only data files
//! - **Key index**: long list for dense integer keys, hash map for arbitrary keys
//! - **Compaction**: size-tiered background merges with one task per store
//! - **Snapshots**: hard-linked, point-in-time copies of tables and databases
//! - **Metadata**: tagged binary format, legacy layout still readable
//! - **Metrics**: lock-free counters mirrored to a pluggable sink
//!
//! ## Example
//! ```no_run
//! use bytes::Bytes;
//! use canopy::{Config, Context, DigestKind, HashRecord, LeafRecord, TableConfig};
//!
//! let context = Context::new(Config::new("./data/canopy")).unwrap();
//! let database = context.default_instance().unwrap();
//! let config = TableConfig::new(DigestKind::Sha384, 1000, 100).unwrap();
//! let accounts = database.create_data_source("accounts", &config, true).unwrap();
//!
//! let leaf = LeafRecord::new(1, Bytes::from_static(b"alice"), Bytes::from_static(b"42"));
//! let hashes = vec![HashRecord::new(0, vec![0u8; 48]), HashRecord::new(1, vec![1u8; 48])];
//! accounts.save_records(1, 1, hashes, vec![leaf], vec![], false).unwrap();
//!
//! assert_eq!(accounts.find_key(b"alice").unwrap(), 1);
//! accounts.close().unwrap();
//! ```

pub mod codec;
pub mod config;
pub mod database;
pub mod engine;
pub mod error;
pub mod fs_util;
pub mod table;
pub mod types;

pub use config::Config;
pub use database::{Context, Database};
pub use engine::data_source::DataSource;
pub use engine::metrics::{MetricsSink, NoopSink, StoreKind};
pub use error::{CanopyError, Result};
pub use table::{DigestKind, KeyEncoding, TableConfig, TableMetadata};
pub use types::{HashRecord, KeyRange, LeafRecord, Path, INVALID_PATH};
