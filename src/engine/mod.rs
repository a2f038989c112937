//! CANOPY - Storage Engine Module
//! Stores and data sources behind every table.
//!
//! Bottom-up: data files and their collections, long lists and the RAM hash list, the
//! disk key/value store and key index built on them, compaction, and finally the
//! [`DataSource`](data_source::DataSource) composing all of it.

pub mod cache;
pub mod compaction;
pub mod coordinator;
pub mod data_file;
pub mod data_source;
pub mod disk_store;
pub mod executor;
pub mod file_collection;
pub mod hash_list;
pub mod key_index;
pub mod long_list;
pub mod metrics;
pub mod records;
