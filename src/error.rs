//! CANOPY - Custom Error Types
//! Defines the error hierarchy for the table storage engine.

use std::path::PathBuf;

use thiserror::Error;

/// Custom Result type for the Canopy engine.
pub type Result<T> = std::result::Result<T, CanopyError>;

/// Error types for the Canopy storage engine.
#[derive(Error, Debug)]
pub enum CanopyError {
    /// I/O errors from file operations (data files, indices, metadata).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Persisted data that cannot be interpreted.
    #[error("Data corruption detected: {0}")]
    Corruption(String),

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A record handed to the engine is malformed.
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// A negative tree path was passed to a load.
    #[error("Path ({0}) is not valid")]
    InvalidPath(i64),

    /// A primary table with this name already exists.
    #[error("Table already exists: {0}")]
    AlreadyExists(String),

    /// No primary table with this name exists.
    #[error("Unknown table: {0}")]
    UnknownTable(String),

    /// Every table slot is in use.
    #[error("Tables limit is reached ({0} tables)")]
    TablesExhausted(usize),

    /// Another snapshot of the same data source is running.
    #[error("[{0}] Tried to start a snapshot when one was already in progress")]
    SnapshotInProgress(String),

    /// A data source was passed to a database it does not belong to.
    #[error("Data source belongs to a different database")]
    CrossDatabase,

    /// A restore target already holds a database.
    #[error("Database already restored at {0:?}")]
    AlreadyRestored(PathBuf),

    /// A snapshot target holds a different set of tables.
    #[error("Cannot snapshot to an existing database at {0:?}")]
    SnapshotTargetExists(PathBuf),

    /// The data source is closing or closed.
    #[error("[{0}] Data source is closed")]
    Closed(String),

    /// An operation was called in a state that does not allow it.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Background work was cancelled.
    #[error("Interrupted: {0}")]
    Interrupted(String),

    /// A background task panicked.
    #[error("Task failed: {0}")]
    TaskFailed(String),

    /// Every failure collected while closing a data source.
    #[error("[{table}] {} error(s) while closing data source: {}", .errors.len(), join_errors(.errors))]
    Close {
        table: String,
        errors: Vec<CanopyError>,
    },
}

impl CanopyError {
    /// Returns true if this error signals cancellation rather than a failure.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, CanopyError::Interrupted(_))
    }
}

fn join_errors(errors: &[CanopyError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<bincode::Error> for CanopyError {
    fn from(err: bincode::Error) -> Self {
        CanopyError::Serialization(err.to_string())
    }
}
