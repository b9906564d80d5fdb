//! Error type shared by the shard engine.

use std::fmt;

/// Failures surfaced by the FlatIndex, ShardStore, and blob adapter.
#[derive(Debug)]
pub enum StoreError {
    /// A vector's length did not match the configured dimensionality.
    Dimension { want: usize, have: usize },
    /// The blob store rejected or failed an operation.
    Blob(String),
    /// A persisted record could not be decoded.
    Corrupt(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Dimension { want, have } => {
                write!(f, "invalid vector length, want {want}, have {have}")
            }
            StoreError::Blob(msg) => write!(f, "blob store error: {msg}"),
            StoreError::Corrupt(msg) => write!(f, "corrupt record: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}
