//! Mirror store error types.

use thiserror::Error;

/// Errors that can occur in the mirror store.
#[derive(Debug, Error)]
pub enum MirrorError {
    /// Object not found in the object database.
    #[error("object not found: {0}")]
    ObjectNotFound(String),

    /// Reference not found.
    #[error("ref not found: {0}")]
    RefNotFound(String),

    /// Malformed object payload.
    #[error("invalid object: {0}")]
    InvalidObject(String),

    /// Malformed pack file.
    #[error("invalid pack file: {0}")]
    InvalidPack(String),

    /// Compare-and-set failure on a ref update.
    #[error("ref update conflict on {name}: expected {expected}, found {found}")]
    RefConflict {
        /// Ref name the update targeted.
        name: String,
        /// Oid (or "absent") the caller expected.
        expected: String,
        /// Oid (or "absent") actually on disk.
        found: String,
    },

    /// A mirror invariant was violated (e.g. a ref points at a missing object).
    #[error("cache corruption: {0}")]
    Corrupt(String),

    /// Zlib compression or decompression failure.
    #[error("compression error: {0}")]
    Compression(String),

    /// Metadata (de)serialization failure.
    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for mirror operations.
pub type Result<T> = std::result::Result<T, MirrorError>;
