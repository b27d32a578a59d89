//! Error types for index building and native memory management.

use thiserror::Error;

/// Errors surfaced by the build pipeline and the native memory cache.
#[derive(Error, Debug)]
pub enum KnnError {
    /// I/O failure while writing or reading an index file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Native index construction failed for a field
    #[error("failed to build index for field '{field}': {cause}")]
    IndexBuildFailed { field: String, cause: String },

    /// Build was cancelled before completion
    #[error("index build for field '{field}' was aborted")]
    BuildAborted { field: String },

    /// Remote build service rejected or failed the request
    #[error("remote index build failed: {0}")]
    RemoteBuildFailed(String),

    /// Index file could not be deserialized into a native index
    #[error("failed to load index from '{path}': {cause}")]
    IndexLoadFailed { path: String, cause: String },

    /// Integrity footer is missing, malformed, or the checksum does not match
    #[error("corrupted index file '{path}': {details}")]
    CorruptedIndex { path: String, details: String },

    /// Computed checksum has bits set outside the low 32
    #[error("illegal CRC-32 checksum value: {checksum:#018x}")]
    IllegalChecksum { checksum: u64 },

    /// Admitting the entry would exceed the native memory budget
    #[error(
        "insufficient native memory: entry of {entry_size} bytes does not fit \
         ({cache_size}/{max_size} bytes in use)"
    )]
    OutOfNativeMemory {
        entry_size: u64,
        cache_size: u64,
        max_size: u64,
    },

    /// The allocation's native resources have already been released
    #[error("native memory allocation is closed")]
    AllocationClosed,

    /// Vector quantization failed
    #[error("quantization error: {0}")]
    Quantization(String),

    /// Configuration failed validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A vector did not match the expected per-vector byte length
    #[error("vector length mismatch: expected {expected} bytes, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Failure reported by the native index library
    #[error("native library error: {0}")]
    Native(String),
}

/// Convenience alias used throughout the crate.
pub type KnnResult<T> = Result<T, KnnError>;
