//! Storage layer error types.

use crate::storage::block::BlockId;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur in the storage layer.
///
/// Filesystem failures are unrecoverable at this layer: each variant names
/// the failing operation and the offending block or file, with the underlying
/// `io::Error` attached as the source. Retry and repair policy belongs to the
/// layers above.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("cannot create database directory {path:?}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot scan database directory {path:?}")]
    ScanDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot remove temporary file {path:?}")]
    RemoveTemp {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot open {filename}")]
    OpenFile {
        filename: String,
        #[source]
        source: io::Error,
    },

    #[error("cannot access {filename}")]
    FileLength {
        filename: String,
        #[source]
        source: io::Error,
    },

    #[error("cannot read block {block}")]
    ReadBlock {
        block: BlockId,
        #[source]
        source: io::Error,
    },

    #[error("cannot write block {block}")]
    WriteBlock {
        block: BlockId,
        #[source]
        source: io::Error,
    },

    #[error("cannot append block {block}")]
    AppendBlock {
        block: BlockId,
        #[source]
        source: io::Error,
    },

    #[error("page buffer is {actual} bytes but the block size is {expected}")]
    PageSizeMismatch { expected: usize, actual: usize },

    #[error("a {len} byte value at offset {offset} does not fit in a page of {page_size} bytes")]
    PageOverflow {
        offset: usize,
        len: usize,
        page_size: usize,
    },

    #[error("page bytes at offset {offset} are not valid UTF-8")]
    PageCorrupt { offset: usize },
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
