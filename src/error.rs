//! Crate-wide error type.

use crate::mbr::FileSystemKind;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the top-level operations.
///
/// Malformed inbound datagrams are not represented here: they are recovered
/// locally at the dispatch boundary (logged and dropped, see
/// [`crate::proto::PacketError`]).
#[derive(Debug, Error)]
pub enum Error {
    /// A block read got no response before the deadline.
    ///
    /// Carries the request frame that went unanswered, for diagnostics.
    #[error("block read (transfer {transfer_id}) timed out")]
    Timeout { transfer_id: u32, request: Vec<u8> },

    /// The selected partition does not hold a file system this crate reads.
    #[error("unsupported file system: {found}")]
    UnsupportedFileSystem { found: FileSystemKind },

    /// A path segment or directory lookup did not match any entry.
    #[error("directory not found: {0}")]
    DirectoryNotFound(String),

    /// A file lookup did not match any entry.
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// The requested partition index is past the end of the partition table.
    #[error("partition index {index} out of range ({count} partitions)")]
    PartitionOutOfRange { index: usize, count: usize },

    /// Socket or local file-sink failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
