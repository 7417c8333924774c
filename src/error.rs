//! Snapshot-level error taxonomy.

use std::path::PathBuf;

use crate::{decompress::DecompressorError, index::IndexError, path::SnapshotPathError};

/// Error returned by snapshot operations.
///
/// Expected absence (a key that is not in a snapshot) is reported as
/// `Ok(None)` by the lookup methods, never as an error. Errors mean the
/// operation could not be carried out: the underlying file is unreadable,
/// malformed, or a decoded record violates a domain invariant.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Decompressor(#[from] DecompressorError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Path(#[from] SnapshotPathError),
    /// A decoded record violates a domain invariant, or a record promised by
    /// an index is missing. The file pair is unusable and needs repacking.
    #[error("corrupt snapshot {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}
