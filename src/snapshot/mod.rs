//! Typed snapshots over segment and index files.
//!
//! The base [`Snapshot`] owns a path, a block range and a decompressor, and
//! offers the two access shapes everything else builds on: a sequential
//! scan over all words and a one-shot read at a recorded offset. The typed
//! wrappers decode the words as headers, bodies or transactions and route
//! keyed queries through their indices.
//!
//! Lifecycle: construction is inert; `reopen_segment` maps the segment,
//! `reopen_index` attaches indices, `close` releases everything. A missing
//! or stale index (older than its segment) leaves the snapshot in
//! segment-only mode: scans work, keyed lookups return `None`.

mod body;
mod header;
mod transaction;

use std::time::SystemTime;

use tracing::{info, trace, warn};

use crate::{
    decompress::Decompressor,
    error::SnapshotError,
    index::Index,
    path::SnapshotPath,
    types::BlockNum,
};

pub use body::BodySnapshot;
pub use header::HeaderSnapshot;
pub use transaction::TransactionSnapshot;

/// One decoded word of a segment.
#[derive(Debug, Clone, Default)]
pub struct WordItem {
    /// Raw word bytes.
    pub value: Vec<u8>,
    /// Byte offset of the next word, enabling cursor chaining.
    pub offset: u64,
    /// Zero-based index of this word within the segment.
    pub position: u64,
}

/// An untyped snapshot: a segment file covering a block range.
#[derive(Debug)]
pub struct Snapshot {
    path: SnapshotPath,
    block_from: BlockNum,
    block_to: BlockNum,
    decoder: Decompressor,
}

impl Snapshot {
    /// Creates an inert snapshot for the given file.
    ///
    /// Panics when the range is inverted; such a path never comes out of
    /// the codec, so this is a caller bug.
    pub fn new(path: SnapshotPath) -> Self {
        assert!(
            path.block_to() >= path.block_from(),
            "invalid block range: block_to {} less than block_from {}",
            path.block_to(),
            path.block_from(),
        );
        Snapshot {
            block_from: path.block_from(),
            block_to: path.block_to(),
            decoder: Decompressor::new(path.path().to_path_buf()),
            path,
        }
    }

    pub fn path(&self) -> &SnapshotPath {
        &self.path
    }

    /// First block covered.
    pub fn block_from(&self) -> BlockNum {
        self.block_from
    }

    /// One past the last block covered.
    pub fn block_to(&self) -> BlockNum {
        self.block_to
    }

    pub fn is_open(&self) -> bool {
        self.decoder.is_open()
    }

    /// Modification time of the open segment.
    pub fn last_write_time(&self) -> Option<SystemTime> {
        self.decoder.last_write_time()
    }

    /// Number of words in the open segment.
    pub fn item_count(&self) -> Option<u64> {
        self.decoder.count()
    }

    /// (Re)maps the segment file.
    pub fn reopen_segment(&mut self) -> Result<(), SnapshotError> {
        self.close_segment();
        self.decoder.open()?;
        Ok(())
    }

    pub fn close_segment(&mut self) {
        self.decoder.close();
    }

    /// Releases every resource. Idempotent.
    pub fn close(&mut self) {
        self.close_segment();
    }

    /// Sequentially scans every word. Returns `false` when `fn` cancelled
    /// the scan, `true` on exhaustion.
    pub fn for_each_item<F>(&self, mut f: F) -> Result<bool, SnapshotError>
    where
        F: FnMut(&WordItem) -> bool,
    {
        let result = self.decoder.read_ahead(|mut it| -> Result<bool, SnapshotError> {
            let mut item = WordItem::default();
            let mut position = 0u64;
            while it.has_next() {
                item.value.clear();
                item.offset = it.next(&mut item.value)?;
                item.position = position;
                trace!(offset = item.offset, position = item.position, "scan item");
                if !f(&item) {
                    return Ok(false);
                }
                position += 1;
            }
            Ok(true)
        })??;
        Ok(result)
    }

    /// Reads the single word starting at `offset`.
    ///
    /// Returns `None` when the offset is at or past the end, or when the
    /// word cannot be decoded: a corrupt offset is indistinguishable from a
    /// missing record at this layer, so the failure is logged and mapped to
    /// absence.
    pub fn next_item(&self, offset: u64) -> Option<WordItem> {
        trace!(offset, "next item");
        let mut it = match self.decoder.make_iterator() {
            Ok(it) => it,
            Err(err) => {
                warn!(offset, error = %err, "segment not readable");
                return None;
            }
        };
        it.reset(offset);
        if !it.has_next() {
            return None;
        }

        let mut item = WordItem::default();
        match it.next(&mut item.value) {
            Ok(next_offset) => {
                item.offset = next_offset;
                Some(item)
            }
            Err(err) => {
                warn!(offset, error = %err, "invalid word offset");
                None
            }
        }
    }

    /// Builds a `Corrupt` error pointing at this snapshot's file.
    pub(crate) fn corrupt(&self, reason: impl Into<String>) -> SnapshotError {
        SnapshotError::Corrupt {
            path: self.path.path().to_path_buf(),
            reason: reason.into(),
        }
    }

    /// Opens the candidate index next to the segment, rejecting it when it
    /// predates the segment. A stale index is reported as absent, which is
    /// the signal for an external packer to rebuild it.
    pub(crate) fn open_index_if_fresh(
        &self,
        index_path: &SnapshotPath,
    ) -> Result<Option<Index>, SnapshotError> {
        let segment_mtime = self
            .decoder
            .last_write_time()
            .expect("segment not open: call reopen_segment first");

        if !index_path.exists() {
            return Ok(None);
        }
        let index = Index::open(index_path.path())?;
        if index.last_write_time() < segment_mtime {
            info!(
                path = %index_path.path().display(),
                "index predates segment, ignoring until rebuilt"
            );
            return Ok(None);
        }
        Ok(Some(index))
    }
}
