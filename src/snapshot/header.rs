//! Header snapshots.

use alloy_primitives::B256;
use alloy_rlp::Decodable;
use tracing::trace;

use crate::{
    error::SnapshotError,
    index::Index,
    path::SnapshotPath,
    snapshot::{Snapshot, WordItem},
    types::{BlockNum, Header},
};

/// A segment of block headers plus the hash-to-ordinal index.
///
/// Word layout: the first byte of the header hash (an opaque checksum,
/// ignored here) followed by the RLP-encoded header.
#[derive(Debug)]
pub struct HeaderSnapshot {
    snapshot: Snapshot,
    idx_header_hash: Option<Index>,
}

impl HeaderSnapshot {
    pub fn new(path: SnapshotPath) -> Self {
        HeaderSnapshot {
            snapshot: Snapshot::new(path),
            idx_header_hash: None,
        }
    }

    pub fn path(&self) -> &SnapshotPath {
        self.snapshot.path()
    }

    pub fn block_from(&self) -> BlockNum {
        self.snapshot.block_from()
    }

    pub fn block_to(&self) -> BlockNum {
        self.snapshot.block_to()
    }

    pub fn has_index(&self) -> bool {
        self.idx_header_hash.is_some()
    }

    pub fn reopen_segment(&mut self) -> Result<(), SnapshotError> {
        self.snapshot.reopen_segment()
    }

    /// Attaches the hash index if present and at least as new as the
    /// segment. The segment must be open.
    pub fn reopen_index(&mut self) -> Result<(), SnapshotError> {
        self.close_index();
        let index_path = self.snapshot.path().index_file();
        self.idx_header_hash = self.snapshot.open_index_if_fresh(&index_path)?;
        Ok(())
    }

    pub fn close_index(&mut self) {
        self.idx_header_hash = None;
    }

    pub fn close(&mut self) {
        self.close_index();
        self.snapshot.close_segment();
    }

    /// Walks every header in block order. Returns `false` when the walker
    /// cancelled or a word failed to decode.
    pub fn for_each_header<F>(&self, mut walker: F) -> Result<bool, SnapshotError>
    where
        F: FnMut(&Header) -> bool,
    {
        let mut failure = None;
        let done = self.snapshot.for_each_item(|item| {
            match self.decode_header(item) {
                Ok(Some(header)) => walker(&header),
                Ok(None) => false,
                Err(err) => {
                    failure = Some(err);
                    false
                }
            }
        })?;
        match failure {
            Some(err) => Err(err),
            None => Ok(done),
        }
    }

    /// Decodes the single header at `offset`; `None` when there is no valid
    /// record there.
    pub fn next_header(&self, offset: u64) -> Result<Option<Header>, SnapshotError> {
        let Some(item) = self.snapshot.next_item(offset) else {
            return Ok(None);
        };
        self.decode_header(&item)
    }

    /// Looks a header up by block hash.
    ///
    /// The index maps *any* hash to some ordinal, so the decoded header's
    /// hash is compared against the queried one; a mismatch means the hash
    /// is not in this snapshot.
    pub fn header_by_hash(&self, block_hash: &B256) -> Result<Option<Header>, SnapshotError> {
        let Some(index) = &self.idx_header_hash else {
            return Ok(None);
        };

        let position = index.lookup(block_hash.as_slice());
        trace!(%block_hash, position, "header by hash");
        let Some(offset) = index.ordinal_lookup(position) else {
            return Ok(None);
        };
        let Some(header) = self.next_header(offset)? else {
            return Ok(None);
        };
        if header.hash_slow() != *block_hash {
            return Ok(None);
        }
        Ok(Some(header))
    }

    /// Looks a header up by block number. Ordinals are dense in block
    /// order, so no confirmation is needed.
    pub fn header_by_number(&self, block_height: BlockNum) -> Result<Option<Header>, SnapshotError> {
        let Some(index) = &self.idx_header_hash else {
            return Ok(None);
        };
        if block_height < self.snapshot.block_from() || block_height >= self.snapshot.block_to() {
            return Ok(None);
        }

        let Some(position) = block_height.checked_sub(index.base_data_id()) else {
            return Ok(None);
        };
        let Some(offset) = index.ordinal_lookup(position) else {
            return Ok(None);
        };
        self.next_header(offset)
    }

    /// `Ok(None)` when the RLP payload does not decode; an error when the
    /// decoded header contradicts the snapshot's range, which means the
    /// file pair is corrupt.
    fn decode_header(&self, item: &WordItem) -> Result<Option<Header>, SnapshotError> {
        let Some(encoded) = item.value.get(1..) else {
            return Err(self
                .snapshot
                .corrupt(format!("hash first byte missing at offset={}", item.offset)));
        };

        let mut view = encoded;
        let header = match Header::decode(&mut view) {
            Ok(header) => header,
            Err(err) => {
                trace!(offset = item.offset, error = %err, "header decode failed");
                return Ok(None);
            }
        };

        if header.number < self.snapshot.block_from() {
            return Err(self.snapshot.corrupt(format!(
                "header number {} below block_from {}",
                header.number,
                self.snapshot.block_from()
            )));
        }
        Ok(Some(header))
    }
}
