//! Body snapshots.

use alloy_rlp::Decodable;
use tracing::trace;

use crate::{
    error::SnapshotError,
    index::Index,
    path::SnapshotPath,
    snapshot::{Snapshot, WordItem},
    types::{BlockBodyForStorage, BlockNum},
};

/// A segment of block bodies plus the number-to-ordinal index.
///
/// Word layout: the body-for-storage RLP, no hash prefix. Bodies carry the
/// id range of their transactions, which ties this segment to the
/// transaction segment of the same block range.
#[derive(Debug)]
pub struct BodySnapshot {
    snapshot: Snapshot,
    idx_body_number: Option<Index>,
}

impl BodySnapshot {
    pub fn new(path: SnapshotPath) -> Self {
        BodySnapshot {
            snapshot: Snapshot::new(path),
            idx_body_number: None,
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
        self.idx_body_number.is_some()
    }

    pub fn reopen_segment(&mut self) -> Result<(), SnapshotError> {
        self.snapshot.reopen_segment()
    }

    pub fn reopen_index(&mut self) -> Result<(), SnapshotError> {
        self.close_index();
        let index_path = self.snapshot.path().index_file();
        self.idx_body_number = self.snapshot.open_index_if_fresh(&index_path)?;
        Ok(())
    }

    pub fn close_index(&mut self) {
        self.idx_body_number = None;
    }

    pub fn close(&mut self) {
        self.close_index();
        self.snapshot.close_segment();
    }

    /// Walks every body in block order; the walker receives the block
    /// number derived from the word position.
    pub fn for_each_body<F>(&self, mut walker: F) -> Result<bool, SnapshotError>
    where
        F: FnMut(BlockNum, &BlockBodyForStorage) -> bool,
    {
        let mut failure = None;
        let done = self.snapshot.for_each_item(|item| {
            match self.decode_body(item) {
                Ok(body) => {
                    let number = self.snapshot.block_from() + item.position;
                    walker(number, &body)
                }
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

    /// Sums the transactions covered by this snapshot by scanning the
    /// bodies: returns `(first_txn_id, txn_count_total)`.
    pub fn compute_txs_amount(&self) -> Result<(u64, u64), SnapshotError> {
        let mut first_txn_id = None;
        let mut last_txn_id = None;
        let mut last_txs_amount = 0u64;

        let read_ok = self.for_each_body(|number, body| {
            if number == self.snapshot.block_from() {
                first_txn_id = Some(body.base_txn_id);
            }
            if number + 1 == self.snapshot.block_to() {
                last_txn_id = Some(body.base_txn_id);
                last_txs_amount = body.txn_count;
            }
            true
        })?;
        if !read_ok {
            return Err(self.snapshot.corrupt("error computing txs amount"));
        }

        match (first_txn_id, last_txn_id) {
            (Some(first), Some(last)) => {
                trace!(first, last, last_txs_amount, "computed txs amount");
                Ok((first, last + last_txs_amount - first))
            }
            _ => Err(self.snapshot.corrupt("empty body snapshot")),
        }
    }

    /// Decodes the single body at `offset`; `None` when there is no valid
    /// record there.
    pub fn next_body(&self, offset: u64) -> Result<Option<BlockBodyForStorage>, SnapshotError> {
        let Some(item) = self.snapshot.next_item(offset) else {
            return Ok(None);
        };
        let body = match self.decode_body(&item) {
            Ok(body) => body,
            Err(_) => return Ok(None),
        };

        // A body pointing below the index's first transaction means the
        // index belongs to a different segment.
        if let Some(index) = &self.idx_body_number {
            if body.base_txn_id < index.base_data_id() {
                return Err(self.snapshot.corrupt(format!(
                    "wrong index base data id {} for base txn id {}",
                    index.base_data_id(),
                    body.base_txn_id
                )));
            }
        }
        Ok(Some(body))
    }

    /// Looks a body up by block number through the ordinal table.
    pub fn body_by_number(
        &self,
        block_height: BlockNum,
    ) -> Result<Option<BlockBodyForStorage>, SnapshotError> {
        let Some(index) = &self.idx_body_number else {
            return Ok(None);
        };

        let Some(position) = block_height.checked_sub(index.base_data_id()) else {
            return Ok(None);
        };
        let Some(offset) = index.ordinal_lookup(position) else {
            return Ok(None);
        };
        self.next_body(offset)
    }

    fn decode_body(&self, item: &WordItem) -> Result<BlockBodyForStorage, SnapshotError> {
        let mut view = item.value.as_slice();
        let body = BlockBodyForStorage::decode(&mut view).map_err(|err| {
            self.snapshot
                .corrupt(format!("bad body at offset={}: {err}", item.offset))
        })?;
        trace!(
            offset = item.offset,
            base_txn_id = body.base_txn_id,
            txn_count = body.txn_count,
            "decoded body"
        );
        Ok(body)
    }
}
