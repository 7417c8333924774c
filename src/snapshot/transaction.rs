//! Transaction snapshots.

use alloy_consensus::TxEnvelope;
use alloy_eips::eip2718::Decodable2718;
use alloy_primitives::{Address, B256};
use tracing::trace;

use crate::{
    error::SnapshotError,
    index::Index,
    path::{SnapshotPath, SnapshotType},
    snapshot::{Snapshot, WordItem},
    types::{BlockNum, Transaction},
};

const ADDRESS_LENGTH: usize = 20;
/// Word prefix: one hash byte plus the sender address.
const TXN_RLP_DATA_OFFSET: usize = 1 + ADDRESS_LENGTH;

/// A segment of transactions plus its two indices: tx hash to ordinal, and
/// the auxiliary tx hash to block number.
///
/// Word layout: the first byte of the transaction hash (an opaque checksum,
/// ignored here), the 20-byte sender address, then the transaction
/// envelope — a bare RLP list for legacy transactions, a type byte followed
/// by the payload RLP for typed ones.
#[derive(Debug)]
pub struct TransactionSnapshot {
    snapshot: Snapshot,
    idx_txn_hash: Option<Index>,
    idx_txn_hash_2_block: Option<Index>,
}

impl TransactionSnapshot {
    pub fn new(path: SnapshotPath) -> Self {
        TransactionSnapshot {
            snapshot: Snapshot::new(path),
            idx_txn_hash: None,
            idx_txn_hash_2_block: None,
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
        self.idx_txn_hash.is_some()
    }

    /// First transaction id covered, when the index is attached.
    pub fn base_txn_id(&self) -> Option<u64> {
        self.idx_txn_hash.as_ref().map(|idx| idx.base_data_id())
    }

    pub fn reopen_segment(&mut self) -> Result<(), SnapshotError> {
        self.snapshot.reopen_segment()
    }

    /// Attaches both indices. Either one being stale detaches the pair:
    /// they are rebuilt together, so a fresh one next to a stale one is
    /// itself suspect.
    pub fn reopen_index(&mut self) -> Result<(), SnapshotError> {
        self.close_index();

        let hash_index_path = self
            .snapshot
            .path()
            .index_file_for_type(SnapshotType::Transactions);
        self.idx_txn_hash = self.snapshot.open_index_if_fresh(&hash_index_path)?;
        if self.idx_txn_hash.is_none() {
            return Ok(());
        }

        let block_index_path = self
            .snapshot
            .path()
            .index_file_for_type(SnapshotType::Transactions2Block);
        if block_index_path.exists() {
            self.idx_txn_hash_2_block = self.snapshot.open_index_if_fresh(&block_index_path)?;
            if self.idx_txn_hash_2_block.is_none() {
                self.close_index();
            }
        }
        Ok(())
    }

    pub fn close_index(&mut self) {
        self.idx_txn_hash = None;
        self.idx_txn_hash_2_block = None;
    }

    pub fn close(&mut self) {
        self.close_index();
        self.snapshot.close_segment();
    }

    /// Decodes the single transaction at `offset`; `None` when there is no
    /// valid record there. The sender slot is always populated.
    pub fn next_txn(&self, offset: u64) -> Result<Option<Transaction>, SnapshotError> {
        let Some(item) = self.snapshot.next_item(offset) else {
            return Ok(None);
        };
        self.decode_txn(&item)
    }

    /// Looks a transaction up by hash, confirming the decoded record's hash
    /// against the queried one: the index maps non-members to arbitrary
    /// ordinals.
    pub fn txn_by_hash(&self, txn_hash: &B256) -> Result<Option<Transaction>, SnapshotError> {
        let Some(index) = &self.idx_txn_hash else {
            return Ok(None);
        };

        let position = index.lookup(txn_hash.as_slice());
        let Some(offset) = index.ordinal_lookup(position) else {
            return Ok(None);
        };
        let Some(txn) = self.next_txn(offset)? else {
            return Ok(None);
        };
        if txn.hash() != *txn_hash {
            return Ok(None);
        }
        Ok(Some(txn))
    }

    /// Looks a transaction up by id through the ordinal table.
    pub fn txn_by_id(&self, txn_id: u64) -> Result<Option<Transaction>, SnapshotError> {
        let Some(index) = &self.idx_txn_hash else {
            return Ok(None);
        };

        let Some(position) = txn_id.checked_sub(index.base_data_id()) else {
            return Ok(None);
        };
        let Some(offset) = index.ordinal_lookup(position) else {
            return Ok(None);
        };
        self.next_txn(offset)
    }

    /// Block containing the transaction with the given hash, answered from
    /// the auxiliary index after confirming membership through the primary
    /// one.
    pub fn block_num_by_txn_hash(
        &self,
        txn_hash: &B256,
    ) -> Result<Option<BlockNum>, SnapshotError> {
        let Some(block_index) = &self.idx_txn_hash_2_block else {
            return Ok(None);
        };
        if self.txn_by_hash(txn_hash)?.is_none() {
            return Ok(None);
        }
        Ok(Some(block_index.lookup(txn_hash.as_slice())))
    }

    /// Decodes `count` transactions starting at id `base_txn_id`,
    /// optionally populating senders from the word's sender slot.
    pub fn txn_range(
        &self,
        base_txn_id: u64,
        count: u64,
        read_senders: bool,
    ) -> Result<Vec<Transaction>, SnapshotError> {
        let mut transactions = Vec::with_capacity(count as usize);
        let mut failure = None;

        self.for_each_txn(base_txn_id, count, |i, senders_data, tx_rlp| {
            let mut view = tx_rlp;
            match TxEnvelope::decode_2718(&mut view) {
                Ok(envelope) => {
                    let from = read_senders.then(|| Address::from_slice(senders_data));
                    transactions.push(Transaction { envelope, from });
                    true
                }
                Err(err) => {
                    failure = Some(self.snapshot.corrupt(format!(
                        "cannot decode txn envelope {i} of range at {base_txn_id}: {err}"
                    )));
                    false
                }
            }
        })?;

        match failure {
            Some(err) => Err(err),
            None => Ok(transactions),
        }
    }

    /// Raw payloads of `count` transactions starting at id `base_txn_id`,
    /// with envelope type prefixes skipped.
    pub fn txn_rlp_range(&self, base_txn_id: u64, count: u64) -> Result<Vec<Vec<u8>>, SnapshotError> {
        let mut payloads = Vec::with_capacity(count as usize);
        let mut failure = None;

        self.for_each_txn(base_txn_id, count, |i, _senders_data, tx_rlp| {
            match payload_offset(tx_rlp) {
                Ok(offset) => {
                    payloads.push(tx_rlp[offset..].to_vec());
                    true
                }
                Err(reason) => {
                    failure = Some(self.snapshot.corrupt(format!(
                        "cannot decode txn envelope {i} of range at {base_txn_id}: {reason}"
                    )));
                    false
                }
            }
        })?;

        match failure {
            Some(err) => Err(err),
            None => Ok(payloads),
        }
    }

    /// Walks `count` raw transaction words starting at id `base_txn_id`,
    /// handing the walker byte views of the sender slot and the envelope.
    ///
    /// The views borrow the current word only; the scan follows next-word
    /// offsets, so it costs one index lookup regardless of `count`. A
    /// missing record is a hard error: the index promised it exists.
    pub fn for_each_txn<F>(
        &self,
        base_txn_id: u64,
        count: u64,
        mut walker: F,
    ) -> Result<(), SnapshotError>
    where
        F: FnMut(u64, &[u8], &[u8]) -> bool,
    {
        let Some(index) = &self.idx_txn_hash else {
            return Ok(());
        };
        if count == 0 {
            return Ok(());
        }

        let Some(first_position) = base_txn_id.checked_sub(index.base_data_id()) else {
            return Err(self.snapshot.corrupt(format!(
                "wrong index base data id {} for base txn id {base_txn_id}",
                index.base_data_id()
            )));
        };
        let mut offset = index.ordinal_lookup(first_position).ok_or_else(|| {
            self.snapshot
                .corrupt(format!("no record for txn id {base_txn_id}"))
        })?;

        for i in 0..count {
            let item = self
                .snapshot
                .next_item(offset)
                .ok_or_else(|| self.snapshot.corrupt(format!("record not found at offset={offset}")))?;

            let buffer = &item.value;
            if buffer.len() < TXN_RLP_DATA_OFFSET {
                return Err(self
                    .snapshot
                    .corrupt(format!("too short record: {}", buffer.len())));
            }

            let senders_data = &buffer[1..TXN_RLP_DATA_OFFSET];
            let tx_rlp = &buffer[TXN_RLP_DATA_OFFSET..];
            if !walker(i, senders_data, tx_rlp) {
                return Ok(());
            }
            offset = item.offset;
        }
        Ok(())
    }

    /// `Ok(None)` when the envelope does not decode.
    fn decode_txn(&self, item: &WordItem) -> Result<Option<Transaction>, SnapshotError> {
        let buffer = &item.value;
        if buffer.len() < TXN_RLP_DATA_OFFSET {
            return Err(self
                .snapshot
                .corrupt(format!("too short record: {}", buffer.len())));
        }

        let sender = Address::from_slice(&buffer[1..TXN_RLP_DATA_OFFSET]);
        let mut tx_rlp = &buffer[TXN_RLP_DATA_OFFSET..];
        match TxEnvelope::decode_2718(&mut tx_rlp) {
            Ok(envelope) => Ok(Some(Transaction {
                envelope,
                from: Some(sender),
            })),
            Err(err) => {
                trace!(offset = item.offset, error = %err, "txn decode failed");
                Ok(None)
            }
        }
    }
}

/// Offset of the RLP payload within a transaction envelope: zero for legacy
/// transactions, past the type prefix for typed ones. Derived from the
/// envelope and payload lengths rather than assumed, so a malformed
/// envelope is caught here.
fn payload_offset(tx_rlp: &[u8]) -> Result<usize, String> {
    let first = *tx_rlp.first().ok_or_else(|| "empty envelope".to_string())?;
    // A leading list marker is a legacy transaction.
    if first >= 0xc0 {
        return Ok(0);
    }
    if first > 0x7f {
        return Err(format!("invalid envelope marker {first:#04x}"));
    }

    let mut payload = &tx_rlp[1..];
    let header = alloy_rlp::Header::decode(&mut payload).map_err(|err| err.to_string())?;
    if !header.list {
        return Err("typed envelope payload is not a list".to_string());
    }
    let header_len = tx_rlp.len() - 1 - payload.len();
    let payload_len = header_len + header.payload_length;
    if payload_len > tx_rlp.len() {
        return Err("payload length overruns envelope".to_string());
    }
    Ok(tx_rlp.len() - payload_len)
}
