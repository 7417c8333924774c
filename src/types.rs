//! Domain record types stored in snapshots.

use alloy_consensus::TxEnvelope;
use alloy_primitives::{Address, B256};
use alloy_rlp::{RlpDecodable, RlpEncodable};

pub use alloy_consensus::Header;

pub type BlockNum = u64;

/// Block body as stored in body segments: the id range of its transactions
/// plus the ommer headers. The transactions themselves live in the
/// transaction segments.
#[derive(Debug, Clone, PartialEq, Eq, Default, RlpEncodable, RlpDecodable)]
pub struct BlockBodyForStorage {
    /// Id of the block's first transaction.
    pub base_txn_id: u64,
    /// Number of transactions in the block.
    pub txn_count: u64,
    pub ommers: Vec<Header>,
}

/// A transaction decoded from a transaction segment word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub envelope: TxEnvelope,
    /// Sender read from the word's 20-byte sender slot, when requested.
    pub from: Option<Address>,
}

impl Transaction {
    /// Transaction hash, keccak of the EIP-2718 encoding.
    pub fn hash(&self) -> B256 {
        *self.envelope.tx_hash()
    }
}
