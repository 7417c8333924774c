mod common;

use std::{path::Path, time::Duration};

use alloy_consensus::TxEnvelope;
use alloy_eips::eip2718::{Decodable2718, Encodable2718};
use alloy_primitives::{keccak256, Address};
use coldstore::{
    BodySnapshot, Header, HeaderSnapshot, Snapshot, SnapshotError, SnapshotPath,
    SnapshotRepository, SnapshotType, TransactionSnapshot,
};
use common::{
    body_word, header_word, make_body, make_eip1559_txn, make_header, make_legacy_txn,
    txn_sender, txn_word, IndexBuilder, SegmentBuilder,
};
use tempfile::tempdir;
use tracing_test::traced_test;

const BLOCK_FROM: u64 = 1_000;
const BLOCK_TO: u64 = 2_000;
const FIRST_TXN_ID: u64 = 1_000_000;
const TXNS_PER_BLOCK: u64 = 2;

fn header_fixture(dir: &Path, with_index: bool) -> (SnapshotPath, Vec<Header>, Vec<u64>) {
    let path = SnapshotPath::from(dir, 1, BLOCK_FROM, BLOCK_TO, SnapshotType::Headers);
    let headers: Vec<Header> = (BLOCK_FROM..BLOCK_TO).map(make_header).collect();

    let mut builder = SegmentBuilder::new();
    for header in &headers {
        builder.add_word(&header_word(header));
    }
    let offsets = builder.write_to(path.path());

    if with_index {
        let mut index = IndexBuilder::new(BLOCK_FROM, true);
        for (header, offset) in headers.iter().zip(&offsets) {
            index.add_key(header.hash_slow().as_slice(), *offset);
        }
        index.build_to(path.index_file().path());
    }
    (path, headers, offsets)
}

fn body_fixture(dir: &Path, with_index: bool) -> (SnapshotPath, Vec<u64>) {
    let path = SnapshotPath::from(dir, 1, BLOCK_FROM, BLOCK_TO, SnapshotType::Bodies);

    let mut txn_counts = Vec::new();
    let mut builder = SegmentBuilder::new();
    let mut next_txn_id = FIRST_TXN_ID;
    let mut number_keys = Vec::new();
    for number in BLOCK_FROM..BLOCK_TO {
        let count = (number % 5) + 1;
        builder.add_word(&body_word(&make_body(next_txn_id, count)));
        txn_counts.push(count);
        next_txn_id += count;
        number_keys.push(number.to_be_bytes());
    }
    let offsets = builder.write_to(path.path());

    if with_index {
        let mut index = IndexBuilder::new(BLOCK_FROM, true);
        for (key, offset) in number_keys.iter().zip(&offsets) {
            index.add_key(key, *offset);
        }
        index.build_to(path.index_file().path());
    }
    (path, txn_counts)
}

fn txn_fixture(dir: &Path) -> (SnapshotPath, Vec<TxEnvelope>, Vec<Address>) {
    let path = SnapshotPath::from(dir, 1, BLOCK_FROM, BLOCK_TO, SnapshotType::Transactions);

    let txn_count = (BLOCK_TO - BLOCK_FROM) * TXNS_PER_BLOCK;
    let mut envelopes = Vec::new();
    let mut senders = Vec::new();
    let mut builder = SegmentBuilder::new();
    for i in 0..txn_count {
        let envelope = if i % 3 == 0 {
            make_eip1559_txn(i)
        } else {
            make_legacy_txn(i)
        };
        let sender = txn_sender(i);
        builder.add_word(&txn_word(&envelope, sender));
        envelopes.push(envelope);
        senders.push(sender);
    }
    let offsets = builder.write_to(path.path());

    let mut hash_index = IndexBuilder::new(FIRST_TXN_ID, true);
    let mut block_index = IndexBuilder::new(FIRST_TXN_ID, false);
    for (i, (envelope, offset)) in envelopes.iter().zip(&offsets).enumerate() {
        hash_index.add_key(envelope.tx_hash().as_slice(), *offset);
        block_index.add_key(
            envelope.tx_hash().as_slice(),
            BLOCK_FROM + i as u64 / TXNS_PER_BLOCK,
        );
    }
    hash_index.build_to(path.index_file().path());
    block_index.build_to(
        path.index_file_for_type(SnapshotType::Transactions2Block)
            .path(),
    );

    (path, envelopes, senders)
}

#[test]
#[should_panic(expected = "invalid block range")]
fn inverted_range_is_rejected_at_construction() {
    let dir = tempdir().unwrap();
    let path = SnapshotPath::from(dir.path(), 1, 2_000_000, 1_000_000, SnapshotType::Headers);
    let _ = Snapshot::new(path);
}

#[test]
#[traced_test]
fn header_lookups_by_number_and_hash() {
    let dir = tempdir().unwrap();
    let (path, headers, _) = header_fixture(dir.path(), true);

    let mut snapshot = HeaderSnapshot::new(path);
    snapshot.reopen_segment().unwrap();
    snapshot.reopen_index().unwrap();
    assert!(snapshot.has_index());

    // Mid-range, first and last block of the range.
    for number in [1_500u64, BLOCK_FROM, BLOCK_TO - 1] {
        let header = snapshot.header_by_number(number).unwrap().unwrap();
        assert_eq!(header.number, number);
        assert_eq!(header, headers[(number - BLOCK_FROM) as usize]);
    }
    // One step outside on both ends.
    assert!(snapshot.header_by_number(BLOCK_FROM - 1).unwrap().is_none());
    assert!(snapshot.header_by_number(BLOCK_TO).unwrap().is_none());

    let wanted = &headers[500];
    let found = snapshot
        .header_by_hash(&wanted.hash_slow())
        .unwrap()
        .expect("known hash");
    assert_eq!(&found, wanted);

    // The index maps any hash somewhere; the confirmation must reject it.
    let foreign = keccak256(b"no such block");
    assert!(snapshot.header_by_hash(&foreign).unwrap().is_none());
}

#[test]
#[traced_test]
fn sequential_and_random_header_access_agree() {
    let dir = tempdir().unwrap();
    let (path, _, _) = header_fixture(dir.path(), true);

    let mut snapshot = HeaderSnapshot::new(path);
    snapshot.reopen_segment().unwrap();
    snapshot.reopen_index().unwrap();

    let mut scanned = Vec::new();
    let done = snapshot
        .for_each_header(|header| {
            scanned.push(header.clone());
            true
        })
        .unwrap();
    assert!(done);
    assert_eq!(scanned.len(), (BLOCK_TO - BLOCK_FROM) as usize);

    for header in scanned.iter().step_by(97) {
        let by_number = snapshot.header_by_number(header.number).unwrap().unwrap();
        assert_eq!(&by_number, header);
        let by_hash = snapshot.header_by_hash(&header.hash_slow()).unwrap().unwrap();
        assert_eq!(&by_hash, header);
    }
}

#[test]
#[traced_test]
fn walker_cancellation_stops_the_scan() {
    let dir = tempdir().unwrap();
    let (path, _, _) = header_fixture(dir.path(), false);

    let mut snapshot = HeaderSnapshot::new(path);
    snapshot.reopen_segment().unwrap();

    let mut seen = 0;
    let done = snapshot
        .for_each_header(|_| {
            seen += 1;
            seen < 10
        })
        .unwrap();
    assert!(!done);
    assert_eq!(seen, 10);
}

#[test]
#[traced_test]
fn next_item_chain_matches_sequential_scan() {
    let dir = tempdir().unwrap();
    let (path, _, offsets) = header_fixture(dir.path(), false);

    let mut snapshot = Snapshot::new(path);
    snapshot.reopen_segment().unwrap();

    let mut scanned = Vec::new();
    snapshot
        .for_each_item(|item| {
            scanned.push(item.value.clone());
            true
        })
        .unwrap();

    let mut chained = Vec::new();
    let mut offset = offsets[0];
    while let Some(item) = snapshot.next_item(offset) {
        chained.push(item.value);
        offset = item.offset;
    }
    assert_eq!(chained, scanned);
}

#[test]
#[traced_test]
fn stale_index_is_ignored_until_rebuilt() {
    let dir = tempdir().unwrap();
    let (path, headers, _) = header_fixture(dir.path(), true);

    // Rewrite the segment so it postdates its index.
    std::thread::sleep(Duration::from_millis(20));
    let bytes = std::fs::read(path.path()).unwrap();
    std::fs::write(path.path(), bytes).unwrap();

    let mut snapshot = HeaderSnapshot::new(path);
    snapshot.reopen_segment().unwrap();
    snapshot.reopen_index().unwrap();
    assert!(!snapshot.has_index());

    // Keyed lookups degrade to absent, sequential scans still work.
    assert!(snapshot
        .header_by_hash(&headers[500].hash_slow())
        .unwrap()
        .is_none());
    assert!(snapshot.header_by_number(1_500).unwrap().is_none());

    let mut count = 0;
    snapshot.for_each_header(|_| {
        count += 1;
        true
    })
    .unwrap();
    assert_eq!(count, headers.len());
}

#[test]
#[traced_test]
fn bodies_without_index_only_scan(){
    let dir = tempdir().unwrap();
    let (path, txn_counts) = body_fixture(dir.path(), false);

    let mut snapshot = BodySnapshot::new(path);
    snapshot.reopen_segment().unwrap();
    snapshot.reopen_index().unwrap();
    assert!(!snapshot.has_index());

    assert!(snapshot.body_by_number(1_500).unwrap().is_none());

    let mut expected_number = BLOCK_FROM;
    let done = snapshot
        .for_each_body(|number, body| {
            assert_eq!(number, expected_number);
            assert_eq!(body.txn_count, txn_counts[(number - BLOCK_FROM) as usize]);
            expected_number += 1;
            true
        })
        .unwrap();
    assert!(done);
    assert_eq!(expected_number, BLOCK_TO);
}

#[test]
#[traced_test]
fn body_lookup_by_number() {
    let dir = tempdir().unwrap();
    let (path, txn_counts) = body_fixture(dir.path(), true);

    let mut snapshot = BodySnapshot::new(path);
    snapshot.reopen_segment().unwrap();
    snapshot.reopen_index().unwrap();
    assert!(snapshot.has_index());

    let body = snapshot.body_by_number(1_500).unwrap().unwrap();
    assert_eq!(body.txn_count, txn_counts[500]);
    assert!(snapshot.body_by_number(BLOCK_TO).unwrap().is_none());
    assert!(snapshot.body_by_number(BLOCK_FROM - 1).unwrap().is_none());
}

#[test]
#[traced_test]
fn txs_amount_sums_every_body() {
    let dir = tempdir().unwrap();
    let (path, txn_counts) = body_fixture(dir.path(), true);

    let mut snapshot = BodySnapshot::new(path);
    snapshot.reopen_segment().unwrap();
    snapshot.reopen_index().unwrap();

    let (first_txn_id, total) = snapshot.compute_txs_amount().unwrap();
    assert_eq!(first_txn_id, FIRST_TXN_ID);
    assert_eq!(total, txn_counts.iter().sum::<u64>());
}

#[test]
#[traced_test]
fn txn_lookups_by_id_and_hash() {
    let dir = tempdir().unwrap();
    let (path, envelopes, senders) = txn_fixture(dir.path());

    let mut snapshot = TransactionSnapshot::new(path);
    snapshot.reopen_segment().unwrap();
    snapshot.reopen_index().unwrap();
    assert!(snapshot.has_index());
    assert_eq!(snapshot.base_txn_id(), Some(FIRST_TXN_ID));

    let mid = 1_050u64;
    let txn = snapshot.txn_by_id(FIRST_TXN_ID + mid).unwrap().unwrap();
    assert_eq!(txn.hash(), *envelopes[mid as usize].tx_hash());
    assert_eq!(txn.from, Some(senders[mid as usize]));

    let by_hash = snapshot
        .txn_by_hash(envelopes[mid as usize].tx_hash())
        .unwrap()
        .unwrap();
    assert_eq!(by_hash.hash(), txn.hash());

    let foreign = keccak256(b"no such transaction");
    assert!(snapshot.txn_by_hash(&foreign).unwrap().is_none());

    // Ids outside the covered range are absent, not an error.
    let past_end = FIRST_TXN_ID + envelopes.len() as u64;
    assert!(snapshot.txn_by_id(past_end).unwrap().is_none());
}

#[test]
#[traced_test]
fn txn_range_decodes_senders_and_payloads() {
    let dir = tempdir().unwrap();
    let (path, envelopes, senders) = txn_fixture(dir.path());

    let mut snapshot = TransactionSnapshot::new(path);
    snapshot.reopen_segment().unwrap();
    snapshot.reopen_index().unwrap();

    let base = FIRST_TXN_ID + 10;
    let txns = snapshot.txn_range(base, 5, true).unwrap();
    assert_eq!(txns.len(), 5);
    for (i, txn) in txns.iter().enumerate() {
        assert_eq!(txn.envelope, envelopes[10 + i]);
        assert_eq!(txn.from, Some(senders[10 + i]));
    }

    let without_senders = snapshot.txn_range(base, 5, false).unwrap();
    assert!(without_senders.iter().all(|t| t.from.is_none()));

    let payloads = snapshot.txn_rlp_range(base, 5).unwrap();
    assert_eq!(payloads.len(), 5);
    for (i, payload) in payloads.iter().enumerate() {
        let envelope = &envelopes[10 + i];
        let encoded = envelope.encoded_2718();
        if envelope.is_legacy() {
            // Legacy payloads are the whole envelope and decode back to an
            // identical transaction.
            assert_eq!(payload.as_slice(), encoded.as_slice());
            let reparsed = TxEnvelope::decode_2718(&mut payload.as_slice()).unwrap();
            assert_eq!(&reparsed, envelope);
        } else {
            // Typed payloads drop exactly the type prefix.
            assert_eq!(payload.as_slice(), &encoded[1..]);
        }
    }

    assert!(snapshot.txn_range(base, 0, true).unwrap().is_empty());
}

#[test]
#[traced_test]
fn txn_walker_sees_raw_sender_slots() {
    let dir = tempdir().unwrap();
    let (path, _, senders) = txn_fixture(dir.path());

    let mut snapshot = TransactionSnapshot::new(path);
    snapshot.reopen_segment().unwrap();
    snapshot.reopen_index().unwrap();

    let mut i = 0usize;
    snapshot
        .for_each_txn(FIRST_TXN_ID, 40, |_, senders_data, tx_rlp| {
            assert_eq!(senders_data.len(), 20);
            assert_eq!(senders_data, senders[i].as_slice());
            assert!(!tx_rlp.is_empty());
            i += 1;
            true
        })
        .unwrap();
    assert_eq!(i, 40);
}

#[test]
#[traced_test]
fn txn_range_below_base_is_corrupt() {
    let dir = tempdir().unwrap();
    let (path, _, _) = txn_fixture(dir.path());

    let mut snapshot = TransactionSnapshot::new(path);
    snapshot.reopen_segment().unwrap();
    snapshot.reopen_index().unwrap();

    match snapshot.txn_range(FIRST_TXN_ID - 1, 5, false) {
        Err(SnapshotError::Corrupt { .. }) => {}
        other => panic!("expected a corrupt error, got {other:?}"),
    }
}

#[test]
#[traced_test]
fn block_number_through_the_auxiliary_index() {
    let dir = tempdir().unwrap();
    let (path, envelopes, _) = txn_fixture(dir.path());

    let mut snapshot = TransactionSnapshot::new(path);
    snapshot.reopen_segment().unwrap();
    snapshot.reopen_index().unwrap();

    for i in [0u64, 999, 1_501] {
        let block = snapshot
            .block_num_by_txn_hash(envelopes[i as usize].tx_hash())
            .unwrap()
            .expect("known transaction");
        assert_eq!(block, BLOCK_FROM + i / TXNS_PER_BLOCK);
    }

    let foreign = keccak256(b"not in any block");
    assert!(snapshot.block_num_by_txn_hash(&foreign).unwrap().is_none());
}

#[test]
#[traced_test]
fn repository_scans_a_mixed_folder() {
    let dir = tempdir().unwrap();
    header_fixture(dir.path(), true);
    body_fixture(dir.path(), true);
    txn_fixture(dir.path());
    // Files the scanner must skip.
    std::fs::write(dir.path().join("notes.txt"), b"not a snapshot").unwrap();
    std::fs::write(dir.path().join("junk.seg"), b"not parseable").unwrap();

    let mut repository = SnapshotRepository::new(dir.path());
    repository.reopen_folder().unwrap();

    assert_eq!(repository.header_segments().len(), 1);
    assert_eq!(repository.body_segments().len(), 1);
    assert_eq!(repository.txn_segments().len(), 1);

    let headers = repository.view_header_segment(1_500).expect("covered block");
    assert_eq!(headers.block_from(), BLOCK_FROM);
    let header = headers.header_by_number(1_500).unwrap().unwrap();
    assert_eq!(header.number, 1_500);

    assert!(repository.view_header_segment(2_500).is_none());
    assert!(repository.view_body_segment(1_999).is_some());
    assert!(repository.view_txn_segment(999).is_none());

    // Coverage does not start at block zero here.
    assert_eq!(repository.max_block_available(), None);

    repository.close();
    assert!(repository.header_segments().is_empty());
}

#[test]
#[traced_test]
fn repository_reports_contiguous_coverage() {
    let dir = tempdir().unwrap();

    // One 1000-block range of all three kinds starting at block zero.
    for kind in [SnapshotType::Headers, SnapshotType::Bodies, SnapshotType::Transactions] {
        let path = SnapshotPath::from(dir.path(), 1, 0, 1_000, kind);
        let mut builder = SegmentBuilder::new();
        match kind {
            SnapshotType::Headers => {
                for number in 0..1_000 {
                    builder.add_word(&header_word(&make_header(number)));
                }
            }
            SnapshotType::Bodies => {
                for number in 0..1_000 {
                    builder.add_word(&body_word(&make_body(number * 2, 2)));
                }
            }
            _ => {
                for i in 0..100 {
                    builder.add_word(&txn_word(&make_legacy_txn(i), txn_sender(i)));
                }
            }
        }
        builder.write_to(path.path());
    }

    let mut repository = SnapshotRepository::new(dir.path());
    repository.reopen_folder().unwrap();
    assert_eq!(repository.max_block_available(), Some(999));
}
