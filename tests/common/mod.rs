//! Fixture packer shared by the integration tests.
//!
//! Committed binary fixtures would not be reproducible, so the tests build
//! their own segment and index files on the crate's wire-format
//! primitives. The segment writer emits pattern-free words with a
//! canonical-Huffman position dictionary; the index builder runs the full
//! recursive splitting construction over the crate's Golomb-Rice and
//! Elias-Fano encoders.

#![allow(dead_code)]

use std::path::Path;

use alloy_consensus::{SignableTransaction, TxEip1559, TxEnvelope, TxLegacy};
use alloy_eips::eip2718::Encodable2718;
use alloy_primitives::{Address, Bytes, Signature, TxKind, U256};
use byteorder::{BigEndian, LittleEndian, WriteBytesExt};
use coldstore::{
    elias_fano::{DoubleEliasFano, EliasFano},
    golomb_rice::{split_params, GolombRiceBuilder, GolombRiceMemo},
    index::{hash_key_with_salt, remap, remap16, remix},
    types::{BlockBodyForStorage, Header},
};

/// Start seeds of the splitting tree levels, shared with every producer of
/// these files.
pub const START_SEED: [u64; 20] = [
    0x106393c187cae21a,
    0x6453cec3f7376937,
    0x643e521ddbd2be98,
    0x3740c6412f6572cb,
    0x717d47562f1ce470,
    0x4cd6eb4c63befb7c,
    0x9bfd8c5e18c8da73,
    0x082f20e10092a9a3,
    0x2ada2ce68d21defc,
    0xe33cb4f3e7c6466b,
    0x3980be458c509c59,
    0xc466fd9584828e8c,
    0x45f0aabe1a61ede6,
    0xf6e7b8b33ad9b98d,
    0x4ef95e25f4b4983d,
    0x81175195173b92d3,
    0x4e50927d8dd15978,
    0x1ea2099d1fafae7f,
    0x425c8a06fbaaa815,
    0xcd4216006c74052a,
];

// ---------------------------------------------------------------------------
// Segment writer
// ---------------------------------------------------------------------------

/// Builds a segment file out of raw words. No patterns are mined; every
/// word is stored as its length code, a terminator and the raw bytes.
#[derive(Default)]
pub struct SegmentBuilder {
    words: Vec<Vec<u8>>,
}

impl SegmentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_word(&mut self, word: &[u8]) {
        self.words.push(word.to_vec());
    }

    /// Writes the segment and returns the absolute byte offset of every
    /// word, the same values an index would record.
    pub fn write_to(&self, path: &Path) -> Vec<u64> {
        // Position alphabet: terminator plus every word length + 1.
        let mut symbols: Vec<u64> = self.words.iter().map(|w| w.len() as u64 + 1).collect();
        symbols.push(0);
        symbols.sort_unstable();
        symbols.dedup();

        let depth = {
            let mut d = 1u64;
            while (1u64 << d) < symbols.len() as u64 {
                d += 1;
            }
            d
        };
        assert!(depth <= 9, "too many distinct word lengths for the fixture writer");

        let entries: Vec<(u64, u64)> = symbols.iter().map(|s| (depth, *s)).collect();
        let codes = assign_codes(&entries);
        let code_of = |symbol: u64| -> (u16, u8) {
            let idx = symbols.binary_search(&symbol).expect("symbol in alphabet");
            codes[idx]
        };

        let mut header = Vec::new();
        header
            .write_u64::<BigEndian>(self.words.len() as u64)
            .unwrap();
        let empty_words = self.words.iter().filter(|w| w.is_empty()).count() as u64;
        header.write_u64::<BigEndian>(empty_words).unwrap();
        // No pattern dictionary.
        header.write_u64::<BigEndian>(0).unwrap();

        let mut dict = Vec::new();
        for (entry_depth, symbol) in &entries {
            let mut buf = unsigned_varint::encode::u64_buffer();
            dict.extend_from_slice(unsigned_varint::encode::u64(*entry_depth, &mut buf));
            let mut buf = unsigned_varint::encode::u64_buffer();
            dict.extend_from_slice(unsigned_varint::encode::u64(*symbol, &mut buf));
        }
        header.write_u64::<BigEndian>(dict.len() as u64).unwrap();
        header.extend_from_slice(&dict);

        let mut writer = BitWriter::default();
        let mut offsets = Vec::with_capacity(self.words.len());
        for word in &self.words {
            offsets.push((header.len() + writer.bytes.len()) as u64);
            let (code, bits) = code_of(word.len() as u64 + 1);
            writer.write_code(code, bits);
            if !word.is_empty() {
                let (code, bits) = code_of(0);
                writer.write_code(code, bits);
            }
            writer.align();
            writer.bytes.extend_from_slice(word);
        }

        let mut out = header;
        out.extend_from_slice(&writer.bytes);
        std::fs::write(path, out).expect("write segment fixture");
        offsets
    }
}

/// Assigns canonical codes the way the decoder does: a depth-first walk of
/// the code trie over the dictionary entries in file order.
fn assign_codes(entries: &[(u64, u64)]) -> Vec<(u16, u8)> {
    fn walk(
        entries: &[(u64, u64)],
        i: usize,
        code: u16,
        bits: u8,
        depth: u64,
        out: &mut Vec<(u16, u8)>,
    ) -> usize {
        if i >= entries.len() {
            return 0;
        }
        if depth == entries[i].0 {
            out[i] = (code, bits);
            return 1;
        }
        let b0 = walk(entries, i, code, bits + 1, depth + 1, out);
        let b1 = walk(entries, i + b0, code | (1u16 << bits), bits + 1, depth + 1, out);
        b0 + b1
    }

    let mut out = vec![(0u16, 0u8); entries.len()];
    let assigned = walk(entries, 0, 0, 0, 0, &mut out);
    assert_eq!(assigned, entries.len(), "code space exhausted");
    out
}

/// Least-significant-bit-first writer, matching the decoder's bit order.
#[derive(Default)]
struct BitWriter {
    bytes: Vec<u8>,
    bit: u8,
}

impl BitWriter {
    fn write_code(&mut self, code: u16, bits: u8) {
        for b in 0..bits {
            if self.bit == 0 {
                self.bytes.push(0);
            }
            if code & (1u16 << b) != 0 {
                *self.bytes.last_mut().unwrap() |= 1u8 << self.bit;
            }
            self.bit = (self.bit + 1) % 8;
        }
    }

    fn align(&mut self) {
        self.bit = 0;
    }
}

// ---------------------------------------------------------------------------
// Index builder
// ---------------------------------------------------------------------------

/// Builds a RecSplit index file over a key set.
///
/// With `enums` the record table stores insertion ordinals and the offsets
/// go into an Elias-Fano table, which is the layout of segment companion
/// indices; without it the record table stores the values directly, the
/// layout of the tx-to-block auxiliary index.
pub struct IndexBuilder {
    base_data_id: u64,
    bucket_size: u64,
    leaf_size: u16,
    salt: u32,
    enums: bool,
    keys: Vec<(Vec<u8>, u64)>,
}

impl IndexBuilder {
    pub fn new(base_data_id: u64, enums: bool) -> Self {
        IndexBuilder {
            base_data_id,
            bucket_size: 100,
            leaf_size: 8,
            salt: 0x5eed_f00d,
            enums,
            keys: Vec::new(),
        }
    }

    pub fn with_bucket_size(mut self, bucket_size: u64) -> Self {
        self.bucket_size = bucket_size;
        self
    }

    /// Adds a key with its value: a segment offset for enum indices (in
    /// non-decreasing insertion order), an arbitrary value otherwise.
    pub fn add_key(&mut self, key: &[u8], value: u64) {
        self.keys.push((key.to_vec(), value));
    }

    pub fn build_to(&self, path: &Path) {
        std::fs::write(path, self.build_bytes()).expect("write index fixture");
    }

    fn build_bytes(&self) -> Vec<u8> {
        let key_count = self.keys.len() as u64;
        assert!(key_count > 0, "index fixture needs at least one key");
        let bucket_count = (key_count + self.bucket_size - 1) / self.bucket_size;

        let leaf = self.leaf_size;
        let primary = leaf * u16::max(2, (0.35 * f64::from(leaf) + 0.5).ceil() as u16);
        let secondary = if leaf < 7 {
            primary * 2
        } else {
            primary * (0.21 * f64::from(leaf) + 9.0 / 10.0).ceil() as u16
        };

        // Distribute keys into buckets; record values are ordinals in enum
        // mode, raw values otherwise.
        let mut buckets: Vec<Vec<(u64, u64)>> = vec![Vec::new(); bucket_count as usize];
        for (ordinal, (key, value)) in self.keys.iter().enumerate() {
            let (bucket_hash, fingerprint) = hash_key_with_salt(key, self.salt);
            let bucket = remap(bucket_hash, bucket_count);
            let rec = if self.enums { ordinal as u64 } else { *value };
            buckets[bucket as usize].push((fingerprint, rec));
        }

        let max_bucket = buckets.iter().map(|b| b.len()).max().unwrap_or(0) as u16;
        let golomb_param_count = max_bucket + 1;
        let memo = GolombRiceMemo::new(golomb_param_count, leaf, primary, secondary);

        let mut gr = GolombRiceBuilder::new();
        let mut cum_keys = Vec::with_capacity(bucket_count as usize + 1);
        let mut bit_positions = Vec::with_capacity(bucket_count as usize + 1);
        let mut rec_values: Vec<u64> = Vec::with_capacity(key_count as usize);
        let mut total_keys = 0u64;

        for bucket in &buckets {
            cum_keys.push(total_keys);
            bit_positions.push(gr.bit_count() as u64);

            let mut slots = vec![0u64; bucket.len()];
            if bucket.len() == 1 {
                slots[0] = bucket[0].1;
            } else if bucket.len() > 1 {
                let mut unary = Vec::new();
                recsplit(
                    bucket, 0, &memo, leaf, primary, secondary, &mut gr, &mut unary, &mut slots,
                );
                gr.append_unary_all(&unary);
            }
            rec_values.extend_from_slice(&slots);
            total_keys += bucket.len() as u64;
        }
        cum_keys.push(total_keys);
        bit_positions.push(gr.bit_count() as u64);

        let bucket_ef = DoubleEliasFano::build(&cum_keys, &bit_positions);

        let max_rec = rec_values.iter().copied().max().unwrap_or(0);
        let bytes_per_rec = usize::max(1, ((64 - max_rec.leading_zeros() as usize) + 7) / 8);

        let mut out = Vec::new();
        out.write_u64::<BigEndian>(self.base_data_id).unwrap();
        out.write_u64::<BigEndian>(key_count).unwrap();
        out.push(bytes_per_rec as u8);
        for value in &rec_values {
            for shift in (0..bytes_per_rec).rev() {
                out.push((value >> (8 * shift)) as u8);
            }
        }

        out.write_u64::<BigEndian>(bucket_count).unwrap();
        out.write_u16::<BigEndian>(self.bucket_size as u16).unwrap();
        out.write_u16::<BigEndian>(leaf).unwrap();
        out.write_u32::<BigEndian>(self.salt).unwrap();
        out.push(START_SEED.len() as u8);
        for seed in START_SEED {
            out.write_u64::<BigEndian>(seed).unwrap();
        }

        out.push(u8::from(self.enums));
        if self.enums {
            let max_offset = self.keys.iter().map(|(_, v)| *v).max().unwrap_or(0);
            let mut offsets_ef = EliasFano::new(key_count, max_offset);
            for (_, offset) in &self.keys {
                offsets_ef.add(*offset);
            }
            offsets_ef.build_jumps();
            offsets_ef.write_into(&mut out).unwrap();
        }

        // The parameter count is a u16 stored over four bytes.
        out.write_u16::<BigEndian>(golomb_param_count).unwrap();
        out.extend_from_slice(&[0, 0]);

        let gr_words = gr.into_words();
        out.write_u64::<BigEndian>(gr_words.len() as u64).unwrap();
        for word in &gr_words {
            out.write_u64::<LittleEndian>(*word).unwrap();
        }

        bucket_ef.write_into(&mut out).unwrap();
        out
    }
}

/// Recursive splitting: leaves get a bijection seed, larger nodes a
/// partition seed, each stored as one Golomb-Rice code in pre-order.
#[allow(clippy::too_many_arguments)]
fn recsplit(
    keys: &[(u64, u64)],
    level: usize,
    memo: &GolombRiceMemo,
    leaf_size: u16,
    primary: u16,
    secondary: u16,
    gr: &mut GolombRiceBuilder,
    unary: &mut Vec<u64>,
    slots: &mut [u64],
) {
    let m = keys.len() as u16;
    debug_assert!(m > 1);
    let seed = START_SEED[level];

    if m <= leaf_size {
        let mut d = 0u64;
        'bijection: loop {
            let mut taken = 0u32;
            for (fingerprint, _) in keys {
                let slot = remap16(remix(fingerprint.wrapping_add(seed).wrapping_add(d)), m);
                if taken & (1u32 << slot) != 0 {
                    d += 1;
                    continue 'bijection;
                }
                taken |= 1u32 << slot;
            }
            break;
        }
        for (fingerprint, value) in keys {
            let slot = remap16(remix(fingerprint.wrapping_add(seed).wrapping_add(d)), m);
            slots[slot as usize] = *value;
        }
        let param = memo.golomb_param(m);
        gr.append_fixed(d, param);
        unary.push(d >> param);
        return;
    }

    let (fanout, unit) = split_params(m, leaf_size, primary, secondary);
    let mut sizes = vec![unit; fanout as usize];
    sizes[fanout as usize - 1] = m - (fanout - 1) * unit;

    let mut d = 0u64;
    'split: loop {
        let mut counts = vec![0u16; fanout as usize];
        for (fingerprint, _) in keys {
            let h = remap16(remix(fingerprint.wrapping_add(seed).wrapping_add(d)), m);
            counts[(h / unit) as usize] += 1;
        }
        if counts == sizes {
            break 'split;
        }
        d += 1;
    }
    let param = memo.golomb_param(m);
    gr.append_fixed(d, param);
    unary.push(d >> param);

    let mut parts: Vec<Vec<(u64, u64)>> = vec![Vec::new(); fanout as usize];
    for (fingerprint, value) in keys {
        let h = remap16(remix(fingerprint.wrapping_add(seed).wrapping_add(d)), m);
        parts[(h / unit) as usize].push((*fingerprint, *value));
    }
    let mut base = 0usize;
    for part in &parts {
        match part.len() {
            0 => {}
            1 => slots[base] = part[0].1,
            _ => recsplit(
                part,
                level + 1,
                memo,
                leaf_size,
                primary,
                secondary,
                gr,
                unary,
                &mut slots[base..base + part.len()],
            ),
        }
        base += part.len();
    }
}

// ---------------------------------------------------------------------------
// Domain fixtures
// ---------------------------------------------------------------------------

pub fn make_header(number: u64) -> Header {
    Header {
        number,
        timestamp: 1_600_000_000 + number * 12,
        gas_limit: 30_000_000,
        gas_used: number % 15_000_000,
        ..Default::default()
    }
}

pub fn header_word(header: &Header) -> Vec<u8> {
    let mut word = vec![header.hash_slow()[0]];
    word.extend_from_slice(&alloy_rlp::encode(header));
    word
}

pub fn make_body(base_txn_id: u64, txn_count: u64) -> BlockBodyForStorage {
    BlockBodyForStorage {
        base_txn_id,
        txn_count,
        ommers: Vec::new(),
    }
}

pub fn body_word(body: &BlockBodyForStorage) -> Vec<u8> {
    alloy_rlp::encode(body)
}

pub fn make_legacy_txn(nonce: u64) -> TxEnvelope {
    let tx = TxLegacy {
        chain_id: Some(1),
        nonce,
        gas_price: 20_000_000_000,
        gas_limit: 21_000,
        to: TxKind::Call(Address::with_last_byte((nonce % 251) as u8)),
        value: U256::from(nonce),
        input: Bytes::new(),
    };
    TxEnvelope::Legacy(tx.into_signed(test_signature(nonce)))
}

pub fn make_eip1559_txn(nonce: u64) -> TxEnvelope {
    let tx = TxEip1559 {
        chain_id: 1,
        nonce,
        gas_limit: 100_000,
        max_fee_per_gas: 30_000_000_000,
        max_priority_fee_per_gas: 1_000_000_000,
        to: TxKind::Call(Address::with_last_byte((nonce % 251) as u8)),
        value: U256::from(nonce),
        access_list: Default::default(),
        input: Bytes::new(),
    };
    TxEnvelope::Eip1559(tx.into_signed(test_signature(nonce)))
}

fn test_signature(nonce: u64) -> Signature {
    Signature::new(
        U256::from(nonce + 1),
        U256::from(nonce + 7),
        nonce % 2 == 0,
    )
}

pub fn txn_sender(id: u64) -> Address {
    let mut bytes = [0u8; 20];
    bytes[..8].copy_from_slice(&id.to_be_bytes());
    bytes[19] = 0xaa;
    Address::from(bytes)
}

pub fn txn_word(envelope: &TxEnvelope, sender: Address) -> Vec<u8> {
    let mut word = vec![envelope.tx_hash()[0]];
    word.extend_from_slice(sender.as_slice());
    word.extend_from_slice(&envelope.encoded_2718());
    word
}
