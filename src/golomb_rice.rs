//! Golomb-Rice coded split trees.
//!
//! The minimal-perfect-hash descriptor stores, per bucket, the seeds of a
//! recursive splitting tree as Golomb-Rice codes. The encoding keeps the
//! fixed-width halves and the unary halves of a bucket's codes in two
//! separate regions of the shared word array: a reader is positioned with
//! the bucket's bit position and the total fixed-width length of the
//! bucket's tree, then consumes one code per visited node and can skip
//! whole subtrees using the memoized per-size node and bit counts.

/// Golomb parameters of leaf bijections, indexed by leaf size.
const BIJ_MEMO: [u32; 25] = [
    0, 0, 0, 1, 3, 4, 5, 7, 8, 10, 11, 12, 14, 15, 16, 18, 19, 21, 22, 23, 25, 26, 28, 29, 30,
];

/// Largest leaf size the bijection cost table covers.
pub const MAX_LEAF_SIZE: u16 = 24;

/// Splitting strategy for a node of `m` keys: returns `(fanout, unit)`.
/// Nodes above the secondary bound split in two, nodes above the primary
/// bound split into primary-bound units, the rest into leaf-size units.
pub fn split_params(
    m: u16,
    leaf_size: u16,
    primary_aggr_bound: u16,
    secondary_aggr_bound: u16,
) -> (u16, u16) {
    if m > secondary_aggr_bound {
        let unit = secondary_aggr_bound
            * ((((m as u32 + 1) / 2 + secondary_aggr_bound as u32 - 1)
                / secondary_aggr_bound as u32) as u16);
        (2, unit)
    } else if m > primary_aggr_bound {
        let fanout = (m + primary_aggr_bound - 1) / primary_aggr_bound;
        (fanout, primary_aggr_bound)
    } else {
        let fanout = (m + leaf_size - 1) / leaf_size;
        (fanout, leaf_size)
    }
}

/// Memoized per-node-size code parameters: bits 27..32 hold the Golomb
/// parameter, bits 16..27 the number of coded nodes in the subtree, bits
/// 0..16 the total fixed-width bits in the subtree.
#[derive(Debug)]
pub struct GolombRiceMemo {
    table: Vec<u32>,
    leaf_size: u16,
}

impl GolombRiceMemo {
    /// Precomputes parameters for node sizes `0..size`.
    pub fn new(size: u16, leaf_size: u16, primary_aggr_bound: u16, secondary_aggr_bound: u16) -> Self {
        debug_assert!(leaf_size <= MAX_LEAF_SIZE);
        let mut table = Vec::with_capacity(size as usize);
        for s in 0..size {
            if s == 0 {
                table.push(0);
            } else if s <= leaf_size {
                let node = u32::from(s > 1) << 16;
                table.push((BIJ_MEMO[s as usize] << 27) | node | BIJ_MEMO[s as usize]);
            } else {
                let (fanout, unit) = split_params(s, leaf_size, primary_aggr_bound, secondary_aggr_bound);
                let mut k = vec![unit; fanout as usize];
                k[fanout as usize - 1] = s - (fanout - 1) * unit;

                let mut sqrt_prod = 1f64;
                for part in &k {
                    sqrt_prod *= f64::from(*part).sqrt();
                }
                let p = f64::from(s).sqrt()
                    / ((2.0 * std::f64::consts::PI).powf((f64::from(fanout) - 1.0) / 2.0) * sqrt_prod);
                let golden = (5f64.sqrt() + 1.0) / 2.0;
                let mut code_len = (-golden.ln() / (-p).ln_1p()).log2().ceil() as u32;
                debug_assert!(code_len <= 0x1f);

                let mut entry = code_len << 27;
                for part in &k {
                    code_len += table[*part as usize] & 0xffff;
                }
                debug_assert!(code_len <= 0xffff);
                entry |= code_len;

                let mut nodes = 1u32;
                for part in &k {
                    nodes += (table[*part as usize] >> 16) & 0x7ff;
                }
                entry |= nodes << 16;
                table.push(entry);
            }
        }
        GolombRiceMemo { table, leaf_size }
    }

    pub fn leaf_size(&self) -> u16 {
        self.leaf_size
    }

    /// Number of node sizes covered.
    pub fn size(&self) -> u16 {
        self.table.len() as u16
    }

    /// Golomb parameter for a node of `m` keys.
    pub fn golomb_param(&self, m: u16) -> u32 {
        self.entry(m) >> 27
    }

    /// Total fixed-width bits in a subtree of `m` keys.
    pub fn skip_bits(&self, m: u16) -> u32 {
        self.entry(m) & 0xffff
    }

    /// Number of coded nodes in a subtree of `m` keys.
    pub fn skip_nodes(&self, m: u16) -> u32 {
        (self.entry(m) >> 16) & 0x7ff
    }

    fn entry(&self, m: u16) -> u32 {
        self.table.get(m as usize).copied().unwrap_or(0)
    }
}

/// Reader over a Golomb-Rice word array. Out-of-range reads saturate
/// instead of panicking: a bucket holding a single key carries no code at
/// all, yet the lookup descent still issues one final read whose result is
/// discarded.
pub struct GolombRiceReader<'a> {
    data: &'a [u64],
    curr_fixed_offset: usize,
    curr_window_unary: u64,
    curr_ptr_unary: usize,
    valid_lower_bits_unary: u32,
}

impl<'a> GolombRiceReader<'a> {
    pub fn new(data: &'a [u64]) -> Self {
        GolombRiceReader {
            data,
            curr_fixed_offset: 0,
            curr_window_unary: 0,
            curr_ptr_unary: 0,
            valid_lower_bits_unary: 0,
        }
    }

    /// Positions the reader at a bucket: `bit_pos` is where the bucket's
    /// fixed-width region starts, `unary_offset` is the total fixed-width
    /// length, after which the unary region begins.
    pub fn read_reset(&mut self, bit_pos: usize, unary_offset: usize) {
        self.curr_fixed_offset = bit_pos;
        let unary_pos = bit_pos + unary_offset;
        self.curr_ptr_unary = unary_pos / 64;
        self.curr_window_unary = self.word(self.curr_ptr_unary) >> (unary_pos & 63);
        self.valid_lower_bits_unary = 64 - (unary_pos & 63) as u32;
        self.curr_ptr_unary += 1;
    }

    /// Reads the next code: unary quotient then `log2golomb` fixed bits.
    pub fn read_next(&mut self, log2golomb: u32) -> u64 {
        let mut result = 0u64;

        if self.curr_window_unary == 0 {
            result += u64::from(self.valid_lower_bits_unary);
            self.curr_window_unary = self.word(self.curr_ptr_unary);
            self.curr_ptr_unary += 1;
            self.valid_lower_bits_unary = 64;
            while self.curr_window_unary == 0 {
                if self.curr_ptr_unary >= self.data.len() {
                    break;
                }
                result += 64;
                self.curr_window_unary = self.word(self.curr_ptr_unary);
                self.curr_ptr_unary += 1;
            }
        }

        let pos = self.curr_window_unary.trailing_zeros();
        self.curr_window_unary = (self.curr_window_unary >> pos) >> 1;
        self.valid_lower_bits_unary = self.valid_lower_bits_unary.saturating_sub(pos + 1);
        result += u64::from(pos);

        result <<= log2golomb;
        if log2golomb > 0 {
            let idx = self.curr_fixed_offset / 64;
            let shift = (self.curr_fixed_offset % 64) as u32;
            let mut fixed = self.word(idx) >> shift;
            if shift + log2golomb > 64 {
                fixed |= self.word(idx + 1) << (64 - shift);
            }
            result |= fixed & ((1u64 << log2golomb) - 1);
            self.curr_fixed_offset += log2golomb as usize;
        }
        result
    }

    /// Skips a whole subtree: `nodes` coded nodes in the unary region and
    /// `fixed_len` bits in the fixed-width region.
    pub fn skip_subtree(&mut self, nodes: usize, fixed_len: usize) {
        if nodes == 0 {
            self.curr_fixed_offset += fixed_len;
            return;
        }
        self.curr_fixed_offset += fixed_len;
        let mut missing = nodes;
        loop {
            let count = self.curr_window_unary.count_ones() as usize;
            if count >= missing {
                break;
            }
            self.curr_window_unary = self.word(self.curr_ptr_unary);
            self.curr_ptr_unary += 1;
            missing -= count;
            self.valid_lower_bits_unary = 64;
            if self.curr_ptr_unary > self.data.len() + 1 {
                return;
            }
        }
        let pos = broadword::select1_raw(missing - 1, self.curr_window_unary) as u32;
        self.curr_window_unary = (self.curr_window_unary >> pos) >> 1;
        self.valid_lower_bits_unary = self.valid_lower_bits_unary.saturating_sub(pos + 1);
    }

    fn word(&self, idx: usize) -> u64 {
        // All-ones padding past the end keeps unary scans bounded.
        self.data.get(idx).copied().unwrap_or(u64::MAX)
    }
}

/// Appender for the Golomb-Rice word array: fixed-width halves of a
/// bucket's codes first, then the unary halves via [`Self::append_unary_all`].
#[derive(Debug, Default)]
pub struct GolombRiceBuilder {
    data: Vec<u64>,
    bit_count: usize,
}

impl GolombRiceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bits appended so far; recorded per bucket as its bit position.
    pub fn bit_count(&self) -> usize {
        self.bit_count
    }

    /// Appends the low `log2golomb` bits of `v`.
    pub fn append_fixed(&mut self, v: u64, log2golomb: u32) {
        if log2golomb == 0 {
            return;
        }
        self.reserve_bits(log2golomb as usize);
        let lower_bits = v & ((1u64 << log2golomb) - 1);
        let used = self.bit_count & 63;
        let idx = self.bit_count / 64;
        self.data[idx] |= lower_bits << used;
        if used + log2golomb as usize > 64 {
            self.data[idx + 1] |= lower_bits >> (64 - used);
        }
        self.bit_count += log2golomb as usize;
    }

    /// Appends the unary halves of a bucket's codes.
    pub fn append_unary_all(&mut self, unary: &[u64]) {
        let bit_inc: usize = unary.iter().map(|u| *u as usize + 1).sum();
        self.reserve_bits(bit_inc);
        for u in unary {
            self.bit_count += *u as usize;
            self.data[self.bit_count / 64] |= 1u64 << (self.bit_count & 63);
            self.bit_count += 1;
        }
    }

    pub fn into_words(self) -> Vec<u64> {
        self.data
    }

    fn reserve_bits(&mut self, bits: usize) {
        let needed = (self.bit_count + bits + 63) / 64 + 1;
        if self.data.len() < needed {
            self.data.resize(needed, 0);
        }
    }
}
