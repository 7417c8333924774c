//! Elias-Fano monotone integer lists.
//!
//! Two variants back the index files: [`EliasFano`] stores the ordinal to
//! segment-offset table, [`DoubleEliasFano`] stores the per-bucket
//! cumulative key counts and Golomb-Rice bit positions of the
//! minimal-perfect-hash descriptor, interleaved in one structure.
//!
//! Both are byte-compatible with the existing file layout: a big-endian
//! scalar header followed by the lower-bits, upper-bits and jump arrays
//! re-interpreted as little-endian `u64` words. The symmetric encoders are
//! provided as wire-format primitives; building whole index files stays the
//! job of an external packer.

use std::io::{Read, Write};

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};

#[derive(Debug, thiserror::Error)]
pub enum EliasFanoError {
    #[error("failed to read elias fano data")]
    Read(#[from] std::io::Error),
    #[error("malformed elias fano data: {0}")]
    Format(&'static str),
}

const LOG2_Q: u64 = 8;
const Q: u64 = 1u64 << LOG2_Q;
const Q_MASK: u64 = Q - 1;
const SUPER_Q: u64 = 1u64 << 14;
const Q_PER_SUPER_Q: u64 = SUPER_Q / Q;
/// Jump words per superblock: one absolute position plus 32-bit deltas.
const SUPER_Q_SIZE: u64 = 1 + Q_PER_SUPER_Q / 2;
/// Jump words per superblock of the double variant: 16-bit deltas.
const SUPER_Q_SIZE16: u64 = 1 + Q_PER_SUPER_Q / 4;

/// Monotone list of `count + 1` values over universe `[0, universe)`.
pub struct EliasFano {
    count: u64,
    universe: u64,
    l: u64,
    lower_bits_mask: u64,
    lower_bits: Vec<u64>,
    upper_bits: Vec<u64>,
    jumps: Vec<u64>,
    next_index: u64,
}

impl EliasFano {
    /// Creates an empty list ready to accept `num_elements` non-decreasing
    /// values up to `max_value`. Fill with [`Self::add`], then seal with
    /// [`Self::build_jumps`].
    pub fn new(num_elements: u64, max_value: u64) -> Self {
        assert!(num_elements > 0, "elias fano list cannot be empty");
        let count = num_elements - 1;
        let universe = max_value + 1;
        let (l, lower_bits_mask, words_lower, words_upper, words_jump) =
            derive_bit_fields(universe, count);
        EliasFano {
            count,
            universe,
            l,
            lower_bits_mask,
            lower_bits: vec![0; words_lower as usize],
            upper_bits: vec![0; words_upper as usize],
            jumps: vec![0; words_jump as usize],
            next_index: 0,
        }
    }

    /// Returns the list from its raw components.
    pub fn from_raw(
        count: u64,
        universe: u64,
        lower_bits: Vec<u64>,
        upper_bits: Vec<u64>,
        jumps: Vec<u64>,
    ) -> Self {
        let (l, lower_bits_mask, _, _, _) = derive_bit_fields(universe, count);
        EliasFano {
            count,
            universe,
            l,
            lower_bits_mask,
            lower_bits,
            upper_bits,
            jumps,
            next_index: count + 1,
        }
    }

    /// Reads the serialized form: `count` and `universe` big-endian, then
    /// the three bit arrays as little-endian words.
    pub fn from_reader<R: Read>(reader: &mut R) -> Result<Self, EliasFanoError> {
        let count = reader.read_u64::<BigEndian>()?;
        let universe = reader.read_u64::<BigEndian>()?;
        let (_, _, words_lower, words_upper, words_jump) = derive_bit_fields(universe, count);

        let mut lower_bits = vec![0u64; words_lower as usize];
        reader.read_u64_into::<LittleEndian>(&mut lower_bits)?;
        let mut upper_bits = vec![0u64; words_upper as usize];
        reader.read_u64_into::<LittleEndian>(&mut upper_bits)?;
        let mut jumps = vec![0u64; words_jump as usize];
        reader.read_u64_into::<LittleEndian>(&mut jumps)?;

        Ok(EliasFano::from_raw(count, universe, lower_bits, upper_bits, jumps))
    }

    /// Serializes into the on-disk layout.
    pub fn write_into<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u64::<BigEndian>(self.count)?;
        writer.write_u64::<BigEndian>(self.universe)?;
        for word in self.lower_bits.iter().chain(&self.upper_bits).chain(&self.jumps) {
            writer.write_u64::<LittleEndian>(*word)?;
        }
        Ok(())
    }

    /// Appends the next value. Values must be non-decreasing.
    pub fn add(&mut self, value: u64) {
        debug_assert!(self.next_index <= self.count, "too many values");
        debug_assert!(value < self.universe, "value outside the universe");
        let i = self.next_index;
        if self.l != 0 {
            set_bits(&mut self.lower_bits, i * self.l, self.l, value & self.lower_bits_mask);
        }
        set_bit(&mut self.upper_bits, (value >> self.l) + i);
        self.next_index += 1;
    }

    /// Builds the jump table once all values are in.
    pub fn build_jumps(&mut self) {
        let mut c = 0u64;
        let mut last_super_q = 0u64;
        for word_idx in 0..self.upper_bits.len() {
            let word = self.upper_bits[word_idx];
            for bit in 0..64u64 {
                if word & (1u64 << bit) == 0 {
                    continue;
                }
                let abs = word_idx as u64 * 64 + bit;
                if c % SUPER_Q == 0 {
                    last_super_q = abs;
                    self.jumps[((c / SUPER_Q) * SUPER_Q_SIZE) as usize] = abs;
                }
                if c % Q == 0 {
                    let offset = abs - last_super_q;
                    let jump_super_q = (c / SUPER_Q) * SUPER_Q_SIZE;
                    let jump_inside_super_q = (c % SUPER_Q) / Q;
                    let idx = (jump_super_q + 1 + (jump_inside_super_q >> 1)) as usize;
                    let shift = 32 * (jump_inside_super_q % 2);
                    self.jumps[idx] &= !(0xffff_ffffu64 << shift);
                    self.jumps[idx] |= offset << shift;
                }
                c += 1;
            }
        }
    }

    /// Number of stored values, always at least one.
    pub fn count(&self) -> u64 {
        self.count + 1
    }

    /// Returns the value of the `index`-th element, or `None` past the end.
    pub fn get(&self, index: u64) -> Option<u64> {
        if index > self.count {
            return None;
        }

        let lower_pos = index * self.l;
        let lower_idx = (lower_pos / 64) as usize;
        let shift = lower_pos % 64;
        let mut lower = self.lower_bits[lower_idx] >> shift;
        if shift > 0 {
            lower |= self.lower_bits[lower_idx + 1] << (64 - shift);
        }

        let jump_super_q = (index / SUPER_Q) * SUPER_Q_SIZE;
        let jump_inside_super_q = (index % SUPER_Q) / Q;
        let jump_idx = (jump_super_q + 1 + (jump_inside_super_q >> 1)) as usize;
        let jump_shift = 32 * (jump_inside_super_q % 2);
        let jump = self.jumps[jump_super_q as usize]
            + ((self.jumps[jump_idx] >> jump_shift) & 0xffff_ffff);

        let mut curr_word = (jump / 64) as usize;
        let mut window = self.upper_bits[curr_word] & (u64::MAX << (jump % 64));
        let mut d = index & Q_MASK;
        loop {
            let bit_count = window.count_ones() as u64;
            if bit_count > d {
                break;
            }
            curr_word += 1;
            window = self.upper_bits[curr_word];
            d -= bit_count;
        }

        let sel = broadword::select1_raw(d as usize, window) as u64;
        let value =
            ((curr_word as u64 * 64 + sel - index) << self.l) | (lower & self.lower_bits_mask);
        Some(value)
    }
}

/// Derives `(l, lower_bits_mask, words_lower, words_upper, words_jump)` for
/// a list with the given universe and count.
fn derive_bit_fields(universe: u64, count: u64) -> (u64, u64, u64, u64, u64) {
    let l = if universe / (count + 1) == 0 {
        0
    } else {
        63 ^ (universe / (count + 1)).leading_zeros() as u64
    };

    let lower_bits_mask = (1u64 << l) - 1;
    let words_lower_bits = ((count + 1) * l + 63) / 64 + 1;
    let words_upper_bits = (count + 1 + (universe >> l) + 63) / 64;
    let jump_words_size = {
        let mut size = ((count + 1) / SUPER_Q) * SUPER_Q_SIZE;
        if (count + 1) % SUPER_Q != 0 {
            size += 1 + (((count + 1) % SUPER_Q + Q - 1) / Q + 3) / 2;
        }
        size
    };

    (l, lower_bits_mask, words_lower_bits, words_upper_bits, jump_words_size)
}

fn set_bit(words: &mut [u64], bit: u64) {
    words[(bit / 64) as usize] |= 1u64 << (bit % 64);
}

/// Writes `width` low bits of `value` at `start_bit`, least significant
/// first. The arrays carry one padding word so straddling writes stay in
/// bounds.
fn set_bits(words: &mut [u64], start_bit: u64, width: u64, value: u64) {
    let idx = (start_bit / 64) as usize;
    let shift = start_bit % 64;
    words[idx] |= value << shift;
    if shift + width > 64 {
        words[idx + 1] |= value >> (64 - shift);
    }
}

/// Two interleaved monotone lists indexed by bucket: cumulative key counts
/// and Golomb-Rice bit positions. `get3` also returns the next cumulative
/// count, which is how bucket sizes are derived during a lookup.
pub struct DoubleEliasFano {
    num_buckets: u64,
    u_cum_keys: u64,
    u_position: u64,
    l_cum_keys: u64,
    l_position: u64,
    cum_keys_min_delta: u64,
    position_min_delta: u64,
    lower_bits_mask_cum_keys: u64,
    lower_bits_mask_position: u64,
    lower_bits: Vec<u64>,
    upper_bits_cum_keys: Vec<u64>,
    upper_bits_position: Vec<u64>,
    jump: Vec<u64>,
}

struct DoubleEfCursor {
    cum_keys: u64,
    position: u64,
    window: u64,
    select: u64,
    curr_word: usize,
    lower: u64,
    cum_delta: u64,
}

impl DoubleEliasFano {
    /// Builds the structure from the two per-bucket lists. Both slices hold
    /// `num_buckets + 1` entries; deltas between consecutive entries must be
    /// non-negative.
    pub fn build(cum_keys: &[u64], position: &[u64]) -> Self {
        assert_eq!(cum_keys.len(), position.len());
        assert!(!cum_keys.is_empty());
        let num_buckets = (cum_keys.len() - 1) as u64;

        let mut cum_keys_min_delta = u64::MAX;
        let mut position_min_delta = u64::MAX;
        for i in 1..=num_buckets as usize {
            cum_keys_min_delta = cum_keys_min_delta.min(cum_keys[i] - cum_keys[i - 1]);
            position_min_delta = position_min_delta.min(position[i] - position[i - 1]);
        }
        if num_buckets == 0 {
            cum_keys_min_delta = 0;
            position_min_delta = 0;
        }

        let u_cum_keys = cum_keys[num_buckets as usize] - num_buckets * cum_keys_min_delta + 1;
        let u_position = position[num_buckets as usize] - num_buckets * position_min_delta + 1;

        let mut ef = Self::with_dimensions(
            num_buckets,
            u_cum_keys,
            u_position,
            cum_keys_min_delta,
            position_min_delta,
        );

        let mut cum_delta = 0u64;
        let mut bit_delta = 0u64;
        for i in 0..=num_buckets as usize {
            let cum_value = cum_keys[i] - cum_delta;
            if ef.l_cum_keys != 0 {
                set_bits(
                    &mut ef.lower_bits,
                    i as u64 * (ef.l_cum_keys + ef.l_position),
                    ef.l_cum_keys,
                    cum_value & ef.lower_bits_mask_cum_keys,
                );
            }
            set_bit(&mut ef.upper_bits_cum_keys, (cum_value >> ef.l_cum_keys) + i as u64);

            let pos_value = position[i] - bit_delta;
            if ef.l_position != 0 {
                set_bits(
                    &mut ef.lower_bits,
                    i as u64 * (ef.l_cum_keys + ef.l_position) + ef.l_cum_keys,
                    ef.l_position,
                    pos_value & ef.lower_bits_mask_position,
                );
            }
            set_bit(&mut ef.upper_bits_position, (pos_value >> ef.l_position) + i as u64);

            cum_delta += cum_keys_min_delta;
            bit_delta += position_min_delta;
        }

        ef.build_jumps();
        ef
    }

    /// Reads the serialized form: five big-endian scalars then the bit
    /// arrays as little-endian words.
    pub fn from_reader<R: Read>(reader: &mut R) -> Result<Self, EliasFanoError> {
        let num_buckets = reader.read_u64::<BigEndian>()?;
        let u_cum_keys = reader.read_u64::<BigEndian>()?;
        let u_position = reader.read_u64::<BigEndian>()?;
        let cum_keys_min_delta = reader.read_u64::<BigEndian>()?;
        let position_min_delta = reader.read_u64::<BigEndian>()?;

        let mut ef = Self::with_dimensions(
            num_buckets,
            u_cum_keys,
            u_position,
            cum_keys_min_delta,
            position_min_delta,
        );
        if ef.l_cum_keys * 2 + ef.l_position > 56 {
            return Err(EliasFanoError::Format("lower bit widths out of range"));
        }

        reader.read_u64_into::<LittleEndian>(&mut ef.lower_bits)?;
        reader.read_u64_into::<LittleEndian>(&mut ef.upper_bits_cum_keys)?;
        reader.read_u64_into::<LittleEndian>(&mut ef.upper_bits_position)?;
        reader.read_u64_into::<LittleEndian>(&mut ef.jump)?;
        Ok(ef)
    }

    /// Serializes into the on-disk layout.
    pub fn write_into<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u64::<BigEndian>(self.num_buckets)?;
        writer.write_u64::<BigEndian>(self.u_cum_keys)?;
        writer.write_u64::<BigEndian>(self.u_position)?;
        writer.write_u64::<BigEndian>(self.cum_keys_min_delta)?;
        writer.write_u64::<BigEndian>(self.position_min_delta)?;
        for word in self
            .lower_bits
            .iter()
            .chain(&self.upper_bits_cum_keys)
            .chain(&self.upper_bits_position)
            .chain(&self.jump)
        {
            writer.write_u64::<LittleEndian>(*word)?;
        }
        Ok(())
    }

    pub fn num_buckets(&self) -> u64 {
        self.num_buckets
    }

    fn with_dimensions(
        num_buckets: u64,
        u_cum_keys: u64,
        u_position: u64,
        cum_keys_min_delta: u64,
        position_min_delta: u64,
    ) -> Self {
        let l_cum_keys = low_bits(u_cum_keys, num_buckets);
        let l_position = low_bits(u_position, num_buckets);

        let words_lower_bits = ((num_buckets + 1) * (l_cum_keys + l_position) + 63) / 64 + 1;
        let words_cum_keys = (num_buckets + 1 + (u_cum_keys >> l_cum_keys) + 63) / 64;
        let words_position = (num_buckets + 1 + (u_position >> l_position) + 63) / 64;
        let jump_words = jump_size_words(num_buckets);

        DoubleEliasFano {
            num_buckets,
            u_cum_keys,
            u_position,
            l_cum_keys,
            l_position,
            cum_keys_min_delta,
            position_min_delta,
            lower_bits_mask_cum_keys: (1u64 << l_cum_keys) - 1,
            lower_bits_mask_position: (1u64 << l_position) - 1,
            lower_bits: vec![0; words_lower_bits as usize],
            upper_bits_cum_keys: vec![0; words_cum_keys as usize],
            upper_bits_position: vec![0; words_position as usize],
            jump: vec![0; jump_words as usize],
        }
    }

    fn build_jumps(&mut self) {
        // Cumulative key counts go to the even 16-bit cells, positions to
        // the odd ones; each superblock leads with two absolute words.
        for pass in 0..2 {
            let (upper, abs_slot, cell_parity): (&[u64], u64, u64) = if pass == 0 {
                (&self.upper_bits_cum_keys, 0, 0)
            } else {
                (&self.upper_bits_position, 1, 1)
            };
            let mut writes: Vec<(usize, u64, u64)> = Vec::new();
            let mut absolutes: Vec<(usize, u64)> = Vec::new();
            let mut c = 0u64;
            let mut last_super_q = 0u64;
            for (word_idx, word) in upper.iter().enumerate() {
                for bit in 0..64u64 {
                    if word & (1u64 << bit) == 0 {
                        continue;
                    }
                    let abs = word_idx as u64 * 64 + bit;
                    if c % SUPER_Q == 0 {
                        last_super_q = abs;
                        absolutes
                            .push((((c / SUPER_Q) * SUPER_Q_SIZE16 * 2 + abs_slot) as usize, abs));
                    }
                    if c % Q == 0 {
                        let offset = abs - last_super_q;
                        debug_assert!(offset < (1 << 16));
                        let jump_super_q = (c / SUPER_Q) * SUPER_Q_SIZE16 * 2;
                        let cell = 2 * ((c % SUPER_Q) / Q) + cell_parity;
                        let idx = (jump_super_q + 2 + cell / 4) as usize;
                        let shift = 16 * (cell % 4);
                        writes.push((idx, shift, offset));
                    }
                    c += 1;
                }
            }
            for (idx, value) in absolutes {
                self.jump[idx] = value;
            }
            for (idx, shift, offset) in writes {
                self.jump[idx] &= !(0xffffu64 << shift);
                self.jump[idx] |= offset << shift;
            }
        }
    }

    /// Returns `(cum_keys, position)` for bucket `i`.
    pub fn get2(&self, i: u64) -> (u64, u64) {
        let cursor = self.cursor(i);
        (cursor.cum_keys, cursor.position)
    }

    /// Returns `(cum_keys, cum_keys_next, position)` for bucket `i`.
    pub fn get3(&self, i: u64) -> (u64, u64, u64) {
        let cursor = self.cursor(i);

        let mut window = cursor.window & ((u64::MAX << cursor.select) << 1);
        let mut curr_word = cursor.curr_word;
        while window == 0 {
            curr_word += 1;
            window = self.upper_bits_cum_keys[curr_word];
        }
        let select = window.trailing_zeros() as u64;
        let cum_keys_next = (((curr_word as u64 * 64 + select - i - 1) << self.l_cum_keys)
            | (cursor.lower & self.lower_bits_mask_cum_keys))
            + cursor.cum_delta
            + self.cum_keys_min_delta;

        (cursor.cum_keys, cum_keys_next, cursor.position)
    }

    fn cursor(&self, i: u64) -> DoubleEfCursor {
        debug_assert!(i <= self.num_buckets);

        let pos_lower = i * (self.l_cum_keys + self.l_position);
        let lower_idx = (pos_lower / 64) as usize;
        let shift = pos_lower % 64;
        let mut lower = self.lower_bits[lower_idx] >> shift;
        if shift > 0 {
            lower |= self.lower_bits[lower_idx + 1] << (64 - shift);
        }

        let jump_super_q = (i / SUPER_Q) * SUPER_Q_SIZE16 * 2;
        let jump_inside_super_q = (i % SUPER_Q) / Q;

        let cell_cum = 2 * jump_inside_super_q;
        let idx = (jump_super_q + 2 + cell_cum / 4) as usize;
        let cell_shift = 16 * (cell_cum % 4);
        let jump_cum_keys =
            self.jump[jump_super_q as usize] + ((self.jump[idx] >> cell_shift) & 0xffff);

        let cell_pos = cell_cum + 1;
        let idx = (jump_super_q + 2 + cell_pos / 4) as usize;
        let cell_shift = 16 * (cell_pos % 4);
        let jump_position =
            self.jump[(jump_super_q + 1) as usize] + ((self.jump[idx] >> cell_shift) & 0xffff);

        let mut curr_word_cum = (jump_cum_keys / 64) as usize;
        let mut curr_word_pos = (jump_position / 64) as usize;
        let mut window_cum = self.upper_bits_cum_keys[curr_word_cum] & (u64::MAX << (jump_cum_keys % 64));
        let mut window_pos = self.upper_bits_position[curr_word_pos] & (u64::MAX << (jump_position % 64));
        let mut delta_cum = i & Q_MASK;
        let mut delta_pos = i & Q_MASK;

        loop {
            let bit_count = window_cum.count_ones() as u64;
            if bit_count > delta_cum {
                break;
            }
            curr_word_cum += 1;
            window_cum = self.upper_bits_cum_keys[curr_word_cum];
            delta_cum -= bit_count;
        }
        loop {
            let bit_count = window_pos.count_ones() as u64;
            if bit_count > delta_pos {
                break;
            }
            curr_word_pos += 1;
            window_pos = self.upper_bits_position[curr_word_pos];
            delta_pos -= bit_count;
        }

        let select_cum = broadword::select1_raw(delta_cum as usize, window_cum) as u64;
        let cum_delta = i * self.cum_keys_min_delta;
        let cum_keys = (((curr_word_cum as u64 * 64 + select_cum - i) << self.l_cum_keys)
            | (lower & self.lower_bits_mask_cum_keys))
            + cum_delta;

        let lower_pos_bits = lower >> self.l_cum_keys;
        let select_pos = broadword::select1_raw(delta_pos as usize, window_pos) as u64;
        let bit_delta = i * self.position_min_delta;
        let position = (((curr_word_pos as u64 * 64 + select_pos - i) << self.l_position)
            | (lower_pos_bits & self.lower_bits_mask_position))
            + bit_delta;

        DoubleEfCursor {
            cum_keys,
            position,
            window: window_cum,
            select: select_cum,
            curr_word: curr_word_cum,
            lower,
            cum_delta,
        }
    }
}

fn low_bits(universe: u64, num_buckets: u64) -> u64 {
    if universe / (num_buckets + 1) == 0 {
        0
    } else {
        63 ^ (universe / (num_buckets + 1)).leading_zeros() as u64
    }
}

fn jump_size_words(num_buckets: u64) -> u64 {
    let n = num_buckets + 1;
    let mut size = (n / SUPER_Q) * SUPER_Q_SIZE16 * 2;
    if n % SUPER_Q != 0 {
        size += (1 + ((n % SUPER_Q + Q - 1) / Q + 3) / 4) * 2;
    }
    size
}
