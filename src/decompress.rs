//! Segment decompression.
//!
//! A segment file is a Huffman-compressed concatenation of variable-length
//! words. The file header carries two dictionaries: *patterns* (byte strings
//! that repeat across words) and *positions* (word lengths and in-word
//! pattern positions). A word is encoded as its length code, a list of
//! (position, pattern) pairs closed by a zero position, and, after byte
//! alignment, the raw bytes not covered by any pattern.
//!
//! The decoder works directly over the memory mapping and can resume from
//! any recorded word-start byte offset, so index lookups can jump straight
//! to a record without touching the preceding words.

use std::{
    fs,
    io::{Cursor, Read},
    path::{Path, PathBuf},
    time::SystemTime,
};

use byteorder::{BigEndian, ReadBytesExt};
use memmap2::Mmap;
use tracing::info;

/// Tables with bitlen greater than this would be condensed. Condensing is
/// disabled: every table level is direct-indexed with at most 9 bits.
const MAX_TABLE_BITLEN: u8 = 9;

/// Maximum depth a dictionary entry may declare.
const MAX_DICTIONARY_DEPTH: u64 = 2048;

#[derive(Debug, thiserror::Error)]
pub enum DecompressorError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("malformed segment {path}: {reason}")]
    Format { path: PathBuf, reason: String },
    #[error("segment {path} is not open")]
    Closed { path: PathBuf },
    #[error("invalid word at offset {offset}: {reason}")]
    InvalidWord { offset: u64, reason: &'static str },
}

/// Lazily decompresses a segment file into a sequence of words.
///
/// Construction is inert: [`Decompressor::open`] maps the file and parses
/// the dictionaries, [`Decompressor::close`] releases the mapping. While
/// open, any number of [`Getter`]s may read concurrently.
#[derive(Debug)]
pub struct Decompressor {
    path: PathBuf,
    mapped: Option<Mapped>,
}

#[derive(Debug)]
struct Mapped {
    mod_time: SystemTime,
    size: u64,
    mmap: Mmap,
    words_count: u64,
    empty_words_count: u64,
    /// Absolute offset of the first word.
    words_start: usize,
    pattern_table: Option<PatternTable>,
    position_table: Option<PositionTable>,
}

/// A cursor over the words of an open segment.
///
/// Non-owning: it borrows the decompressor's mapping and is only valid while
/// the segment stays open. Offsets are absolute file offsets, the same
/// values recorded in companion index files.
pub struct Getter<'a> {
    data: &'a [u8],
    pattern_table: Option<&'a PatternTable>,
    position_table: Option<&'a PositionTable>,
    pos: usize,
    bit: u8,
}

impl Decompressor {
    /// Creates an inert decompressor; no file access until [`Self::open`].
    pub fn new(path: PathBuf) -> Self {
        Decompressor { path, mapped: None }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.mapped.is_some()
    }

    /// Modification time of the segment file, if open.
    pub fn last_write_time(&self) -> Option<SystemTime> {
        self.mapped.as_ref().map(|m| m.mod_time)
    }

    /// Segment file size in bytes, if open.
    pub fn size(&self) -> Option<u64> {
        self.mapped.as_ref().map(|m| m.size)
    }

    /// Number of words in the segment, if open.
    pub fn count(&self) -> Option<u64> {
        self.mapped.as_ref().map(|m| m.words_count)
    }

    /// Maps the file and parses the dictionaries. Reopens if already open.
    pub fn open(&mut self) -> Result<(), DecompressorError> {
        self.close();
        self.mapped = Some(Mapped::open(&self.path)?);
        Ok(())
    }

    /// Unmaps the file. Idempotent.
    pub fn close(&mut self) {
        self.mapped = None;
    }

    /// Runs `f` once with a fresh iterator positioned at the first word,
    /// advising the OS of the upcoming sequential access.
    pub fn read_ahead<R>(
        &self,
        f: impl FnOnce(Getter<'_>) -> R,
    ) -> Result<R, DecompressorError> {
        let mapped = self.mapped()?;
        #[cfg(unix)]
        let _ = mapped.mmap.advise(memmap2::Advice::Sequential);
        let result = f(mapped.getter());
        #[cfg(unix)]
        let _ = mapped.mmap.advise(memmap2::Advice::Normal);
        Ok(result)
    }

    /// Returns an iterator positioned at the first word. Use
    /// [`Getter::reset`] to jump to a recorded word-start offset.
    pub fn make_iterator(&self) -> Result<Getter<'_>, DecompressorError> {
        Ok(self.mapped()?.getter())
    }

    fn mapped(&self) -> Result<&Mapped, DecompressorError> {
        self.mapped.as_ref().ok_or_else(|| DecompressorError::Closed {
            path: self.path.clone(),
        })
    }
}

impl Mapped {
    fn open(path: &Path) -> Result<Self, DecompressorError> {
        let format_err = |reason: &str| DecompressorError::Format {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };

        let stat = fs::metadata(path)?;
        let mod_time = stat.modified()?;
        let file = fs::File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        let mut cursor = Cursor::new(&mmap[..]);
        let words_count = cursor
            .read_u64::<BigEndian>()
            .map_err(|_| format_err("truncated words count"))?;
        let empty_words_count = cursor
            .read_u64::<BigEndian>()
            .map_err(|_| format_err("truncated empty words count"))?;

        // Pattern dictionary: (depth, length, bytes) entries.
        let patterns_size = cursor
            .read_u64::<BigEndian>()
            .map_err(|_| format_err("truncated patterns size"))?;
        let patterns_start = cursor.position();
        let mut patterns = Vec::new();
        let mut pattern_max_depth = 0u64;
        while cursor.position() - patterns_start < patterns_size {
            let depth = unsigned_varint::io::read_u64(&mut cursor)
                .map_err(|_| format_err("bad pattern depth"))?;
            if depth > MAX_DICTIONARY_DEPTH {
                return Err(format_err("pattern depth above dictionary limit"));
            }
            pattern_max_depth = pattern_max_depth.max(depth);

            let len = unsigned_varint::io::read_u64(&mut cursor)
                .map_err(|_| format_err("bad pattern length"))?;
            let mut pattern = Vec::with_capacity(len as usize);
            (&mut cursor)
                .take(len)
                .read_to_end(&mut pattern)
                .map_err(|_| format_err("truncated pattern"))?;
            if pattern.len() as u64 != len {
                return Err(format_err("truncated pattern"));
            }
            patterns.push((depth, pattern));
        }
        if cursor.position() - patterns_start != patterns_size {
            return Err(format_err("pattern dictionary overruns its declared size"));
        }
        let pattern_table = if patterns.is_empty() {
            None
        } else {
            let bitlen = u8::min(MAX_TABLE_BITLEN, pattern_max_depth as u8);
            Some(PatternTable::from_patterns(&patterns, bitlen, pattern_max_depth))
        };

        // Position dictionary: (depth, value) entries.
        let positions_size = cursor
            .read_u64::<BigEndian>()
            .map_err(|_| format_err("truncated positions size"))?;
        let positions_start = cursor.position();
        let mut positions = Vec::new();
        let mut position_max_depth = 0u64;
        while cursor.position() - positions_start < positions_size {
            let depth = unsigned_varint::io::read_u64(&mut cursor)
                .map_err(|_| format_err("bad position depth"))?;
            if depth > MAX_DICTIONARY_DEPTH {
                return Err(format_err("position depth above dictionary limit"));
            }
            position_max_depth = position_max_depth.max(depth);

            let position = unsigned_varint::io::read_u64(&mut cursor)
                .map_err(|_| format_err("bad position value"))?;
            positions.push((depth, position));
        }
        if cursor.position() - positions_start != positions_size {
            return Err(format_err("position dictionary overruns its declared size"));
        }
        let position_table = if positions.is_empty() {
            None
        } else {
            let bitlen = u8::min(MAX_TABLE_BITLEN, position_max_depth as u8);
            Some(PositionTable::from_positions(&positions, bitlen, position_max_depth))
        };

        let words_start = cursor.position() as usize;

        info!(
            path = %path.display(),
            words_count,
            empty_words_count,
            patterns = patterns.len(),
            positions = positions.len(),
            "opened segment"
        );

        Ok(Mapped {
            mod_time,
            size: stat.len(),
            mmap,
            words_count,
            empty_words_count,
            words_start,
            pattern_table,
            position_table,
        })
    }

    fn getter(&self) -> Getter<'_> {
        Getter {
            data: &self.mmap[..],
            pattern_table: self.pattern_table.as_ref(),
            position_table: self.position_table.as_ref(),
            pos: self.words_start,
            bit: 0,
        }
    }
}

impl<'a> Getter<'a> {
    /// Jumps to an arbitrary word-start byte offset.
    pub fn reset(&mut self, offset: u64) {
        self.pos = offset as usize;
        self.bit = 0;
    }

    /// Current absolute byte offset; at a word boundary this is the offset
    /// of the next word.
    pub fn pos(&self) -> u64 {
        self.pos as u64
    }

    pub fn has_next(&self) -> bool {
        self.pos < self.data.len()
    }

    /// Decodes the word at the current offset, appending its bytes to `out`.
    /// Returns the byte offset of the subsequent word.
    ///
    /// Fails when the offset is not a valid word start or the stream is
    /// truncated; the cursor is left in an unspecified position afterwards
    /// and must be `reset` before reuse.
    pub fn next(&mut self, out: &mut Vec<u8>) -> Result<u64, DecompressorError> {
        if !self.has_next() {
            return Err(self.invalid_word("read past the last word"));
        }

        let save_pos = self.pos;
        let word_len = self
            .next_pos(true)?
            .checked_sub(1)
            .ok_or_else(|| self.invalid_word("zero length code"))?;

        if word_len == 0 {
            if self.bit > 0 {
                self.pos += 1;
                self.bit = 0;
            }
            return Ok(self.pos as u64);
        }

        let start = out.len();
        out.resize(start + word_len, 0);

        // First pass: fill in the dictionary patterns.
        let mut buf_pos = 0usize;
        loop {
            let pos = self.next_pos(false)?;
            if pos == 0 {
                break;
            }
            buf_pos += pos - 1;
            if buf_pos > word_len {
                return Err(self.invalid_word("pattern past the word end"));
            }
            self.next_pattern(&mut out[start + buf_pos..start + word_len])?;
        }
        if self.bit > 0 {
            self.pos += 1;
            self.bit = 0;
        }

        // Second pass: re-walk the positions and fill the bytes not covered
        // by any pattern from the raw data that follows the codes.
        let mut post_loop_pos = self.pos;
        self.pos = save_pos;
        self.bit = 0;
        self.next_pos(true)?;

        let mut buf_pos = 0usize;
        let mut last_uncovered = 0usize;
        loop {
            let pos = self.next_pos(false)?;
            if pos == 0 {
                break;
            }
            buf_pos += pos - 1;
            if buf_pos > last_uncovered {
                let diff = buf_pos - last_uncovered;
                let src = self
                    .data
                    .get(post_loop_pos..post_loop_pos + diff)
                    .ok_or_else(|| self.invalid_word("truncated word data"))?;
                out[start + last_uncovered..start + buf_pos].copy_from_slice(src);
                post_loop_pos += diff;
            }
            last_uncovered = buf_pos + self.next_pattern_len()?;
            if last_uncovered > word_len {
                return Err(self.invalid_word("pattern past the word end"));
            }
        }
        if word_len > last_uncovered {
            let diff = word_len - last_uncovered;
            let src = self
                .data
                .get(post_loop_pos..post_loop_pos + diff)
                .ok_or_else(|| self.invalid_word("truncated word data"))?;
            out[start + last_uncovered..start + word_len].copy_from_slice(src);
            post_loop_pos += diff;
        }

        self.pos = post_loop_pos;
        self.bit = 0;
        Ok(self.pos as u64)
    }

    /// Decodes the next position symbol. `clean` first realigns to a byte
    /// boundary, which is how every word starts.
    fn next_pos(&mut self, clean: bool) -> Result<usize, DecompressorError> {
        if clean && self.bit > 0 {
            self.pos += 1;
            self.bit = 0;
        }

        let table = self
            .position_table
            .ok_or_else(|| self.invalid_word("segment has no position dictionary"))?;
        let mut node = table.root();
        if node.bitlen == 0 {
            return Ok(node.positions[0].0 as usize);
        }

        loop {
            let code = self.peek_code(node.bitlen)?;
            let (position, code_len) = node.positions[code as usize];
            if code_len == 0 {
                let child = node.children[code as usize]
                    .ok_or_else(|| self.invalid_word("dangling position code"))?;
                node = table.position_at_index(child);
                self.bit += MAX_TABLE_BITLEN;
                self.advance_bits();
            } else {
                self.bit += code_len;
                self.advance_bits();
                return Ok(position as usize);
            }
        }
    }

    /// Decodes the next pattern symbol into `out`, returning its length.
    fn next_pattern(&mut self, out: &mut [u8]) -> Result<usize, DecompressorError> {
        let (codeword_idx, len) = self.next_pattern_ref()?;
        let table = self
            .pattern_table
            .ok_or_else(|| self.invalid_word("word references a pattern but the dictionary is empty"))?;
        let pattern = &table.codewords[codeword_idx].pattern;
        if len > out.len() {
            return Err(self.invalid_word("pattern longer than the word"));
        }
        out[..len].copy_from_slice(pattern);
        Ok(len)
    }

    /// Decodes the next pattern symbol without copying it, returning its
    /// length only. Used while re-walking positions for uncovered data.
    fn next_pattern_len(&mut self) -> Result<usize, DecompressorError> {
        let (_, len) = self.next_pattern_ref()?;
        Ok(len)
    }

    /// Walks the pattern tables and returns (codeword index, pattern length).
    fn next_pattern_ref(&mut self) -> Result<(usize, usize), DecompressorError> {
        let table = self
            .pattern_table
            .ok_or_else(|| self.invalid_word("word references a pattern but the dictionary is empty"))?;
        let mut node = table.root();

        if node.bitlen == 0 {
            let codeword_idx = node.patterns[0]
                .ok_or_else(|| self.invalid_word("empty pattern table"))?;
            let len = table.codewords[codeword_idx].pattern.len();
            return Ok((codeword_idx, len));
        }

        loop {
            let code = self.peek_code(node.bitlen)?;
            let codeword_idx = node.patterns[code as usize]
                .ok_or_else(|| self.invalid_word("dangling pattern code"))?;
            let codeword = &table.codewords[codeword_idx];
            if codeword.size == 0 {
                let child = codeword
                    .table
                    .ok_or_else(|| self.invalid_word("dangling pattern table link"))?;
                node = table.pattern_at_index(child);
                self.bit += MAX_TABLE_BITLEN;
                self.advance_bits();
            } else {
                self.bit += codeword.size;
                self.advance_bits();
                return Ok((codeword_idx, codeword.pattern.len()));
            }
        }
    }

    /// Reads up to `bitlen` bits at the cursor, least significant first.
    fn peek_code(&self, bitlen: u8) -> Result<u16, DecompressorError> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or_else(|| self.invalid_word("truncated code stream"))?;
        let mut code = (byte as u16) >> self.bit;
        if 8 - self.bit < bitlen {
            if let Some(next) = self.data.get(self.pos + 1) {
                code |= (*next as u16) << (8 - self.bit);
            }
        }
        Ok(code & ((1u16 << bitlen) - 1))
    }

    fn advance_bits(&mut self) {
        self.pos += (self.bit / 8) as usize;
        self.bit %= 8;
    }

    fn invalid_word(&self, reason: &'static str) -> DecompressorError {
        DecompressorError::InvalidWord {
            offset: self.pos as u64,
            reason,
        }
    }
}

/// Pattern decode tables. The root table consumes up to 9 bits at a time;
/// deeper dictionaries chain through child tables.
#[derive(Debug)]
struct PatternTable {
    children: Vec<Pattern>,
    codewords: Vec<Codeword>,
}

#[derive(Debug)]
struct Pattern {
    bitlen: u8,
    /// Codeword index per code slot.
    patterns: Vec<Option<usize>>,
}

#[derive(Debug)]
struct Codeword {
    /// Dictionary bytes this codeword expands to.
    pattern: Vec<u8>,
    /// Code associated with the pattern.
    code: u16,
    /// Number of bits in the code; zero links to a child table.
    size: u8,
    /// Child table index for codes longer than one table level.
    table: Option<usize>,
}

impl PatternTable {
    fn from_patterns(patterns: &[(u64, Vec<u8>)], bitlen: u8, max_depth: u64) -> Self {
        let mut table = PatternTable {
            children: vec![Pattern::with_bitlen(bitlen)],
            codewords: Vec::new(),
        };
        table.build_table(0, patterns, 0, 0, 0, max_depth);
        table
    }

    fn root(&self) -> &Pattern {
        &self.children[0]
    }

    fn pattern_at_index(&self, idx: usize) -> &Pattern {
        &self.children[idx]
    }

    fn build_table(
        &mut self,
        pat_idx: usize,
        patterns: &[(u64, Vec<u8>)],
        code: u16,
        bits: u8,
        depth: u64,
        max_depth: u64,
    ) -> usize {
        if patterns.is_empty() {
            return 0;
        }

        let (curr_depth, curr_pattern) = &patterns[0];
        if depth == *curr_depth {
            let codeword_idx = self.new_codeword(curr_pattern.clone(), code, bits, None);
            self.insert_codeword(pat_idx, codeword_idx);
            return 1;
        }

        if bits == MAX_TABLE_BITLEN {
            let bitlen = u64::min(MAX_TABLE_BITLEN as u64, max_depth) as u8;
            let new_pat_idx = self.new_pattern(bitlen);
            let codeword_idx = self.new_codeword(Vec::new(), code, 0, Some(new_pat_idx));
            self.insert_codeword(pat_idx, codeword_idx);
            return self.build_table(new_pat_idx, patterns, 0, 0, depth, max_depth);
        }

        let b0 = self.build_table(pat_idx, patterns, code, bits + 1, depth + 1, max_depth - 1);
        let b1 = self.build_table(
            pat_idx,
            &patterns[b0..],
            (1u16 << bits) | code,
            bits + 1,
            depth + 1,
            max_depth - 1,
        );
        b0 + b1
    }

    fn new_codeword(&mut self, pattern: Vec<u8>, code: u16, size: u8, table: Option<usize>) -> usize {
        let index = self.codewords.len();
        self.codewords.push(Codeword {
            pattern,
            code,
            size,
            table,
        });
        index
    }

    fn new_pattern(&mut self, bitlen: u8) -> usize {
        let index = self.children.len();
        self.children.push(Pattern::with_bitlen(bitlen));
        index
    }

    fn insert_codeword(&mut self, pat_idx: usize, codeword_idx: usize) {
        let codeword = &self.codewords[codeword_idx];
        let table = &mut self.children[pat_idx];

        let code_step = 1u16 << codeword.size;
        let code_from = codeword.code;
        let mut code_to = codeword.code + code_step;
        if table.bitlen != codeword.size && codeword.size > 0 {
            code_to = code_from | (1u16 << table.bitlen);
        }
        for c in (code_from..code_to).step_by(code_step as usize) {
            table.patterns[c as usize] = Some(codeword_idx);
        }
    }
}

impl Pattern {
    fn with_bitlen(bitlen: u8) -> Self {
        debug_assert!(bitlen <= MAX_TABLE_BITLEN);
        let size = (1u16 << bitlen) as usize;
        let mut patterns = Vec::with_capacity(size);
        patterns.resize_with(size, Default::default);
        Pattern { bitlen, patterns }
    }
}

/// Position decode tables, same shape as the pattern tables.
#[derive(Debug)]
struct PositionTable {
    children: Vec<Position>,
}

#[derive(Debug)]
struct Position {
    bitlen: u8,
    /// (position value, code length) per code slot.
    positions: Vec<(u64, u8)>,
    children: Vec<Option<usize>>,
}

impl PositionTable {
    fn from_positions(positions: &[(u64, u64)], bitlen: u8, max_depth: u64) -> Self {
        let mut table = PositionTable {
            children: vec![Position::with_bitlen(bitlen)],
        };
        table.build_table(0, positions, 0, 0, 0, max_depth);
        table
    }

    fn root(&self) -> &Position {
        &self.children[0]
    }

    fn position_at_index(&self, idx: usize) -> &Position {
        &self.children[idx]
    }

    fn build_table(
        &mut self,
        pos_idx: usize,
        positions: &[(u64, u64)],
        code: u16,
        bits: u8,
        depth: u64,
        max_depth: u64,
    ) -> usize {
        if positions.is_empty() {
            return 0;
        }

        let (curr_depth, curr_pos) = positions[0];
        if depth == curr_depth {
            let table = &mut self.children[pos_idx];
            if table.bitlen == bits {
                table.positions[code as usize] = (curr_pos, bits);
            } else {
                let code_step = 1u16 << bits;
                let code_to = code | (1u16 << table.bitlen);
                for c in (code..code_to).step_by(code_step as usize) {
                    table.positions[c as usize] = (curr_pos, bits);
                }
            }
            return 1;
        }

        if bits == MAX_TABLE_BITLEN {
            let bitlen = u64::min(MAX_TABLE_BITLEN as u64, max_depth) as u8;
            let new_pos_idx = {
                let index = self.children.len();
                self.children.push(Position::with_bitlen(bitlen));
                index
            };
            let table = &mut self.children[pos_idx];
            table.positions[code as usize] = (0, 0);
            table.children[code as usize] = Some(new_pos_idx);
            return self.build_table(new_pos_idx, positions, 0, 0, depth, max_depth);
        }

        let b0 = self.build_table(pos_idx, positions, code, bits + 1, depth + 1, max_depth - 1);
        let b1 = self.build_table(
            pos_idx,
            &positions[b0..],
            (1u16 << bits) | code,
            bits + 1,
            depth + 1,
            max_depth - 1,
        );
        b0 + b1
    }
}

impl Position {
    fn with_bitlen(bitlen: u8) -> Self {
        debug_assert!(bitlen <= MAX_TABLE_BITLEN);
        let size = (1u16 << bitlen) as usize;
        let mut children = Vec::with_capacity(size);
        children.resize_with(size, Default::default);
        Position {
            bitlen,
            positions: vec![(0, 0); size],
            children,
        }
    }
}
