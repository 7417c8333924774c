//! RecSplit minimal-perfect-hash index files.
//!
//! An index maps a fixed set of `N` keys to ordinals in `[0, N)` and
//! ordinals to byte offsets inside the companion segment. The structure is
//! static: keys are hashed with seeded 128-bit Murmur3, the first half
//! selects a bucket through the double Elias-Fano directory, and the
//! second half drives a Golomb-Rice coded splitting tree down to a leaf
//! bijection. The hash function returns an ordinal for *any* input, member
//! or not — callers confirm membership by decoding the record and comparing
//! its domain key.

use std::{
    fs,
    io::{Cursor, Seek, SeekFrom},
    path::{Path, PathBuf},
    time::SystemTime,
};

use byteorder::{BigEndian, ReadBytesExt};
use memmap2::Mmap;
use tracing::trace;

use crate::{
    elias_fano::{DoubleEliasFano, EliasFano, EliasFanoError},
    golomb_rice::{GolombRiceMemo, GolombRiceReader, MAX_LEAF_SIZE},
};

/// Offset of the record table: base data id, key count and record width.
const RECORDS_OFFSET: u64 = 8 + 8 + 1;

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("malformed index {path}: {reason}")]
    Format { path: PathBuf, reason: String },
    #[error(transparent)]
    EliasFano(#[from] EliasFanoError),
}

/// A loaded index file.
///
/// Immutable once opened; reopening the file is the only way to observe a
/// rebuilt index.
pub struct Index {
    path: PathBuf,
    mod_time: SystemTime,
    size: u64,
    mmap: Mmap,
    base_data_id: u64,
    key_count: u64,
    bytes_per_rec: usize,
    rec_mask: u64,
    bucket_count: u64,
    leaf_size: u16,
    primary_aggr_bound: u16,
    secondary_aggr_bound: u16,
    salt: u32,
    start_seed: Vec<u64>,
    /// With enums the record table stores ordinals and `offset_ef` stores
    /// offsets; without it the record table stores the mapped values
    /// directly.
    offset_ef: Option<EliasFano>,
    memo: GolombRiceMemo,
    gr_data: Vec<u64>,
    bucket_ef: DoubleEliasFano,
}

impl Index {
    /// Memory-maps and parses an index file.
    pub fn open(path: &Path) -> Result<Self, IndexError> {
        let format_err = |reason: String| IndexError::Format {
            path: path.to_path_buf(),
            reason,
        };
        let truncated = |what: &str| format_err(format!("truncated {what}"));

        let stat = fs::metadata(path)?;
        let mod_time = stat.modified()?;
        let file = fs::File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        let mut cursor = Cursor::new(&mmap[..]);
        let base_data_id = cursor
            .read_u64::<BigEndian>()
            .map_err(|_| truncated("base data id"))?;
        let key_count = cursor
            .read_u64::<BigEndian>()
            .map_err(|_| truncated("key count"))?;
        let bytes_per_rec = cursor.read_u8().map_err(|_| truncated("record width"))? as usize;
        if bytes_per_rec == 0 || bytes_per_rec > 8 {
            return Err(format_err(format!("unsupported record width {bytes_per_rec}")));
        }
        let rec_mask = if bytes_per_rec == 8 {
            u64::MAX
        } else {
            (1u64 << (8 * bytes_per_rec)) - 1
        };

        let records_end = RECORDS_OFFSET + key_count * bytes_per_rec as u64;
        if records_end > mmap.len() as u64 {
            return Err(truncated("record table"));
        }
        cursor
            .seek(SeekFrom::Start(records_end))
            .map_err(|_| truncated("record table"))?;

        let bucket_count = cursor
            .read_u64::<BigEndian>()
            .map_err(|_| truncated("bucket count"))?;
        let _bucket_size = cursor
            .read_u16::<BigEndian>()
            .map_err(|_| truncated("bucket size"))?;
        let leaf_size = cursor
            .read_u16::<BigEndian>()
            .map_err(|_| truncated("leaf size"))?;
        if leaf_size > MAX_LEAF_SIZE {
            return Err(format_err(format!("leaf size {leaf_size} out of range")));
        }
        let primary_aggr_bound =
            leaf_size * u16::max(2, (0.35 * f64::from(leaf_size) + 0.5).ceil() as u16);
        let secondary_aggr_bound = if leaf_size < 7 {
            primary_aggr_bound * 2
        } else {
            primary_aggr_bound * (0.21 * f64::from(leaf_size) + 9.0 / 10.0).ceil() as u16
        };

        let salt = cursor.read_u32::<BigEndian>().map_err(|_| truncated("salt"))?;
        let start_seed_len = cursor.read_u8().map_err(|_| truncated("seed count"))?;
        let mut start_seed = vec![0u64; start_seed_len as usize];
        for seed in start_seed.iter_mut() {
            *seed = cursor
                .read_u64::<BigEndian>()
                .map_err(|_| truncated("start seeds"))?;
        }

        let has_enums = 0 != cursor.read_u8().map_err(|_| truncated("enums flag"))?;
        let offset_ef = if has_enums {
            Some(EliasFano::from_reader(&mut cursor)?)
        } else {
            None
        };

        // The parameter table is recomputed from its stored size; the count
        // is a u16 occupying four bytes on disk.
        let golomb_param_count = cursor
            .read_u16::<BigEndian>()
            .map_err(|_| truncated("golomb parameter count"))?;
        cursor
            .seek(SeekFrom::Current(2))
            .map_err(|_| truncated("golomb parameter count"))?;
        let memo = GolombRiceMemo::new(
            golomb_param_count,
            leaf_size,
            primary_aggr_bound,
            secondary_aggr_bound,
        );

        let gr_words = cursor
            .read_u64::<BigEndian>()
            .map_err(|_| truncated("golomb rice length"))?;
        if gr_words > (mmap.len() as u64) / 8 {
            return Err(truncated("golomb rice data"));
        }
        let mut gr_data = vec![0u64; gr_words as usize];
        cursor
            .read_u64_into::<byteorder::LittleEndian>(&mut gr_data)
            .map_err(|_| truncated("golomb rice data"))?;

        let bucket_ef = DoubleEliasFano::from_reader(&mut cursor)?;
        if bucket_ef.num_buckets() != bucket_count {
            return Err(format_err(format!(
                "bucket directory covers {} buckets, header says {}",
                bucket_ef.num_buckets(),
                bucket_count
            )));
        }

        trace!(
            path = %path.display(),
            base_data_id,
            key_count,
            bytes_per_rec,
            bucket_count,
            leaf_size,
            salt,
            enums = has_enums,
            "opened index"
        );

        Ok(Index {
            path: path.to_path_buf(),
            mod_time,
            size: stat.len(),
            mmap,
            base_data_id,
            key_count,
            bytes_per_rec,
            rec_mask,
            bucket_count,
            leaf_size,
            primary_aggr_bound,
            secondary_aggr_bound,
            salt,
            start_seed,
            offset_ef,
            memo,
            gr_data,
            bucket_ef,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn last_write_time(&self) -> SystemTime {
        self.mod_time
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Domain id assigned to ordinal zero.
    pub fn base_data_id(&self) -> u64 {
        self.base_data_id
    }

    pub fn key_count(&self) -> u64 {
        self.key_count
    }

    /// Maps a key to its record value: the ordinal for enum indices, the
    /// stored value otherwise. Meaningful only for keys that were in the
    /// constructed set; any other input yields an arbitrary in-range value
    /// that the caller must reject by confirming the decoded record.
    pub fn lookup(&self, key: &[u8]) -> u64 {
        if self.key_count == 0 {
            return 0;
        }
        if self.key_count == 1 {
            return self.rec_at(0);
        }

        let (bucket_hash, fingerprint) = hash_key_with_salt(key, self.salt);
        let bucket = remap(bucket_hash, self.bucket_count);
        let (mut cum_keys, cum_keys_next, bit_pos) = self.bucket_ef.get3(bucket);
        let mut m = (cum_keys_next - cum_keys) as u16;

        let mut reader = GolombRiceReader::new(&self.gr_data);
        reader.read_reset(bit_pos as usize, self.memo.skip_bits(m) as usize);

        let mut level = 0usize;
        while m > self.secondary_aggr_bound {
            let d = reader.read_next(self.memo.golomb_param(m));
            let hmod = remap16(remix(fingerprint.wrapping_add(self.seed(level)).wrapping_add(d)), m);
            let split = ((((m as u32 + 1) / 2 + self.secondary_aggr_bound as u32 - 1)
                / self.secondary_aggr_bound as u32)
                * self.secondary_aggr_bound as u32) as u16;
            if hmod < split {
                m = split;
            } else {
                reader.skip_subtree(
                    self.memo.skip_nodes(split) as usize,
                    self.memo.skip_bits(split) as usize,
                );
                m -= split;
                cum_keys += split as u64;
            }
            level += 1;
        }
        if m > self.primary_aggr_bound {
            let d = reader.read_next(self.memo.golomb_param(m));
            let hmod = remap16(remix(fingerprint.wrapping_add(self.seed(level)).wrapping_add(d)), m);
            let part = hmod / self.primary_aggr_bound;
            m = u16::min(self.primary_aggr_bound, m - part * self.primary_aggr_bound);
            cum_keys += self.primary_aggr_bound as u64 * part as u64;
            if part != 0 {
                reader.skip_subtree(
                    self.memo.skip_nodes(self.primary_aggr_bound) as usize * part as usize,
                    self.memo.skip_bits(self.primary_aggr_bound) as usize * part as usize,
                );
            }
            level += 1;
        }
        if m > self.leaf_size {
            let d = reader.read_next(self.memo.golomb_param(m));
            let hmod = remap16(remix(fingerprint.wrapping_add(self.seed(level)).wrapping_add(d)), m);
            let part = hmod / self.leaf_size;
            m = u16::min(self.leaf_size, m - part * self.leaf_size);
            cum_keys += self.leaf_size as u64 * part as u64;
            if part != 0 {
                reader.skip_subtree(
                    part as usize,
                    self.memo.skip_bits(self.leaf_size) as usize * part as usize,
                );
            }
            level += 1;
        }

        let b = reader.read_next(self.memo.golomb_param(m));
        let rec =
            cum_keys + remap16(remix(fingerprint.wrapping_add(self.seed(level)).wrapping_add(b)), m) as u64;
        self.rec_at(rec)
    }

    /// Byte offset in the companion segment of the record with the given
    /// ordinal, `None` past the key count or when the index carries no
    /// ordinal table (out-of-range ordinals are a caller contract
    /// violation).
    pub fn ordinal_lookup(&self, ordinal: u64) -> Option<u64> {
        self.offset_ef.as_ref()?.get(ordinal)
    }

    fn seed(&self, level: usize) -> u64 {
        self.start_seed.get(level).copied().unwrap_or(0)
    }

    fn rec_at(&self, slot: u64) -> u64 {
        let start = (RECORDS_OFFSET + slot * self.bytes_per_rec as u64) as usize;
        let Some(bytes) = self.mmap.get(start..start + self.bytes_per_rec) else {
            return 0;
        };
        let mut value = 0u64;
        for byte in bytes {
            value = (value << 8) | u64::from(*byte);
        }
        value & self.rec_mask
    }
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("path", &self.path)
            .field("base_data_id", &self.base_data_id)
            .field("key_count", &self.key_count)
            .field("bucket_count", &self.bucket_count)
            .field("enums", &self.offset_ef.is_some())
            .finish_non_exhaustive()
    }
}

/// Hashes a key into its (bucket selector, fingerprint) pair.
pub fn hash_key_with_salt(key: &[u8], salt: u32) -> (u64, u64) {
    let hash = murmur3::murmur3_x64_128(&mut &key[..], salt)
        .expect("hashing an in-memory slice cannot fail");
    ((hash >> 64) as u64, hash as u64)
}

/// Maps a uniform `u64` onto `[0, n)` without division.
pub fn remap(x: u64, n: u64) -> u64 {
    ((x as u128 * n as u128) >> 64) as u64
}

/// Maps a uniform `u64` onto `[0, n)` for small `n`.
pub fn remap16(x: u64, n: u16) -> u16 {
    (((x >> 32) * n as u64) >> 32) as u16
}

/// Mixing finalizer applied to fingerprint-plus-seed sums.
pub fn remix(mut z: u64) -> u64 {
    z ^= z >> 33;
    z = z.wrapping_mul(0xff51afd7ed558ccd);
    z ^= z >> 33;
    z = z.wrapping_mul(0xc4ceb9fe1a85ec53);
    z ^= z >> 33;
    z
}

#[cfg(test)]
mod tests {
    use super::{remap, remap16, remix};

    #[test]
    fn remap_is_bounded() {
        for x in [0u64, 1, u64::MAX / 2, u64::MAX] {
            assert!(remap(x, 7) < 7);
            assert!(remap16(remix(x), 100) < 100);
        }
        assert_eq!(remap(u64::MAX, 1), 0);
        assert_eq!(remap16(remix(12345), 1), 0);
    }
}
