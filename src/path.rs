//! Snapshot file naming.
//!
//! Segments and indices share one naming scheme:
//! `<version>-<from>-<to>-<kind>.<ext>`, e.g. `v1-000500-001000-bodies.seg`.
//! `from` and `to` are block numbers in thousands, left-padded to six
//! digits; the covered span is `[from, to)` in raw block numbers.

use std::{
    fmt,
    path::{Path, PathBuf},
};

/// Current snapshot format version.
pub const SNAPSHOT_V1: u8 = 1;

/// Scaling applied to block numbers in file names.
const BLOCKS_PER_FILE_UNIT: u64 = 1_000;

/// Extension of segment files.
pub const SEGMENT_EXT: &str = "seg";
/// Extension of index files.
pub const INDEX_EXT: &str = "idx";

/// What a snapshot file contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SnapshotType {
    Headers,
    Bodies,
    Transactions,
    /// Auxiliary transaction index mapping tx hash to block number.
    /// Only exists as an `.idx` file next to a transactions segment.
    Transactions2Block,
}

impl SnapshotType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotType::Headers => "headers",
            SnapshotType::Bodies => "bodies",
            SnapshotType::Transactions => "transactions",
            SnapshotType::Transactions2Block => "transactions2block",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "headers" => Some(SnapshotType::Headers),
            "bodies" => Some(SnapshotType::Bodies),
            "transactions" => Some(SnapshotType::Transactions),
            "transactions2block" => Some(SnapshotType::Transactions2Block),
            _ => None,
        }
    }
}

impl fmt::Display for SnapshotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid snapshot file name: {name}")]
pub struct SnapshotPathError {
    pub name: String,
}

/// A parsed snapshot file path: location plus the metadata carried by the
/// file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotPath {
    path: PathBuf,
    version: u8,
    block_from: u64,
    block_to: u64,
    kind: SnapshotType,
}

impl SnapshotPath {
    /// Builds the segment path for the given range and kind inside `dir`.
    pub fn from(
        dir: &Path,
        version: u8,
        block_from: u64,
        block_to: u64,
        kind: SnapshotType,
    ) -> Self {
        let name = Self::file_name(version, block_from, block_to, kind, SEGMENT_EXT);
        SnapshotPath {
            path: dir.join(name),
            version,
            block_from,
            block_to,
            kind,
        }
    }

    /// Parses a snapshot file path, segment or index.
    pub fn parse(path: &Path) -> Result<Self, SnapshotPathError> {
        let err = || SnapshotPathError {
            name: path.display().to_string(),
        };

        let file_name = path.file_name().and_then(|n| n.to_str()).ok_or_else(err)?;
        let (stem, ext) = file_name.split_once('.').ok_or_else(err)?;
        if ext != SEGMENT_EXT && ext != INDEX_EXT {
            return Err(err());
        }

        let parts = stem.split('-').collect::<Vec<_>>();
        if parts.len() != 4 {
            return Err(err());
        }

        let version = parts[0]
            .strip_prefix('v')
            .and_then(|v| v.parse::<u8>().ok())
            .ok_or_else(err)?;
        let block_from = parts[1].parse::<u64>().map_err(|_| err())?;
        let block_to = parts[2].parse::<u64>().map_err(|_| err())?;
        if block_to < block_from {
            return Err(err());
        }
        let kind = SnapshotType::from_str(parts[3]).ok_or_else(err)?;

        Ok(SnapshotPath {
            path: path.to_path_buf(),
            version,
            block_from: block_from * BLOCKS_PER_FILE_UNIT,
            block_to: block_to * BLOCKS_PER_FILE_UNIT,
            kind,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    /// First block covered by the file.
    pub fn block_from(&self) -> u64 {
        self.block_from
    }

    /// One past the last block covered by the file.
    pub fn block_to(&self) -> u64 {
        self.block_to
    }

    pub fn kind(&self) -> SnapshotType {
        self.kind
    }

    /// Path of the natural companion index for this segment.
    pub fn index_file(&self) -> SnapshotPath {
        self.index_file_for_type(self.kind)
    }

    /// Path of a sibling index of a different kind, e.g. the tx-to-block
    /// index next to a transactions segment.
    pub fn index_file_for_type(&self, kind: SnapshotType) -> SnapshotPath {
        let dir = self.path.parent().unwrap_or_else(|| Path::new(""));
        let name = Self::file_name(self.version, self.block_from, self.block_to, kind, INDEX_EXT);
        SnapshotPath {
            path: dir.join(name),
            version: self.version,
            block_from: self.block_from,
            block_to: self.block_to,
            kind,
        }
    }

    fn file_name(version: u8, block_from: u64, block_to: u64, kind: SnapshotType, ext: &str) -> String {
        format!(
            "v{}-{:06}-{:06}-{}.{}",
            version,
            block_from / BLOCKS_PER_FILE_UNIT,
            block_to / BLOCKS_PER_FILE_UNIT,
            kind,
            ext
        )
    }
}
