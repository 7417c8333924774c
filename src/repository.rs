//! Read-only registry over a directory of snapshot files.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::{
    error::SnapshotError,
    path::{SnapshotPath, SnapshotType, SEGMENT_EXT},
    snapshot::{BodySnapshot, HeaderSnapshot, TransactionSnapshot},
    types::BlockNum,
};

/// Opens every segment found in a directory and serves per-kind views by
/// block number.
///
/// Callers wanting parallel scans can do so at segment granularity: each
/// view borrows an independently mapped file.
#[derive(Debug)]
pub struct SnapshotRepository {
    dir: PathBuf,
    header_segments: Vec<HeaderSnapshot>,
    body_segments: Vec<BodySnapshot>,
    txn_segments: Vec<TransactionSnapshot>,
}

impl SnapshotRepository {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        SnapshotRepository {
            dir: dir.into(),
            header_segments: Vec::new(),
            body_segments: Vec::new(),
            txn_segments: Vec::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Rescans the directory, reopening every segment and its indices.
    /// Files whose names do not parse are skipped with a warning.
    pub fn reopen_folder(&mut self) -> Result<(), SnapshotError> {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXT) {
                continue;
            }
            match SnapshotPath::parse(&path) {
                Ok(parsed) => paths.push(parsed),
                Err(err) => warn!(%err, "skipping unrecognized snapshot file"),
            }
        }
        paths.sort_by_key(|p| (p.block_from(), p.block_to()));

        let mut header_segments = Vec::new();
        let mut body_segments = Vec::new();
        let mut txn_segments = Vec::new();
        for path in paths {
            match path.kind() {
                SnapshotType::Headers => {
                    let mut snapshot = HeaderSnapshot::new(path);
                    snapshot.reopen_segment()?;
                    snapshot.reopen_index()?;
                    header_segments.push(snapshot);
                }
                SnapshotType::Bodies => {
                    let mut snapshot = BodySnapshot::new(path);
                    snapshot.reopen_segment()?;
                    snapshot.reopen_index()?;
                    body_segments.push(snapshot);
                }
                SnapshotType::Transactions => {
                    let mut snapshot = TransactionSnapshot::new(path);
                    snapshot.reopen_segment()?;
                    snapshot.reopen_index()?;
                    txn_segments.push(snapshot);
                }
                SnapshotType::Transactions2Block => {
                    warn!(path = %path.path().display(), "segment with an index-only kind, skipping");
                }
            }
        }

        self.header_segments = header_segments;
        self.body_segments = body_segments;
        self.txn_segments = txn_segments;

        info!(
            dir = %self.dir.display(),
            headers = self.header_segments.len(),
            bodies = self.body_segments.len(),
            transactions = self.txn_segments.len(),
            "reopened snapshot folder"
        );
        Ok(())
    }

    /// Drops every open segment and index.
    pub fn close(&mut self) {
        self.header_segments.clear();
        self.body_segments.clear();
        self.txn_segments.clear();
    }

    pub fn header_segments(&self) -> &[HeaderSnapshot] {
        &self.header_segments
    }

    pub fn body_segments(&self) -> &[BodySnapshot] {
        &self.body_segments
    }

    pub fn txn_segments(&self) -> &[TransactionSnapshot] {
        &self.txn_segments
    }

    /// Header segment covering the given block, if any.
    pub fn view_header_segment(&self, block_num: BlockNum) -> Option<&HeaderSnapshot> {
        self.header_segments
            .iter()
            .find(|s| s.block_from() <= block_num && block_num < s.block_to())
    }

    /// Body segment covering the given block, if any.
    pub fn view_body_segment(&self, block_num: BlockNum) -> Option<&BodySnapshot> {
        self.body_segments
            .iter()
            .find(|s| s.block_from() <= block_num && block_num < s.block_to())
    }

    /// Transaction segment covering the given block, if any.
    pub fn view_txn_segment(&self, block_num: BlockNum) -> Option<&TransactionSnapshot> {
        self.txn_segments
            .iter()
            .find(|s| s.block_from() <= block_num && block_num < s.block_to())
    }

    /// Highest block number up to which all three kinds are contiguously
    /// available from block zero, or `None` when any kind has a gap at the
    /// start.
    pub fn max_block_available(&self) -> Option<BlockNum> {
        let headers =
            Self::contiguous_to(self.header_segments.iter().map(|s| (s.block_from(), s.block_to())))?;
        let bodies =
            Self::contiguous_to(self.body_segments.iter().map(|s| (s.block_from(), s.block_to())))?;
        let txs =
            Self::contiguous_to(self.txn_segments.iter().map(|s| (s.block_from(), s.block_to())))?;
        Some(headers.min(bodies).min(txs).saturating_sub(1))
    }

    fn contiguous_to(ranges: impl Iterator<Item = (BlockNum, BlockNum)>) -> Option<BlockNum> {
        let mut covered_to = 0;
        for (from, to) in ranges {
            if from > covered_to {
                break;
            }
            covered_to = covered_to.max(to);
        }
        if covered_to == 0 {
            None
        } else {
            Some(covered_to)
        }
    }
}
