//! Read path of an immutable, content-addressed chain snapshot store.
//!
//! Historical block headers, block bodies and transactions are stored in
//! compressed, append-only *segment* files, each accompanied by one or more
//! minimal-perfect-hash *index* files mapping domain keys (block number,
//! block hash, transaction id, transaction hash) to byte offsets inside the
//! segment.
//!
//! The crate is organized in three layers:
//!
//! - [`decompress`]: a memory-mapped segment exposed as a lazy sequence of
//!   variable-length words, resumable from any recorded word-start offset.
//! - [`index`]: a static RecSplit minimal-perfect-hash structure answering
//!   `key -> ordinal` and `ordinal -> offset` queries.
//! - [`snapshot`]: the typed layer interpreting decoded words as headers,
//!   bodies and transactions, and translating domain queries into segment
//!   offset reads through the indices.
//!
//! Everything is read-only: producing segments and indices is the job of an
//! external packer. A snapshot whose index is missing or older than its
//! segment degrades to sequential-scan-only mode, which is the signal for
//! the packer to rebuild the index.

pub mod decompress;
pub mod elias_fano;
pub mod error;
pub mod golomb_rice;
pub mod index;
pub mod path;
pub mod repository;
pub mod snapshot;
pub mod types;

pub use error::SnapshotError;
pub use path::{SnapshotPath, SnapshotType};
pub use repository::SnapshotRepository;
pub use snapshot::{BodySnapshot, HeaderSnapshot, Snapshot, TransactionSnapshot, WordItem};
pub use types::{BlockBodyForStorage, BlockNum, Header, Transaction};
