//! An embedded, ordered key/value store with a log-structured
//! merge-tree engine.
//!
//! Keys and values are opaque byte strings. The store offers point
//! lookups, ordered iteration, snapshot reads, atomic batched writes,
//! and durable crash recovery over a single local directory:
//!
//! ```no_run
//! use siltdb::{BytewiseComparator, Options, ReadOptions, SiltDB, WriteOptions};
//! use siltdb::storage::file::FileStorage;
//!
//! let options = Options::<BytewiseComparator>::default();
//! let db = SiltDB::open("/tmp/demo-db", options, FileStorage).unwrap();
//! db.put(WriteOptions::default(), b"landing", b"zone").unwrap();
//! assert_eq!(
//!     db.get(ReadOptions::default(), b"landing").unwrap(),
//!     Some(b"zone".to_vec())
//! );
//! ```
//!
//! Writes flow through a WAL and an in-memory table; filled memtables
//! are flushed to immutable sorted tables which a single background
//! thread merges down a 7-level tree. The `version` module tracks which
//! tables are live; the manifest journal makes that state durable.

mod batch;
mod compaction;
mod error;
mod options;
mod snapshot;
mod table_cache;

pub mod cache;
pub mod db;
pub mod filter;
pub mod iterator;
pub mod mem;
pub mod sstable;
pub mod storage;
pub mod util;
pub mod version;
pub mod wal;

pub use batch::{BatchEntry, WriteBatch};
pub use db::{destroy_db, repair_db, SiltDB, SiltDBIterator};
pub use error::{Error, IResult};
pub use filter::bloom::BloomFilter;
pub use filter::FilterPolicy;
pub use iterator::Iter;
pub use options::{CompressionType, Options, ReadOptions, WriteOptions};
pub use snapshot::Snapshot;
pub use util::comparator::{BytewiseComparator, Comparator};
