use std::sync::Arc;

use crate::cache::Cache;
use crate::db::format::{L0_COMPACTION_TRIGGER, NUM_LEVELS};
use crate::filter::FilterPolicy;
use crate::snapshot::Snapshot;
use crate::sstable::block::Block;
use crate::util::comparator::Comparator;

/// Per-block compression codec, stored in the 1-byte block trailer.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    KNoCompression = 0x0,
    KSnappyCompression = 0x1,
    KZstdCompression = 0x2,
    KZlibRawCompression = 0x3,
    Unknown,
}

impl From<u8> for CompressionType {
    fn from(v: u8) -> Self {
        match v {
            0x0 => CompressionType::KNoCompression,
            0x1 => CompressionType::KSnappyCompression,
            0x2 => CompressionType::KZstdCompression,
            0x3 => CompressionType::KZlibRawCompression,
            _ => CompressionType::Unknown,
        }
    }
}

/// Options controlling the behavior of a database. The comparator is a
/// type parameter rather than a boxed trait object because it is consulted
/// on every key operation in every layer.
#[derive(Clone)]
pub struct Options<C: Comparator> {
    /// Comparator defining the order of user keys. Must match the name
    /// recorded in the manifest of an existing database.
    pub comparator: C,

    /// Create the database directory and manifest if missing.
    pub create_if_missing: bool,

    /// Fail `open` if the database already exists.
    pub error_if_exists: bool,

    /// Treat recoverable corruption (e.g. a torn WAL tail) as an error
    /// instead of skipping it, and verify table blocks aggressively.
    pub paranoid_checks: bool,

    /// Amount of data to build up in the memtable before it is rotated
    /// and flushed to a level-0 table.
    pub write_buffer_size: usize,

    /// Maximum number of open files the table cache may pin.
    pub max_open_files: usize,

    /// If set, tables get a filter block and point reads consult it.
    pub filter_policy: Option<Arc<dyn FilterPolicy>>,

    /// If set, decoded data blocks are cached here across reads.
    pub block_cache: Option<Arc<dyn Cache<Vec<u8>, Arc<Block>>>>,

    /// Approximate uncompressed size of a table data block.
    pub block_size: usize,

    /// Number of keys between restart points in a data block.
    pub block_restart_interval: u32,

    /// Compaction rolls its output table once it reaches this size.
    pub max_file_size: u64,

    pub compression: CompressionType,

    /// On recovery, append to the previous WAL and keep its memtable
    /// instead of flushing and switching files.
    pub reuse_logs: bool,
}

impl<C: Comparator + Default> Default for Options<C> {
    fn default() -> Self {
        Options {
            comparator: C::default(),
            create_if_missing: true,
            error_if_exists: false,
            paranoid_checks: false,
            write_buffer_size: 4 * 1024 * 1024,
            max_open_files: 1000,
            filter_policy: None,
            block_cache: None,
            block_size: 4 * 1024,
            block_restart_interval: 16,
            max_file_size: 2 * 1024 * 1024,
            compression: CompressionType::KSnappyCompression,
            reuse_logs: false,
        }
    }
}

impl<C: Comparator> Options<C> {
    /// The table cache keeps a margin of descriptors free for the WAL,
    /// manifest, and sundry files.
    #[inline]
    pub fn table_cache_size(&self) -> usize {
        self.max_open_files.saturating_sub(10).max(1)
    }

    /// Byte budget for a level: level 1 holds 10MiB, each further level
    /// ten times its parent. Level 0 is scored by file count instead
    /// (see `L0_COMPACTION_TRIGGER`).
    pub fn max_bytes_for_level(&self, mut level: usize) -> f64 {
        let mut result = 10.0 * 1048576.0;
        while level > 1 {
            result *= 10.0;
            level -= 1;
        }
        result
    }

    /// Maximum bytes of level+2 ("grandparent") overlap an output table
    /// may accumulate before it is rolled.
    #[inline]
    pub fn max_grandparent_overlap_bytes(&self) -> u64 {
        10 * self.max_file_size
    }

    /// Cap on the total bytes a compaction may grow to when expanding its
    /// level-L input set.
    #[inline]
    pub fn expanded_compaction_byte_size_limit(&self) -> u64 {
        25 * self.max_file_size
    }

    #[inline]
    pub fn l0_compaction_trigger(&self) -> usize {
        L0_COMPACTION_TRIGGER
    }

    #[inline]
    pub fn max_levels(&self) -> usize {
        NUM_LEVELS
    }
}

/// Options for read operations.
#[derive(Clone)]
pub struct ReadOptions {
    /// Verify block checksums on every read.
    pub verify_checksums: bool,

    /// Whether blocks read for this operation should populate the block
    /// cache. Bulk scans typically turn this off.
    pub fill_cache: bool,

    /// Read as of this snapshot instead of the latest committed state.
    pub snapshot: Option<Arc<Snapshot>>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        ReadOptions {
            verify_checksums: false,
            fill_cache: true,
            snapshot: None,
        }
    }
}

/// Options for write operations.
#[derive(Clone, Copy, Default)]
pub struct WriteOptions {
    /// fsync the WAL before acknowledging the write. A machine crash can
    /// lose un-synced writes; a process crash cannot.
    pub sync: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::comparator::BytewiseComparator;

    #[test]
    fn test_level_targets_grow_tenfold() {
        let opts = Options::<BytewiseComparator>::default();
        assert_eq!(opts.max_bytes_for_level(1) as u64, 10 << 20);
        assert_eq!(opts.max_bytes_for_level(2) as u64, 100 << 20);
        assert_eq!(opts.max_bytes_for_level(3) as u64, 1000 << 20);
    }

    #[test]
    fn test_compression_type_from_u8() {
        for t in [
            CompressionType::KNoCompression,
            CompressionType::KSnappyCompression,
            CompressionType::KZstdCompression,
            CompressionType::KZlibRawCompression,
        ] {
            assert_eq!(CompressionType::from(t as u8), t);
        }
        assert_eq!(CompressionType::from(0x2f), CompressionType::Unknown);
    }
}
