pub mod block;
pub mod filter_block;
pub mod format;

use std::cmp::Ordering;
use std::sync::Arc;

use crate::cache::Cache;
use crate::db::format::InternalFilterPolicy;
use crate::error::{Error, IResult};
use crate::iterator::{ConcatenateIterator, DerivedIterFactory, Iter};
use crate::options::{CompressionType, Options, ReadOptions};
use crate::sstable::block::{Block, BlockBuilder, BlockIterator};
use crate::sstable::filter_block::{FilterBlockBuilder, FilterBlockReader};
use crate::sstable::format::{
    compress_block, read_block, write_raw_block, BlockHandle, Footer, FOOTER_ENCODED_LENGTH,
};
use crate::storage::File;
use crate::util::coding::put_fixed_64;
use crate::util::comparator::{BytewiseComparator, Comparator};

/// A table ("SST") is an immutable sorted file of internal keys:
///
/// ```text
///     +--------------+-----+--------------+--------------+
///     | data block 0 | ... | data block n | filter block |  <- optional
///     +--------------+-----+--------------+--------------+
///     | metaindex block | index block | footer (48 bytes) |
///     +-----------------+-------------+-------------------+
/// ```
///
/// Every block is followed by a 5-byte trailer with its compression type
/// and masked crc32c. The index block maps shortened separator keys to
/// the `BlockHandle` of each data block; the metaindex maps
/// `"filter.<policy>"` to the filter block's handle; the footer locates
/// both and ends with the table magic.
///
/// Builds a table file from entries added in strictly increasing
/// internal-key order.
pub struct TableBuilder<F: File, C: Comparator> {
    cmp: C,
    file: F,
    offset: u64,
    num_entries: usize,
    closed: bool,
    block_size: usize,
    compression: CompressionType,
    data_block: BlockBuilder<C>,
    index_block: BlockBuilder<C>,
    filter_block: Option<FilterBlockBuilder>,
    filter_policy_name: String,
    last_key: Vec<u8>,
    /// An index entry for the block just flushed is deferred until the
    /// next key arrives, so the separator can be shortened against it.
    pending_index_entry: bool,
    pending_handle: BlockHandle,
}

impl<F: File, C: Comparator> TableBuilder<F, C> {
    pub fn new<UC: Comparator>(file: F, cmp: C, options: &Options<UC>) -> Self {
        let (filter_block, filter_policy_name) = match &options.filter_policy {
            Some(policy) => {
                let mut builder =
                    FilterBlockBuilder::new(Arc::new(InternalFilterPolicy::new(policy.clone())));
                builder.start_block(0);
                (Some(builder), policy.name().to_owned())
            }
            None => (None, String::new()),
        };
        TableBuilder {
            cmp: cmp.clone(),
            file,
            offset: 0,
            num_entries: 0,
            closed: false,
            block_size: options.block_size,
            compression: options.compression,
            data_block: BlockBuilder::new(options.block_restart_interval, cmp.clone()),
            // Restart every entry: index keys are accessed by binary
            // search only.
            index_block: BlockBuilder::new(1, cmp),
            filter_block,
            filter_policy_name,
            last_key: vec![],
            pending_index_entry: false,
            pending_handle: BlockHandle::default(),
        }
    }

    /// Adds an entry. Keys must be strictly increasing under the table's
    /// comparator.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> IResult<()> {
        self.assert_open();
        if self.num_entries > 0 {
            assert_eq!(
                self.cmp.compare(key, &self.last_key),
                Ordering::Greater,
                "keys must be added to a table in strictly increasing order"
            );
        }
        self.maybe_append_index_entry(Some(key));
        if let Some(fb) = self.filter_block.as_mut() {
            fb.add_key(key);
        }
        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.num_entries += 1;
        self.data_block.add(key, value);
        if self.data_block.current_size_estimate() >= self.block_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Flushes the data block under construction, if any.
    pub fn flush(&mut self) -> IResult<()> {
        self.assert_open();
        if self.data_block.is_empty() {
            return Ok(());
        }
        assert!(
            !self.pending_index_entry,
            "a flushed block's index entry must be emitted before the next flush"
        );
        let raw = self.data_block.finish();
        let (compressed, compression) = compress_block(raw, self.compression)?;
        write_raw_block(
            &mut self.file,
            &compressed,
            compression,
            &mut self.pending_handle,
            &mut self.offset,
        )?;
        self.data_block.reset();
        self.pending_index_entry = true;
        self.file.flush()?;
        if let Some(fb) = self.filter_block.as_mut() {
            fb.start_block(self.offset);
        }
        Ok(())
    }

    /// Writes the meta blocks, index block, and footer. `sync` forces
    /// the finished table to stable storage.
    pub fn finish(&mut self, sync: bool) -> IResult<()> {
        self.flush()?;
        self.assert_open();
        self.closed = true;

        // Filter block (never compressed).
        let mut filter_handle = None;
        if let Some(fb) = self.filter_block.as_mut() {
            let data = fb.finish().to_vec();
            let mut handle = BlockHandle::default();
            write_raw_block(
                &mut self.file,
                &data,
                CompressionType::KNoCompression,
                &mut handle,
                &mut self.offset,
            )?;
            filter_handle = Some(handle);
        }

        // Metaindex block. Its keys are plain ascii names, ordered
        // bytewise regardless of the table comparator.
        let mut metaindex_block = BlockBuilder::new(1, BytewiseComparator);
        if let Some(handle) = filter_handle {
            let key = format!("filter.{}", self.filter_policy_name);
            metaindex_block.add(key.as_bytes(), &handle.encoded());
        }
        let mut metaindex_handle = BlockHandle::default();
        let (compressed, compression) = compress_block(metaindex_block.finish(), self.compression)?;
        write_raw_block(
            &mut self.file,
            &compressed,
            compression,
            &mut metaindex_handle,
            &mut self.offset,
        )?;

        // Index block.
        self.maybe_append_index_entry(None);
        let mut index_handle = BlockHandle::default();
        let (compressed, compression) = compress_block(self.index_block.finish(), self.compression)?;
        write_raw_block(
            &mut self.file,
            &compressed,
            compression,
            &mut index_handle,
            &mut self.offset,
        )?;

        // Footer.
        let footer = Footer::new(metaindex_handle, index_handle).encoded();
        self.file.write_all(&footer)?;
        self.offset += footer.len() as u64;
        self.file.flush()?;
        if sync {
            self.file.sync()?;
        }
        Ok(())
    }

    #[inline]
    pub fn num_entries(&self) -> usize {
        self.num_entries
    }

    /// Size of the file generated so far; after a successful `finish`
    /// this is the final file size.
    #[inline]
    pub fn file_size(&self) -> u64 {
        self.offset
    }

    fn assert_open(&self) {
        assert!(!self.closed, "operation on a finished TableBuilder");
    }

    fn maybe_append_index_entry(&mut self, next_key: Option<&[u8]>) {
        if !self.pending_index_entry {
            return;
        }
        debug_assert!(self.data_block.is_empty());
        let separator = match next_key {
            Some(next) => self.cmp.find_shortest_separator(&self.last_key, next),
            None => self.cmp.find_short_successor(&self.last_key),
        };
        self.index_block.add(&separator, &self.pending_handle.encoded());
        self.pending_index_entry = false;
    }
}

/// An open, immutable table file: parsed index, optional filter, and a
/// hook into the block cache. Safe to share across threads.
pub struct Table<F: File> {
    file: F,
    file_number: u64,
    index_block: Block,
    filter_reader: Option<FilterBlockReader>,
    block_cache: Option<Arc<dyn Cache<Vec<u8>, Arc<Block>>>>,
}

impl<F: File> Table<F> {
    /// Opens the table stored in the first `file_size` bytes of `file`.
    pub fn open<UC: Comparator>(
        file: F,
        file_number: u64,
        file_size: u64,
        options: &Options<UC>,
    ) -> IResult<Self> {
        if file_size < FOOTER_ENCODED_LENGTH as u64 {
            return Err(Error::Corruption(
                "file is too short to be an sstable".to_owned(),
            ));
        }
        let mut footer_buf = vec![0; FOOTER_ENCODED_LENGTH];
        file.read_exact_at(&mut footer_buf, file_size - FOOTER_ENCODED_LENGTH as u64)?;
        let footer = Footer::decode_from(&footer_buf)?;

        let index_contents = read_block(&file, &footer.index_handle, options.paranoid_checks)?;
        let index_block = Block::new(index_contents)?;

        let mut table = Table {
            file,
            file_number,
            index_block,
            filter_reader: None,
            block_cache: options.block_cache.clone(),
        };

        // The filter is an optimization: failure to read it degrades
        // point lookups but does not invalidate the table.
        if let Some(policy) = &options.filter_policy {
            if footer.metaindex_handle.size > 0 {
                if let Ok(meta_contents) =
                    read_block(&table.file, &footer.metaindex_handle, options.paranoid_checks)
                {
                    if let Ok(meta_block) = Block::new(meta_contents) {
                        let mut iter = meta_block.iter(BytewiseComparator);
                        let filter_key = format!("filter.{}", policy.name());
                        iter.seek(filter_key.as_bytes());
                        if iter.valid() && iter.key() == filter_key.as_bytes() {
                            if let Ok((handle, _)) = BlockHandle::decode_from(iter.value()) {
                                if let Ok(filter_data) =
                                    read_block(&table.file, &handle, options.paranoid_checks)
                                {
                                    table.filter_reader = Some(FilterBlockReader::new(
                                        Arc::new(InternalFilterPolicy::new(policy.clone())),
                                        filter_data,
                                    ));
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(table)
    }

    /// Produces an iterator over the data block at `handle`, consulting
    /// and populating the block cache.
    fn block_reader<C: Comparator>(
        &self,
        cmp: C,
        handle: BlockHandle,
        options: &ReadOptions,
    ) -> IResult<BlockIterator<C>> {
        let block = match &self.block_cache {
            Some(cache) => {
                let mut cache_key = Vec::with_capacity(16);
                put_fixed_64(&mut cache_key, self.file_number);
                put_fixed_64(&mut cache_key, handle.offset);
                match cache.get(&cache_key) {
                    Some(block) => block,
                    None => {
                        let contents = read_block(&self.file, &handle, options.verify_checksums)?;
                        let charge = contents.len();
                        let block = Arc::new(Block::new(contents)?);
                        if options.fill_cache {
                            cache.insert(cache_key, block.clone(), charge);
                        }
                        block
                    }
                }
            }
            None => {
                let contents = read_block(&self.file, &handle, options.verify_checksums)?;
                Arc::new(Block::new(contents)?)
            }
        };
        Ok(block.iter(cmp))
    }

    /// Seeks the entry with the smallest key >= `key` (an internal key;
    /// `cmp` must order internal keys). Returns the positioned block
    /// iterator, or `None` when the table cannot contain the key.
    pub fn internal_get<C: Comparator>(
        &self,
        options: &ReadOptions,
        cmp: C,
        key: &[u8],
    ) -> IResult<Option<BlockIterator<C>>> {
        let mut index_iter = self.index_block.iter(cmp.clone());
        index_iter.seek(key);
        if !index_iter.valid() {
            index_iter.status()?;
            return Ok(None);
        }
        let handle_bytes = index_iter.value();
        let (handle, _) = BlockHandle::decode_from(handle_bytes)?;
        if let Some(filter) = &self.filter_reader {
            if !filter.key_may_match(handle.offset, key) {
                return Ok(None);
            }
        }
        let mut block_iter = self.block_reader(cmp, handle, options)?;
        block_iter.seek(key);
        if block_iter.valid() {
            return Ok(Some(block_iter));
        }
        block_iter.status()?;
        Ok(None)
    }

    /// An approximate file offset where the data for `key` begins (or
    /// would begin). Includes compression effects, since it is a
    /// physical offset.
    pub fn approximate_offset_of<C: Comparator>(&self, cmp: C, key: &[u8]) -> u64 {
        let mut index_iter = self.index_block.iter(cmp);
        index_iter.seek(key);
        if index_iter.valid() {
            if let Ok((handle, _)) = BlockHandle::decode_from(index_iter.value()) {
                return handle.offset;
            }
        }
        // Past the last key: everything but the fixed tail.
        self.file_size_hint()
    }

    fn file_size_hint(&self) -> u64 {
        self.file.len().unwrap_or(0)
    }
}

/// Derives data-block iterators from index-block values.
pub struct TableIterFactory<C: Comparator, F: File> {
    table: Arc<Table<F>>,
    cmp: C,
    options: ReadOptions,
}

impl<C: Comparator, F: File> DerivedIterFactory for TableIterFactory<C, F> {
    type Iter = BlockIterator<C>;

    fn derive(&self, value: &[u8]) -> IResult<Self::Iter> {
        let (handle, _) = BlockHandle::decode_from(value)?;
        self.table
            .block_reader(self.cmp.clone(), handle, &self.options)
    }
}

pub type TableIterator<C, F> = ConcatenateIterator<BlockIterator<C>, TableIterFactory<C, F>>;

/// An iterator over every entry of `table`, in key order.
pub fn new_table_iterator<C: Comparator, F: File>(
    cmp: C,
    table: Arc<Table<F>>,
    options: ReadOptions,
) -> TableIterator<C, F> {
    let index_iter = table.index_block.iter(cmp.clone());
    ConcatenateIterator::new(
        index_iter,
        TableIterFactory {
            table,
            cmp,
            options,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::lru::LRUCache;
    use crate::filter::bloom::BloomFilter;
    use crate::storage::mem::MemStorage;
    use crate::storage::Storage;
    use crate::util::comparator::BytewiseComparator;

    fn test_options() -> Options<BytewiseComparator> {
        Options {
            // Small blocks force multi-block tables in tests.
            block_size: 64,
            compression: CompressionType::KNoCompression,
            ..Default::default()
        }
    }

    fn build_table(
        storage: &MemStorage,
        name: &str,
        options: &Options<BytewiseComparator>,
        entries: &[(Vec<u8>, Vec<u8>)],
    ) -> u64 {
        let file = storage.create(name).unwrap();
        let mut builder = TableBuilder::new(file, BytewiseComparator, options);
        for (k, v) in entries {
            builder.add(k, v).unwrap();
        }
        builder.finish(false).unwrap();
        builder.file_size()
    }

    fn entries(n: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
        (0..n)
            .map(|i| {
                (
                    format!("key{:05}", i).into_bytes(),
                    format!("value{:05}", i).into_bytes(),
                )
            })
            .collect()
    }

    fn open_table(
        storage: &MemStorage,
        name: &str,
        options: &Options<BytewiseComparator>,
        size: u64,
    ) -> Table<crate::storage::mem::MemFile> {
        let file = storage.open(name).unwrap();
        Table::open(file, 1, size, options).unwrap()
    }

    #[test]
    fn test_empty_table() {
        let storage = MemStorage::new();
        let options = test_options();
        let size = build_table(&storage, "t", &options, &[]);
        let table = open_table(&storage, "t", &options, size);
        assert!(table
            .internal_get(&ReadOptions::default(), BytewiseComparator, b"any")
            .unwrap()
            .is_none());
        let mut iter = new_table_iterator(BytewiseComparator, Arc::new(table), ReadOptions::default());
        iter.seek_to_first();
        assert!(!iter.valid());
    }

    #[test]
    fn test_build_and_scan() {
        let storage = MemStorage::new();
        let options = test_options();
        let data = entries(500);
        let size = build_table(&storage, "t", &options, &data);
        let table = Arc::new(open_table(&storage, "t", &options, size));
        let mut iter = new_table_iterator(BytewiseComparator, table, ReadOptions::default());
        iter.seek_to_first();
        for (k, v) in &data {
            assert!(iter.valid());
            assert_eq!(iter.key(), k.as_slice());
            assert_eq!(iter.value(), v.as_slice());
            iter.next();
        }
        assert!(!iter.valid());
        iter.status().unwrap();
    }

    #[test]
    fn test_reverse_scan_matches_forward() {
        let storage = MemStorage::new();
        let options = test_options();
        let data = entries(123);
        let size = build_table(&storage, "t", &options, &data);
        let table = Arc::new(open_table(&storage, "t", &options, size));
        let mut iter = new_table_iterator(BytewiseComparator, table, ReadOptions::default());
        iter.seek_to_last();
        let mut got = vec![];
        while iter.valid() {
            got.push((iter.key().to_vec(), iter.value().to_vec()));
            iter.prev();
        }
        got.reverse();
        assert_eq!(got, data);
    }

    #[test]
    fn test_point_lookup() {
        let storage = MemStorage::new();
        let options = test_options();
        let data = entries(300);
        let size = build_table(&storage, "t", &options, &data);
        let table = open_table(&storage, "t", &options, size);
        let read_opts = ReadOptions {
            verify_checksums: true,
            ..Default::default()
        };
        for (k, v) in data.iter().step_by(17) {
            let iter = table
                .internal_get(&read_opts, BytewiseComparator, k)
                .unwrap()
                .unwrap();
            assert_eq!(iter.key(), k.as_slice());
            assert_eq!(iter.value(), v.as_slice());
        }
        // A seek between keys lands on the successor.
        let iter = table
            .internal_get(&read_opts, BytewiseComparator, b"key00010a")
            .unwrap()
            .unwrap();
        assert_eq!(iter.key(), b"key00011");
        // Past the end.
        assert!(table
            .internal_get(&read_opts, BytewiseComparator, b"zzz")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_compressed_table_roundtrip() {
        let storage = MemStorage::new();
        for compression in [
            CompressionType::KSnappyCompression,
            CompressionType::KZstdCompression,
            CompressionType::KZlibRawCompression,
        ] {
            let mut options = test_options();
            options.compression = compression;
            options.block_size = 1024;
            let data: Vec<(Vec<u8>, Vec<u8>)> = (0..200usize)
                .map(|i| {
                    (
                        format!("key{:05}", i).into_bytes(),
                        b"a repetitive compressible value".repeat(4),
                    )
                })
                .collect();
            let size = build_table(&storage, "t", &options, &data);
            let table = Arc::new(open_table(&storage, "t", &options, size));
            let read_opts = ReadOptions {
                verify_checksums: true,
                ..Default::default()
            };
            let mut iter = new_table_iterator(BytewiseComparator, table, read_opts);
            iter.seek_to_first();
            let mut count = 0;
            while iter.valid() {
                count += 1;
                iter.next();
            }
            assert_eq!(count, data.len(), "{:?}", compression);
        }
    }

    #[test]
    fn test_filter_block_round_trip() {
        let storage = MemStorage::new();
        let mut options = test_options();
        options.filter_policy = Some(Arc::new(BloomFilter::new(10)));
        // Internal-key comparator context: use plain keys with a fake
        // 8-byte tail so the internal filter policy can strip it.
        let data: Vec<(Vec<u8>, Vec<u8>)> = (0..100usize)
            .map(|i| {
                let mut key = format!("key{:05}", i).into_bytes();
                key.extend_from_slice(&(1u64 << 8 | 1).to_le_bytes());
                (key, b"v".to_vec())
            })
            .collect();
        let size = build_table(&storage, "t", &options, &data);
        let table = open_table(&storage, "t", &options, size);
        assert!(table.filter_reader.is_some());
        let read_opts = ReadOptions::default();
        for (k, _) in data.iter().step_by(9) {
            assert!(table
                .internal_get(&read_opts, BytewiseComparator, k)
                .unwrap()
                .is_some());
        }
        // A key that was never added is rejected by the filter.
        let mut missing = b"key99999".to_vec();
        missing.extend_from_slice(&(1u64 << 8 | 1).to_le_bytes());
        assert!(table
            .internal_get(&read_opts, BytewiseComparator, &missing)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_block_cache_is_consulted() {
        let storage = MemStorage::new();
        let mut options = test_options();
        let cache: Arc<LRUCache<Vec<u8>, Arc<Block>>> = Arc::new(LRUCache::new(1 << 20));
        options.block_cache = Some(cache.clone());
        let data = entries(100);
        let size = build_table(&storage, "t", &options, &data);
        let table = open_table(&storage, "t", &options, size);
        assert_eq!(cache.total_charge(), 0);
        table
            .internal_get(&ReadOptions::default(), BytewiseComparator, b"key00050")
            .unwrap()
            .unwrap();
        let after_first = cache.total_charge();
        assert!(after_first > 0);
        // The same lookup again hits the cache, adding nothing.
        table
            .internal_get(&ReadOptions::default(), BytewiseComparator, b"key00050")
            .unwrap()
            .unwrap();
        assert_eq!(cache.total_charge(), after_first);
    }

    #[test]
    fn test_truncated_file_is_corruption() {
        let storage = MemStorage::new();
        let options = test_options();
        let size = build_table(&storage, "t", &options, &entries(10));
        let file = storage.open("t").unwrap();
        assert!(matches!(
            Table::open(file, 1, 10, &options),
            Err(Error::Corruption(_))
        ));
        // A wrong size that still covers a footer-sized tail fails on
        // the magic check.
        let file = storage.open("t").unwrap();
        assert!(Table::open(file, 1, size - 3, &options).is_err());
    }

    #[test]
    fn test_approximate_offsets_are_monotonic() {
        let storage = MemStorage::new();
        let options = test_options();
        let data = entries(400);
        let size = build_table(&storage, "t", &options, &data);
        let table = open_table(&storage, "t", &options, size);
        let first = table.approximate_offset_of(BytewiseComparator, b"key00000");
        let mid = table.approximate_offset_of(BytewiseComparator, b"key00200");
        let last = table.approximate_offset_of(BytewiseComparator, b"zzz");
        assert!(first <= mid);
        assert!(mid < last);
        assert!(last <= size);
    }
}
