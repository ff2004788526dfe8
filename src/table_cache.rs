use std::sync::Arc;

use crate::cache::lru::LRUCache;
use crate::cache::Cache;
use crate::db::filename::{generate_filename, generate_legacy_table_filename, FileType};
use crate::error::{Error, IResult};
use crate::options::{Options, ReadOptions};
use crate::sstable::block::BlockIterator;
use crate::sstable::{new_table_iterator, Table, TableIterator};
use crate::storage::Storage;
use crate::util::comparator::Comparator;

/// A bounded map from file number to open table handle (descriptor plus
/// parsed index and filter). Entry count is capped by
/// `max_open_files - 10`; eviction closes the file.
pub struct TableCache<S: Storage + Clone, C: Comparator> {
    storage: S,
    db_path: String,
    options: Options<C>,
    cache: Arc<LRUCache<u64, Arc<Table<S::F>>>>,
}

impl<S: Storage + Clone, C: Comparator + 'static> TableCache<S, C> {
    pub fn new(db_path: String, options: Options<C>, storage: S) -> Self {
        let cache = Arc::new(LRUCache::new(options.table_cache_size()));
        TableCache {
            storage,
            db_path,
            options,
            cache,
        }
    }

    /// Returns the open table for `file_number`, opening and caching it
    /// on a miss. Accepts tables with the legacy extension.
    pub fn find_table(&self, file_number: u64, file_size: u64) -> IResult<Arc<Table<S::F>>> {
        if let Some(table) = self.cache.get(&file_number) {
            return Ok(table);
        }
        let filename = generate_filename(&self.db_path, FileType::Table, file_number);
        let file = match self.storage.open(&filename) {
            Ok(f) => f,
            Err(Error::NotFound) => {
                let legacy = generate_legacy_table_filename(&self.db_path, file_number);
                self.storage.open(legacy)?
            }
            Err(e) => return Err(e),
        };
        let table = Arc::new(Table::open(file, file_number, file_size, &self.options)?);
        self.cache.insert(file_number, table.clone(), 1);
        Ok(table)
    }

    /// Point-seeks `key` (an internal key) inside the given table.
    pub fn get<TC: Comparator>(
        &self,
        cmp: TC,
        options: &ReadOptions,
        key: &[u8],
        file_number: u64,
        file_size: u64,
    ) -> IResult<Option<BlockIterator<TC>>> {
        let table = self.find_table(file_number, file_size)?;
        table.internal_get(options, cmp, key)
    }

    /// An iterator over the whole table `file_number` (whose length must
    /// be exactly `file_size`). The handle stays pinned by the iterator.
    pub fn new_iter<TC: Comparator>(
        &self,
        cmp: TC,
        options: ReadOptions,
        file_number: u64,
        file_size: u64,
    ) -> IResult<TableIterator<TC, S::F>> {
        let table = self.find_table(file_number, file_size)?;
        Ok(new_table_iterator(cmp, table, options))
    }

    /// Drops the cached handle for a deleted table.
    pub fn evict(&self, file_number: u64) {
        self.cache.erase(&file_number);
    }
}

impl<S: Storage + Clone, C: Comparator> Clone for TableCache<S, C> {
    fn clone(&self) -> Self {
        TableCache {
            storage: self.storage.clone(),
            db_path: self.db_path.clone(),
            options: self.options.clone(),
            cache: self.cache.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iterator::Iter;
    use crate::sstable::TableBuilder;
    use crate::storage::mem::MemStorage;
    use crate::util::comparator::BytewiseComparator;

    fn build_table(storage: &MemStorage, number: u64, legacy: bool) -> u64 {
        let options = Options::<BytewiseComparator>::default();
        let name = if legacy {
            generate_legacy_table_filename("db", number)
        } else {
            generate_filename("db", FileType::Table, number)
        };
        let file = storage.create(name).unwrap();
        let mut builder = TableBuilder::new(file, BytewiseComparator, &options);
        builder.add(b"alpha", b"1").unwrap();
        builder.add(b"beta", b"2").unwrap();
        builder.finish(false).unwrap();
        builder.file_size()
    }

    fn new_cache(storage: &MemStorage) -> TableCache<MemStorage, BytewiseComparator> {
        TableCache::new(
            "db".to_owned(),
            Options::<BytewiseComparator>::default(),
            storage.clone(),
        )
    }

    #[test]
    fn test_find_and_get() {
        let storage = MemStorage::new();
        let size = build_table(&storage, 5, false);
        let cache = new_cache(&storage);
        let iter = cache
            .get(BytewiseComparator, &ReadOptions::default(), b"beta", 5, size)
            .unwrap()
            .unwrap();
        assert_eq!(iter.value(), b"2");
        // Second find returns the cached handle.
        let t1 = cache.find_table(5, size).unwrap();
        let t2 = cache.find_table(5, size).unwrap();
        assert!(Arc::ptr_eq(&t1, &t2));
    }

    #[test]
    fn test_legacy_extension_fallback() {
        let storage = MemStorage::new();
        let size = build_table(&storage, 7, true);
        let cache = new_cache(&storage);
        assert!(cache.find_table(7, size).is_ok());
    }

    #[test]
    fn test_missing_table_is_not_found() {
        let storage = MemStorage::new();
        let cache = new_cache(&storage);
        assert!(matches!(cache.find_table(99, 100), Err(Error::NotFound)));
    }

    #[test]
    fn test_evict_reopens() {
        let storage = MemStorage::new();
        let size = build_table(&storage, 5, false);
        let cache = new_cache(&storage);
        let t1 = cache.find_table(5, size).unwrap();
        cache.evict(5);
        let t2 = cache.find_table(5, size).unwrap();
        assert!(!Arc::ptr_eq(&t1, &t2));
    }

    #[test]
    fn test_whole_table_iterator() {
        let storage = MemStorage::new();
        let size = build_table(&storage, 3, false);
        let cache = new_cache(&storage);
        let mut iter = cache
            .new_iter(BytewiseComparator, ReadOptions::default(), 3, size)
            .unwrap();
        iter.seek_to_first();
        let mut keys = vec![];
        while iter.valid() {
            keys.push(iter.key().to_vec());
            iter.next();
        }
        assert_eq!(keys, vec![b"alpha".to_vec(), b"beta".to_vec()]);
    }
}
