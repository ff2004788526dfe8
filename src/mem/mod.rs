pub mod arena;
pub mod skiplist;

use std::cmp::Ordering;

use crate::db::format::{
    pack_seq_and_type, InternalKeyComparator, LookupKey, ParsedInternalKey, ValueType,
    INTERNAL_KEY_TAIL,
};
use crate::error::{Error, IResult};
use crate::iterator::Iter;
use crate::mem::skiplist::{Skiplist, SkiplistIterator};
use crate::util::coding::put_fixed_64;
use crate::util::comparator::Comparator;

/// An in-memory buffer of recent writes, sorted by internal key. Entries
/// are added by the single committing thread and read concurrently; both
/// puts and deletions (tombstones) are stored.
pub struct MemTable<C: Comparator> {
    cmp: InternalKeyComparator<C>,
    table: Skiplist<InternalKeyComparator<C>>,
}

impl<C: Comparator> MemTable<C> {
    pub fn new(cmp: InternalKeyComparator<C>) -> Self {
        let table = Skiplist::new(cmp.clone());
        MemTable { cmp, table }
    }

    /// Bytes this memtable holds (entry data plus list structure). The
    /// write path rotates the memtable once this crosses
    /// `write_buffer_size`.
    #[inline]
    pub fn approximate_memory_usage(&self) -> usize {
        self.table.memory_usage()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Adds an entry keyed by `(key, seq, t)`. For a deletion the value
    /// is conventionally empty.
    pub fn add(&self, seq: u64, t: ValueType, key: &[u8], value: &[u8]) {
        let mut ikey = Vec::with_capacity(key.len() + INTERNAL_KEY_TAIL);
        ikey.extend_from_slice(key);
        put_fixed_64(&mut ikey, pack_seq_and_type(seq, t));
        self.table.insert(&ikey, value);
    }

    /// Point lookup at the sequence captured in `lkey`.
    ///
    /// Three outcomes: `Some(Ok(value))` for a live entry,
    /// `Some(Err(NotFound))` for a tombstone (the key is definitely
    /// absent; deeper layers must not be consulted), `None` when this
    /// memtable holds nothing for the key.
    pub fn get(&self, lkey: &LookupKey) -> Option<IResult<Vec<u8>>> {
        let (ikey, value) = self.table.get_greater_or_equal(lkey.internal_key())?;
        // The seek may land on the next user key entirely.
        let parsed = ParsedInternalKey::decode_from(ikey)?;
        if self
            .cmp
            .user_comparator
            .compare(parsed.user_key, lkey.user_key())
            != Ordering::Equal
        {
            return None;
        }
        match parsed.value_type {
            ValueType::KTypeValue => Some(Ok(value.to_vec())),
            ValueType::KTypeDeletion => Some(Err(Error::NotFound)),
            ValueType::Unknown => None,
        }
    }

    /// Iterates entries in internal-key order. Keys yielded are encoded
    /// internal keys.
    pub fn iter(&self) -> MemTableIterator<C> {
        MemTableIterator {
            inner: SkiplistIterator::new(self.table.clone()),
        }
    }
}

pub struct MemTableIterator<C: Comparator> {
    inner: SkiplistIterator<InternalKeyComparator<C>>,
}

impl<C: Comparator> Iter for MemTableIterator<C> {
    fn valid(&self) -> bool {
        self.inner.valid()
    }
    fn seek_to_first(&mut self) {
        self.inner.seek_to_first()
    }
    fn seek_to_last(&mut self) {
        self.inner.seek_to_last()
    }
    fn seek(&mut self, target: &[u8]) {
        self.inner.seek(target)
    }
    fn next(&mut self) {
        self.inner.next()
    }
    fn prev(&mut self) {
        self.inner.prev()
    }
    fn key(&self) -> &[u8] {
        self.inner.key()
    }
    fn value(&self) -> &[u8] {
        self.inner.value()
    }
    fn status(&mut self) -> IResult<()> {
        self.inner.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::format::MAX_SEQUENCE_NUMBER;
    use crate::util::comparator::BytewiseComparator;

    fn new_mem() -> MemTable<BytewiseComparator> {
        MemTable::new(InternalKeyComparator::new(BytewiseComparator))
    }

    fn get_at(mem: &MemTable<BytewiseComparator>, key: &[u8], seq: u64) -> Option<IResult<Vec<u8>>> {
        mem.get(&LookupKey::new(key, seq))
    }

    #[test]
    fn test_add_and_get() {
        let mem = new_mem();
        mem.add(1, ValueType::KTypeValue, b"foo", b"v1");
        mem.add(2, ValueType::KTypeValue, b"bar", b"v2");
        assert_eq!(
            get_at(&mem, b"foo", MAX_SEQUENCE_NUMBER).unwrap().unwrap(),
            b"v1"
        );
        assert_eq!(
            get_at(&mem, b"bar", MAX_SEQUENCE_NUMBER).unwrap().unwrap(),
            b"v2"
        );
        assert!(get_at(&mem, b"baz", MAX_SEQUENCE_NUMBER).is_none());
    }

    #[test]
    fn test_snapshot_visibility() {
        let mem = new_mem();
        mem.add(10, ValueType::KTypeValue, b"k", b"old");
        mem.add(20, ValueType::KTypeValue, b"k", b"new");
        assert_eq!(get_at(&mem, b"k", 15).unwrap().unwrap(), b"old");
        assert_eq!(get_at(&mem, b"k", 25).unwrap().unwrap(), b"new");
        // Before the first write the key does not exist.
        assert!(get_at(&mem, b"k", 5).is_none());
    }

    #[test]
    fn test_tombstone_shadows_value() {
        let mem = new_mem();
        mem.add(1, ValueType::KTypeValue, b"k", b"v");
        mem.add(2, ValueType::KTypeDeletion, b"k", b"");
        match get_at(&mem, b"k", MAX_SEQUENCE_NUMBER) {
            Some(Err(Error::NotFound)) => {}
            other => panic!("expected tombstone, got {:?}", other.map(|r| r.is_ok())),
        }
        // The old value remains visible below the tombstone.
        assert_eq!(get_at(&mem, b"k", 1).unwrap().unwrap(), b"v");
    }

    #[test]
    fn test_empty_key_and_value() {
        let mem = new_mem();
        mem.add(1, ValueType::KTypeValue, b"", b"");
        assert_eq!(get_at(&mem, b"", MAX_SEQUENCE_NUMBER).unwrap().unwrap(), b"");
    }

    #[test]
    fn test_iter_yields_internal_key_order() {
        let mem = new_mem();
        mem.add(3, ValueType::KTypeValue, b"a", b"v3");
        mem.add(7, ValueType::KTypeValue, b"a", b"v7");
        mem.add(5, ValueType::KTypeValue, b"b", b"v5");
        let mut iter = mem.iter();
        iter.seek_to_first();
        let mut seen = vec![];
        while iter.valid() {
            let parsed = ParsedInternalKey::decode_from(iter.key()).unwrap();
            seen.push((parsed.user_key.to_vec(), parsed.seq));
            iter.next();
        }
        // Same user key: newer sequence first.
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), 7),
                (b"a".to_vec(), 3),
                (b"b".to_vec(), 5)
            ]
        );
    }

    #[test]
    fn test_large_value_roundtrip() {
        let mem = new_mem();
        let big = vec![b'x'; 100_000];
        mem.add(1, ValueType::KTypeValue, b"big", &big);
        assert_eq!(get_at(&mem, b"big", 1).unwrap().unwrap(), big);
        assert!(mem.approximate_memory_usage() >= 100_000);
    }
}
