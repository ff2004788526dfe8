use std::cmp::Ordering;
use std::sync::Arc;

use crate::db::format::{
    pack_seq_and_type, ParsedInternalKey, ValueType, VALUE_TYPE_FOR_SEEK,
};
use crate::error::{Error, IResult};
use crate::iterator::{ConcatenateIterator, Direction, Iter, KMergeCore};
use crate::mem::MemTableIterator;
use crate::sstable::TableIterator;
use crate::storage::Storage;
use crate::util::coding::put_fixed_64;
use crate::util::comparator::Comparator;
use crate::version::version_set::FileIterFactory;
use crate::version::{LevelFileNumIterator, Version};
use crate::db::format::InternalKeyComparator;

/// The merge source under a database iterator: the mutable and immutable
/// memtables, each level-0 table, and one lazily-opening iterator per
/// deeper level. Holds the `Version` it was built from, pinning those
/// files against deletion for the iterator's lifetime.
pub struct DBIteratorCore<S: Storage + Clone, C: Comparator + 'static> {
    cmp: InternalKeyComparator<C>,
    mem_iters: Vec<MemTableIterator<C>>,
    level0: Vec<TableIterator<InternalKeyComparator<C>, S::F>>,
    leveln: Vec<ConcatenateIterator<LevelFileNumIterator<C>, FileIterFactory<S, C>>>,
    _pinned_version: Arc<Version<C>>,
}

impl<S: Storage + Clone, C: Comparator + 'static> DBIteratorCore<S, C> {
    pub fn new(
        cmp: InternalKeyComparator<C>,
        mem_iters: Vec<MemTableIterator<C>>,
        level0: Vec<TableIterator<InternalKeyComparator<C>, S::F>>,
        leveln: Vec<ConcatenateIterator<LevelFileNumIterator<C>, FileIterFactory<S, C>>>,
        version: Arc<Version<C>>,
    ) -> Self {
        DBIteratorCore {
            cmp,
            mem_iters,
            level0,
            leveln,
            _pinned_version: version,
        }
    }

    fn child_at(&self, i: usize) -> &dyn Iter {
        if i < self.mem_iters.len() {
            &self.mem_iters[i]
        } else if i < self.mem_iters.len() + self.level0.len() {
            &self.level0[i - self.mem_iters.len()]
        } else {
            &self.leveln[i - self.mem_iters.len() - self.level0.len()]
        }
    }

    fn child_at_mut(&mut self, i: usize) -> &mut dyn Iter {
        if i < self.mem_iters.len() {
            &mut self.mem_iters[i]
        } else if i < self.mem_iters.len() + self.level0.len() {
            let i = i - self.mem_iters.len();
            &mut self.level0[i]
        } else {
            let i = i - self.mem_iters.len() - self.level0.len();
            &mut self.leveln[i]
        }
    }
}

impl<S: Storage + Clone, C: Comparator + 'static> KMergeCore for DBIteratorCore<S, C> {
    type Cmp = InternalKeyComparator<C>;

    fn cmp(&self) -> &Self::Cmp {
        &self.cmp
    }

    fn iters_len(&self) -> usize {
        self.mem_iters.len() + self.level0.len() + self.leveln.len()
    }

    fn find_smallest(&mut self) -> usize {
        let mut smallest: Option<&[u8]> = None;
        let mut index = self.iters_len();
        for i in 0..self.iters_len() {
            if self.smaller(&mut smallest, self.child_at(i)) {
                index = i;
            }
        }
        index
    }

    fn find_largest(&mut self) -> usize {
        let mut largest: Option<&[u8]> = None;
        let mut index = self.iters_len();
        for i in 0..self.iters_len() {
            if self.larger(&mut largest, self.child_at(i)) {
                index = i;
            }
        }
        index
    }

    fn get_child(&self, i: usize) -> &dyn Iter {
        self.child_at(i)
    }

    fn get_child_mut(&mut self, i: usize) -> &mut dyn Iter {
        self.child_at_mut(i)
    }

    fn for_each_child<F>(&mut self, mut f: F)
    where
        F: FnMut(&mut dyn Iter),
    {
        for i in 0..self.iters_len() {
            f(self.child_at_mut(i));
        }
    }

    fn for_not_ith<F>(&mut self, n: usize, mut f: F)
    where
        F: FnMut(&mut dyn Iter, &Self::Cmp),
    {
        let cmp = self.cmp.clone();
        for i in 0..self.iters_len() {
            if i != n {
                f(self.child_at_mut(i), &cmp);
            }
        }
    }

    fn take_err(&mut self) -> IResult<()> {
        for i in 0..self.iters_len() {
            self.child_at_mut(i).status()?;
        }
        Ok(())
    }
}

/// The user-facing iterator. The layers below yield raw
/// `(user_key, sequence, type)` entries in internal-key order; this
/// collapses them into the live view at `sequence`: newer entries are
/// invisible, the newest visible entry decides, and a deletion hides its
/// user key entirely.
pub struct DBIterator<I: Iter, C: Comparator> {
    inner: I,
    ucmp: C,
    sequence: u64,
    valid: bool,
    direction: Direction,
    err: Option<Error>,
    /// Moving forward: the user key to skip duplicates of.
    /// Moving backward: the user key/value of the entry to yield
    /// (`inner` is parked just before that key's entries).
    saved_key: Vec<u8>,
    saved_value: Vec<u8>,
}

impl<I: Iter, C: Comparator> DBIterator<I, C> {
    pub fn new(inner: I, ucmp: C, sequence: u64) -> Self {
        DBIterator {
            inner,
            ucmp,
            sequence,
            valid: false,
            direction: Direction::Forward,
            err: None,
            saved_key: vec![],
            saved_value: vec![],
        }
    }

    fn current_user_key(&mut self) -> Option<Vec<u8>> {
        match ParsedInternalKey::decode_from(self.inner.key()) {
            Some(parsed) => Some(parsed.user_key.to_vec()),
            None => {
                if self.err.is_none() {
                    self.err = Some(Error::Corruption(
                        "corrupted internal key in DBIterator".to_owned(),
                    ));
                }
                None
            }
        }
    }

    /// Positions at the first visible entry at or after the current
    /// inner position. With `skipping`, entries for user keys <=
    /// `saved_key` are consumed silently.
    fn find_next_user_entry(&mut self, mut skipping: bool) {
        debug_assert_eq!(self.direction, Direction::Forward);
        while self.inner.valid() {
            let sequence = self.sequence;
            if let Some(parsed) = ParsedInternalKey::decode_from(self.inner.key()) {
                if parsed.seq <= sequence {
                    match parsed.value_type {
                        ValueType::KTypeDeletion => {
                            // Every older entry of this user key is
                            // shadowed by the tombstone.
                            self.saved_key.clear();
                            self.saved_key.extend_from_slice(parsed.user_key);
                            skipping = true;
                        }
                        ValueType::KTypeValue => {
                            let hidden = skipping
                                && self.ucmp.compare(parsed.user_key, &self.saved_key)
                                    != Ordering::Greater;
                            if !hidden {
                                self.valid = true;
                                self.saved_key.clear();
                                return;
                            }
                        }
                        ValueType::Unknown => {}
                    }
                }
            } else if self.err.is_none() {
                self.err = Some(Error::Corruption(
                    "corrupted internal key in DBIterator".to_owned(),
                ));
            }
            self.inner.next();
        }
        self.saved_key.clear();
        self.valid = false;
    }

    /// Scans backwards, remembering the newest visible entry of the
    /// previous user key, and parks `inner` just before that key's
    /// entries.
    fn find_prev_user_entry(&mut self) {
        debug_assert_eq!(self.direction, Direction::Reverse);
        let mut value_type = ValueType::KTypeDeletion;
        while self.inner.valid() {
            let sequence = self.sequence;
            if let Some(parsed) = ParsedInternalKey::decode_from(self.inner.key()) {
                if parsed.seq <= sequence {
                    if value_type != ValueType::KTypeDeletion
                        && self.ucmp.compare(parsed.user_key, &self.saved_key) == Ordering::Less
                    {
                        // We have a live entry saved and just stepped
                        // into the previous user key: done.
                        break;
                    }
                    value_type = parsed.value_type;
                    if value_type == ValueType::KTypeDeletion {
                        self.saved_key.clear();
                        self.saved_value.clear();
                    } else {
                        self.saved_key.clear();
                        self.saved_key.extend_from_slice(parsed.user_key);
                        self.saved_value.clear();
                        self.saved_value.extend_from_slice(self.inner.value());
                    }
                }
            } else if self.err.is_none() {
                self.err = Some(Error::Corruption(
                    "corrupted internal key in DBIterator".to_owned(),
                ));
            }
            self.inner.prev();
        }
        if value_type == ValueType::KTypeDeletion {
            // Ran off the beginning.
            self.valid = false;
            self.saved_key.clear();
            self.saved_value.clear();
            self.direction = Direction::Forward;
        } else {
            self.valid = true;
        }
    }
}

impl<I: Iter, C: Comparator> Iter for DBIterator<I, C> {
    fn valid(&self) -> bool {
        self.valid
    }

    fn seek_to_first(&mut self) {
        self.direction = Direction::Forward;
        self.saved_value.clear();
        self.inner.seek_to_first();
        if self.inner.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    fn seek_to_last(&mut self) {
        self.direction = Direction::Reverse;
        self.saved_value.clear();
        self.inner.seek_to_last();
        self.find_prev_user_entry();
    }

    fn seek(&mut self, target: &[u8]) {
        self.direction = Direction::Forward;
        self.saved_value.clear();
        self.saved_key.clear();
        self.saved_key.extend_from_slice(target);
        put_fixed_64(
            &mut self.saved_key,
            pack_seq_and_type(self.sequence, VALUE_TYPE_FOR_SEEK),
        );
        self.inner.seek(&self.saved_key);
        if self.inner.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    fn next(&mut self) {
        assert!(self.valid);
        if self.direction == Direction::Reverse {
            self.direction = Direction::Forward;
            // `inner` is parked just before the entries of the current
            // key; step back onto (or past) them.
            if self.inner.valid() {
                self.inner.next();
            } else {
                self.inner.seek_to_first();
            }
            if !self.inner.valid() {
                self.valid = false;
                self.saved_key.clear();
                return;
            }
            // saved_key already holds the user key to skip past.
        } else {
            let current = match self.current_user_key() {
                Some(ukey) => ukey,
                None => {
                    self.valid = false;
                    return;
                }
            };
            self.saved_key = current;
            self.inner.next();
            if !self.inner.valid() {
                self.valid = false;
                self.saved_key.clear();
                return;
            }
        }
        self.find_next_user_entry(true);
    }

    fn prev(&mut self) {
        assert!(self.valid);
        if self.direction == Direction::Forward {
            // Scan backwards until the user key changes; then the
            // reverse machinery takes over.
            let current = match self.current_user_key() {
                Some(ukey) => ukey,
                None => {
                    self.valid = false;
                    return;
                }
            };
            self.saved_key = current;
            loop {
                self.inner.prev();
                if !self.inner.valid() {
                    self.valid = false;
                    self.saved_key.clear();
                    self.saved_value.clear();
                    return;
                }
                if let Some(parsed) = ParsedInternalKey::decode_from(self.inner.key()) {
                    if self.ucmp.compare(parsed.user_key, &self.saved_key) == Ordering::Less {
                        break;
                    }
                }
            }
            self.direction = Direction::Reverse;
        }
        self.find_prev_user_entry();
    }

    fn key(&self) -> &[u8] {
        assert!(self.valid);
        match self.direction {
            Direction::Forward => {
                crate::db::format::extract_user_key(self.inner.key())
            }
            Direction::Reverse => &self.saved_key,
        }
    }

    fn value(&self) -> &[u8] {
        assert!(self.valid);
        match self.direction {
            Direction::Forward => self.inner.value(),
            Direction::Reverse => &self.saved_value,
        }
    }

    fn status(&mut self) -> IResult<()> {
        if let Some(e) = &self.err {
            return Err(e.clone());
        }
        self.inner.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::format::InternalKey;
    use crate::iterator::tests::VecIterator;
    use crate::util::comparator::BytewiseComparator;

    fn entry(ukey: &str, seq: u64, t: ValueType, value: &str) -> (Vec<u8>, Vec<u8>) {
        (
            InternalKey::new(ukey.as_bytes(), seq, t).data().to_vec(),
            value.as_bytes().to_vec(),
        )
    }

    /// Entries must be provided in internal-key order; `VecIterator`
    /// sorts byte-wise, which does not match tag ordering, so sort here.
    fn db_iter(
        entries: Vec<(Vec<u8>, Vec<u8>)>,
        sequence: u64,
    ) -> DBIterator<SortedInternalIter, BytewiseComparator> {
        DBIterator::new(SortedInternalIter::new(entries), BytewiseComparator, sequence)
    }

    /// A `VecIterator` re-sorted under the internal key comparator.
    struct SortedInternalIter(VecIterator);

    impl SortedInternalIter {
        fn new(mut entries: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
            let icmp = InternalKeyComparator::new(BytewiseComparator);
            entries.sort_by(|a, b| icmp.compare(&a.0, &b.0));
            SortedInternalIter(VecIterator::new_presorted(entries))
        }
    }

    impl Iter for SortedInternalIter {
        fn valid(&self) -> bool {
            self.0.valid()
        }
        fn seek_to_first(&mut self) {
            self.0.seek_to_first()
        }
        fn seek_to_last(&mut self) {
            self.0.seek_to_last()
        }
        fn seek(&mut self, target: &[u8]) {
            // Binary search is byte-wise in VecIterator; re-do it with
            // the internal comparator by linear scan (test scale).
            let icmp = InternalKeyComparator::new(BytewiseComparator);
            self.0.seek_to_first();
            while self.0.valid() && icmp.compare(self.0.key(), target) == Ordering::Less {
                self.0.next();
            }
        }
        fn next(&mut self) {
            self.0.next()
        }
        fn prev(&mut self) {
            self.0.prev()
        }
        fn key(&self) -> &[u8] {
            self.0.key()
        }
        fn value(&self) -> &[u8] {
            self.0.value()
        }
        fn status(&mut self) -> IResult<()> {
            self.0.status()
        }
    }

    fn collect_forward(iter: &mut dyn Iter) -> Vec<(String, String)> {
        iter.seek_to_first();
        let mut out = vec![];
        while iter.valid() {
            out.push((
                String::from_utf8_lossy(iter.key()).into_owned(),
                String::from_utf8_lossy(iter.value()).into_owned(),
            ));
            iter.next();
        }
        out
    }

    #[test]
    fn test_newest_visible_entry_wins() {
        let mut iter = db_iter(
            vec![
                entry("a", 1, ValueType::KTypeValue, "a1"),
                entry("a", 5, ValueType::KTypeValue, "a5"),
                entry("b", 2, ValueType::KTypeValue, "b2"),
            ],
            10,
        );
        assert_eq!(
            collect_forward(&mut iter),
            vec![
                ("a".to_owned(), "a5".to_owned()),
                ("b".to_owned(), "b2".to_owned())
            ]
        );
    }

    #[test]
    fn test_snapshot_hides_newer_entries() {
        let mut iter = db_iter(
            vec![
                entry("a", 1, ValueType::KTypeValue, "a1"),
                entry("a", 5, ValueType::KTypeValue, "a5"),
                entry("b", 7, ValueType::KTypeValue, "b7"),
            ],
            3,
        );
        assert_eq!(
            collect_forward(&mut iter),
            vec![("a".to_owned(), "a1".to_owned())]
        );
    }

    #[test]
    fn test_deletion_hides_key() {
        let mut iter = db_iter(
            vec![
                entry("a", 1, ValueType::KTypeValue, "a1"),
                entry("a", 4, ValueType::KTypeDeletion, ""),
                entry("b", 2, ValueType::KTypeValue, "b2"),
                entry("c", 3, ValueType::KTypeDeletion, ""),
                entry("c", 2, ValueType::KTypeValue, "c2"),
            ],
            10,
        );
        assert_eq!(
            collect_forward(&mut iter),
            vec![("b".to_owned(), "b2".to_owned())]
        );
        // At a snapshot before the deletions, both keys are visible.
        let mut iter = db_iter(
            vec![
                entry("a", 1, ValueType::KTypeValue, "a1"),
                entry("a", 4, ValueType::KTypeDeletion, ""),
                entry("c", 3, ValueType::KTypeDeletion, ""),
                entry("c", 2, ValueType::KTypeValue, "c2"),
            ],
            2,
        );
        assert_eq!(
            collect_forward(&mut iter),
            vec![
                ("a".to_owned(), "a1".to_owned()),
                ("c".to_owned(), "c2".to_owned())
            ]
        );
    }

    #[test]
    fn test_reverse_matches_forward() {
        let entries = vec![
            entry("a", 1, ValueType::KTypeValue, "a1"),
            entry("b", 4, ValueType::KTypeDeletion, ""),
            entry("b", 2, ValueType::KTypeValue, "b2"),
            entry("c", 3, ValueType::KTypeValue, "c3"),
            entry("d", 6, ValueType::KTypeValue, "d6"),
            entry("d", 5, ValueType::KTypeValue, "d5"),
        ];
        let mut iter = db_iter(entries.clone(), 10);
        let forward = collect_forward(&mut iter);

        let mut iter = db_iter(entries, 10);
        iter.seek_to_last();
        let mut backward = vec![];
        while iter.valid() {
            backward.push((
                String::from_utf8_lossy(iter.key()).into_owned(),
                String::from_utf8_lossy(iter.value()).into_owned(),
            ));
            iter.prev();
        }
        backward.reverse();
        assert_eq!(forward, backward);
        assert_eq!(
            forward,
            vec![
                ("a".to_owned(), "a1".to_owned()),
                ("c".to_owned(), "c3".to_owned()),
                ("d".to_owned(), "d6".to_owned())
            ]
        );
    }

    #[test]
    fn test_direction_switches() {
        let entries = vec![
            entry("a", 1, ValueType::KTypeValue, "va"),
            entry("b", 2, ValueType::KTypeValue, "vb"),
            entry("c", 3, ValueType::KTypeValue, "vc"),
        ];
        let mut iter = db_iter(entries, 10);
        iter.seek(b"b");
        assert_eq!(iter.key(), b"b");
        iter.prev();
        assert_eq!(iter.key(), b"a");
        assert_eq!(iter.value(), b"va");
        iter.next();
        assert_eq!(iter.key(), b"b");
        assert_eq!(iter.value(), b"vb");
        iter.next();
        assert_eq!(iter.key(), b"c");
        iter.next();
        assert!(!iter.valid());
    }

    #[test]
    fn test_seek_skips_deleted_prefix() {
        let entries = vec![
            entry("a", 4, ValueType::KTypeDeletion, ""),
            entry("a", 1, ValueType::KTypeValue, "a1"),
            entry("b", 2, ValueType::KTypeValue, "b2"),
        ];
        let mut iter = db_iter(entries, 10);
        iter.seek(b"a");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"b");
        iter.seek(b"z");
        assert!(!iter.valid());
    }

    #[test]
    fn test_empty_source() {
        let mut iter = db_iter(vec![], 10);
        iter.seek_to_first();
        assert!(!iter.valid());
        iter.seek_to_last();
        assert!(!iter.valid());
        iter.seek(b"a");
        assert!(!iter.valid());
    }
}
