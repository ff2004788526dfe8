use std::cmp::Ordering;

use crate::error::{Error, IResult};
use crate::util::comparator::Comparator;

/// The iteration interface shared by every layer of the read path:
/// memtable, block, table, level, merge, and the user-facing database
/// iterator are all `Iter`s over (key, value) pairs.
///
/// An iterator is either positioned at an entry (`valid()`) or not.
/// `key()`/`value()` must only be called when positioned.
pub trait Iter {
    fn valid(&self) -> bool;

    /// Positions at the first entry. The iterator is valid afterwards
    /// iff the source is not empty.
    fn seek_to_first(&mut self);

    /// Positions at the last entry.
    fn seek_to_last(&mut self);

    /// Positions at the first entry with key >= `target`.
    fn seek(&mut self, target: &[u8]);

    /// Moves to the next entry. Must be positioned.
    fn next(&mut self);

    /// Moves to the previous entry; becomes invalid after the first
    /// entry. Must be positioned.
    fn prev(&mut self);

    fn key(&self) -> &[u8];

    fn value(&self) -> &[u8];

    /// The first error this iterator encountered, if any. Reading it does
    /// not reset it.
    fn status(&mut self) -> IResult<()>;
}

/// An iterator over nothing, optionally carrying an error to report.
pub struct EmptyIterator {
    err: Option<Error>,
}

impl EmptyIterator {
    pub fn new() -> Self {
        EmptyIterator { err: None }
    }

    pub fn new_with_err(err: Error) -> Self {
        EmptyIterator { err: Some(err) }
    }
}

impl Default for EmptyIterator {
    fn default() -> Self {
        Self::new()
    }
}

impl Iter for EmptyIterator {
    fn valid(&self) -> bool {
        false
    }
    fn seek_to_first(&mut self) {}
    fn seek_to_last(&mut self) {}
    fn seek(&mut self, _target: &[u8]) {}
    fn next(&mut self) {
        unreachable!("next on empty iterator")
    }
    fn prev(&mut self) {
        unreachable!("prev on empty iterator")
    }
    fn key(&self) -> &[u8] {
        unreachable!("key on empty iterator")
    }
    fn value(&self) -> &[u8] {
        unreachable!("value on empty iterator")
    }
    fn status(&mut self) -> IResult<()> {
        match &self.err {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

/// Derives the iterator for a second level from the value yielded by a
/// first-level index iterator (e.g. a `BlockHandle` to a data block, or a
/// file number to a table iterator).
pub trait DerivedIterFactory {
    type Iter: Iter;
    fn derive(&self, value: &[u8]) -> IResult<Self::Iter>;
}

/// A two-level iterator: walks an index iterator, derives the data
/// iterator each index entry points at, and yields the data entries in
/// order. Empty derived iterators are skipped transparently.
pub struct ConcatenateIterator<I: Iter, F: DerivedIterFactory> {
    index_iter: I,
    factory: F,
    data_iter: Option<F::Iter>,
    // The index value `data_iter` was derived from, so a re-seek landing
    // on the same entry reuses the live iterator.
    data_value: Vec<u8>,
    err: Option<Error>,
}

impl<I: Iter, F: DerivedIterFactory> ConcatenateIterator<I, F> {
    pub fn new(index_iter: I, factory: F) -> Self {
        ConcatenateIterator {
            index_iter,
            factory,
            data_iter: None,
            data_value: vec![],
            err: None,
        }
    }

    fn save_err(&mut self, e: Error) {
        if self.err.is_none() {
            self.err = Some(e);
        }
    }

    fn init_data_iter(&mut self) {
        if !self.index_iter.valid() {
            self.data_iter = None;
            return;
        }
        let value = self.index_iter.value();
        if self.data_iter.is_some() && self.data_value == value {
            return;
        }
        self.data_value = value.to_vec();
        match self.factory.derive(value) {
            Ok(iter) => self.data_iter = Some(iter),
            Err(e) => {
                self.save_err(e);
                self.data_iter = None;
            }
        }
    }

    fn skip_forward(&mut self) {
        while !self.data_valid() {
            if !self.index_iter.valid() {
                self.data_iter = None;
                return;
            }
            self.index_iter.next();
            self.init_data_iter();
            if let Some(data) = self.data_iter.as_mut() {
                data.seek_to_first();
            }
        }
    }

    fn skip_backward(&mut self) {
        while !self.data_valid() {
            if !self.index_iter.valid() {
                self.data_iter = None;
                return;
            }
            self.index_iter.prev();
            self.init_data_iter();
            if let Some(data) = self.data_iter.as_mut() {
                data.seek_to_last();
            }
        }
    }

    #[inline]
    fn data_valid(&self) -> bool {
        self.data_iter.as_ref().map_or(false, |d| d.valid())
    }
}

impl<I: Iter, F: DerivedIterFactory> Iter for ConcatenateIterator<I, F> {
    fn valid(&self) -> bool {
        self.data_valid()
    }

    fn seek_to_first(&mut self) {
        self.index_iter.seek_to_first();
        self.init_data_iter();
        if let Some(data) = self.data_iter.as_mut() {
            data.seek_to_first();
        }
        self.skip_forward();
    }

    fn seek_to_last(&mut self) {
        self.index_iter.seek_to_last();
        self.init_data_iter();
        if let Some(data) = self.data_iter.as_mut() {
            data.seek_to_last();
        }
        self.skip_backward();
    }

    fn seek(&mut self, target: &[u8]) {
        self.index_iter.seek(target);
        self.init_data_iter();
        if let Some(data) = self.data_iter.as_mut() {
            data.seek(target);
        }
        self.skip_forward();
    }

    fn next(&mut self) {
        assert!(self.valid());
        if let Some(data) = self.data_iter.as_mut() {
            data.next();
        }
        self.skip_forward();
    }

    fn prev(&mut self) {
        assert!(self.valid());
        if let Some(data) = self.data_iter.as_mut() {
            data.prev();
        }
        self.skip_backward();
    }

    fn key(&self) -> &[u8] {
        assert!(self.valid());
        self.data_iter.as_ref().unwrap().key()
    }

    fn value(&self) -> &[u8] {
        assert!(self.valid());
        self.data_iter.as_ref().unwrap().value()
    }

    fn status(&mut self) -> IResult<()> {
        if let Some(e) = &self.err {
            return Err(e.clone());
        }
        self.index_iter.status()?;
        if let Some(data) = self.data_iter.as_mut() {
            data.status()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

/// The child-set abstraction a `KMergeIter` merges over. Implementations
/// own heterogeneous child iterators (memtable iterators next to table
/// iterators), which is why children are exposed as `&dyn Iter` instead
/// of one generic type.
pub trait KMergeCore {
    type Cmp: Comparator;

    fn cmp(&self) -> &Self::Cmp;

    fn iters_len(&self) -> usize;

    /// The index of the child positioned at the smallest key, or
    /// `iters_len()` when every child is exhausted.
    fn find_smallest(&mut self) -> usize;

    /// The index of the child positioned at the largest key.
    fn find_largest(&mut self) -> usize;

    fn get_child(&self, i: usize) -> &dyn Iter;

    fn get_child_mut(&mut self, i: usize) -> &mut dyn Iter;

    fn for_each_child<F>(&mut self, f: F)
    where
        F: FnMut(&mut dyn Iter);

    fn for_not_ith<F>(&mut self, i: usize, f: F)
    where
        F: FnMut(&mut dyn Iter, &Self::Cmp);

    /// The first error any child holds.
    fn take_err(&mut self) -> IResult<()>;

    /// True if `child` is valid and its key is smaller than `*smallest`,
    /// updating `*smallest` in that case.
    fn smaller<'a>(&self, smallest: &mut Option<&'a [u8]>, child: &'a dyn Iter) -> bool {
        if child.valid()
            && smallest.map_or(true, |s| self.cmp().compare(child.key(), s) == Ordering::Less)
        {
            *smallest = Some(child.key());
            true
        } else {
            false
        }
    }

    fn larger<'a>(&self, largest: &mut Option<&'a [u8]>, child: &'a dyn Iter) -> bool {
        if child.valid()
            && largest.map_or(true, |l| self.cmp().compare(child.key(), l) == Ordering::Greater)
        {
            *largest = Some(child.key());
            true
        } else {
            false
        }
    }
}

/// A k-way merging iterator. Children yield their entries in key order;
/// the merge yields the union in key order. Equal keys are yielded in
/// child order, which the database relies on by listing newer sources
/// before older ones.
pub struct KMergeIter<T: KMergeCore> {
    core: T,
    current: usize,
    direction: Direction,
}

impl<T: KMergeCore> KMergeIter<T> {
    pub fn new(core: T) -> Self {
        let current = core.iters_len();
        KMergeIter {
            core,
            current,
            direction: Direction::Forward,
        }
    }
}

impl<T: KMergeCore> Iter for KMergeIter<T> {
    fn valid(&self) -> bool {
        self.current < self.core.iters_len() && self.core.get_child(self.current).valid()
    }

    fn seek_to_first(&mut self) {
        self.core.for_each_child(|child| child.seek_to_first());
        self.direction = Direction::Forward;
        self.current = self.core.find_smallest();
    }

    fn seek_to_last(&mut self) {
        self.core.for_each_child(|child| child.seek_to_last());
        self.direction = Direction::Reverse;
        self.current = self.core.find_largest();
    }

    fn seek(&mut self, target: &[u8]) {
        self.core.for_each_child(|child| child.seek(target));
        self.direction = Direction::Forward;
        self.current = self.core.find_smallest();
    }

    fn next(&mut self) {
        assert!(self.valid());
        if self.direction != Direction::Forward {
            // All other children must be restaged to the first entry past
            // the current key before this can advance.
            let key = self.key().to_vec();
            self.core.for_not_ith(self.current, |child, cmp| {
                child.seek(&key);
                if child.valid() && cmp.compare(&key, child.key()) == Ordering::Equal {
                    child.next();
                }
            });
            self.direction = Direction::Forward;
        }
        self.core.get_child_mut(self.current).next();
        self.current = self.core.find_smallest();
    }

    fn prev(&mut self) {
        assert!(self.valid());
        if self.direction != Direction::Reverse {
            // Restage all other children just before the current key.
            let key = self.key().to_vec();
            self.core.for_not_ith(self.current, |child, _| {
                child.seek(&key);
                if child.valid() {
                    child.prev();
                } else {
                    // Every entry in this child is smaller than `key`.
                    child.seek_to_last();
                }
            });
            self.direction = Direction::Reverse;
        }
        self.core.get_child_mut(self.current).prev();
        self.current = self.core.find_largest();
    }

    fn key(&self) -> &[u8] {
        assert!(self.valid());
        self.core.get_child(self.current).key()
    }

    fn value(&self) -> &[u8] {
        assert!(self.valid());
        self.core.get_child(self.current).value()
    }

    fn status(&mut self) -> IResult<()> {
        self.core.take_err()
    }
}
