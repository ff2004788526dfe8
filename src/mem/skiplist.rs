use std::cmp::Ordering;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use rand::Rng;

use crate::error::IResult;
use crate::iterator::Iter;
use crate::mem::arena::Arena;
use crate::util::comparator::Comparator;

pub const MAX_HEIGHT: usize = 12;

/// 1-in-4 odds of promoting a node one level.
const BRANCHING: u32 = 4;

/// A skiplist node. Key and value bytes live in the arena; the node holds
/// offsets. `next` is over-declared at `MAX_HEIGHT`; the allocation is
/// truncated to `height + 1` entries, so the slots past `height` of a
/// node must never be touched.
#[repr(C)]
struct Node {
    key_offset: u32,
    key_len: u32,
    value_offset: u32,
    value_len: u32,
    height: usize,
    next: [AtomicU32; MAX_HEIGHT],
}

impl Node {
    fn alloc(arena: &Arena, key: &[u8], value: &[u8], height: usize) -> u32 {
        let key_offset = arena.push(key);
        let value_offset = arena.push(value);
        let unused = (MAX_HEIGHT - height - 1) * std::mem::size_of::<AtomicU32>();
        let size = std::mem::size_of::<Node>() - unused;
        let offset = arena.alloc(std::mem::align_of::<Node>(), size);
        unsafe {
            let node: *mut Node = arena.get(offset);
            std::ptr::addr_of_mut!((*node).key_offset).write(key_offset);
            std::ptr::addr_of_mut!((*node).key_len).write(key.len() as u32);
            std::ptr::addr_of_mut!((*node).value_offset).write(value_offset);
            std::ptr::addr_of_mut!((*node).value_len).write(value.len() as u32);
            std::ptr::addr_of_mut!((*node).height).write(height);
            // The arena zeroes fresh blocks, but a recycled tail is not
            // guaranteed zero; clear the live next slots explicitly.
            let next = std::ptr::addr_of_mut!((*node).next) as *mut AtomicU32;
            for level in 0..=height {
                (*next.add(level)).store(0, AtomicOrdering::Relaxed);
            }
        }
        offset
    }

    #[inline]
    fn key<'a>(&self, arena: &'a Arena) -> &'a [u8] {
        unsafe { arena.slice(self.key_offset, self.key_len as usize) }
    }

    #[inline]
    fn value<'a>(&self, arena: &'a Arena) -> &'a [u8] {
        unsafe { arena.slice(self.value_offset, self.value_len as usize) }
    }

    #[inline]
    fn next(&self, level: usize) -> u32 {
        self.next[level].load(AtomicOrdering::Acquire)
    }

    #[inline]
    fn set_next(&self, level: usize, offset: u32) {
        self.next[level].store(offset, AtomicOrdering::Release)
    }
}

struct SkiplistInner {
    arena: Arena,
    // Arena offset of the head tower. The head stores no key.
    head: u32,
    height: AtomicUsize,
    len: AtomicUsize,
}

/// A sorted map for the memtable: one writer inserts, any number of
/// readers search and iterate concurrently without locking. Published
/// nodes are immutable and arena addresses never move, so readers only
/// need acquire loads on the forward pointers.
///
/// `insert` must be externally serialized; the engine funnels all
/// memtable writes through the batch-commit thread.
pub struct Skiplist<C: Comparator> {
    inner: Arc<SkiplistInner>,
    pub cmp: C,
}

impl<C: Comparator> Clone for Skiplist<C> {
    fn clone(&self) -> Self {
        Skiplist {
            inner: self.inner.clone(),
            cmp: self.cmp.clone(),
        }
    }
}

unsafe impl<C: Comparator> Send for Skiplist<C> {}
unsafe impl<C: Comparator> Sync for Skiplist<C> {}

impl<C: Comparator> Skiplist<C> {
    pub fn new(cmp: C) -> Self {
        let arena = Arena::default();
        let head = Node::alloc(&arena, &[], &[], MAX_HEIGHT - 1);
        Skiplist {
            inner: Arc::new(SkiplistInner {
                arena,
                head,
                height: AtomicUsize::new(0),
                len: AtomicUsize::new(0),
            }),
            cmp,
        }
    }

    /// Inserts an entry. `key` must not equal any key already present;
    /// internal keys carry a unique sequence number which guarantees it.
    pub fn insert(&self, key: &[u8], value: &[u8]) {
        let inner = &*self.inner;
        let list_height = self.height();
        let mut prev = [inner.head; MAX_HEIGHT];
        // Locate the splice from the top live level down.
        for level in (0..=list_height).rev() {
            prev[level] = self.find_less_than_at(level, prev.get(level + 1).copied().unwrap_or(inner.head), key);
        }

        let height = self.random_height();
        if height > list_height {
            for slot in prev.iter_mut().take(height + 1).skip(list_height + 1) {
                *slot = inner.head;
            }
            // Readers loading a stale height simply skip the new levels.
            inner.height.store(height, AtomicOrdering::Release);
        }

        let node_offset = Node::alloc(&inner.arena, key, value, height);
        let node = unsafe { &*inner.arena.get::<Node>(node_offset) };
        for (level, &prev_offset) in prev.iter().enumerate().take(height + 1) {
            let prev_node = unsafe { &*inner.arena.get::<Node>(prev_offset) };
            debug_assert!(
                prev_offset == inner.head
                    || self.cmp.compare(prev_node.key(&inner.arena), key) == Ordering::Less,
                "skiplist keys must be unique and inserted in the splice position"
            );
            // Link bottom-up: set the node's forward pointer before
            // publishing it from the predecessor.
            node.set_next(level, prev_node.next(level));
            prev_node.set_next(level, node_offset);
        }
        inner.len.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Returns the entry with the smallest key >= `key`.
    pub fn get_greater_or_equal(&self, key: &[u8]) -> Option<(&[u8], &[u8])> {
        let offset = self.find_near(key, false, true);
        if offset == 0 {
            return None;
        }
        let arena = &self.inner.arena;
        let node = unsafe { &*arena.get::<Node>(offset) };
        Some((node.key(arena), node.value(arena)))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len.load(AtomicOrdering::Relaxed)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes consumed by entries and list structure.
    #[inline]
    pub fn memory_usage(&self) -> usize {
        self.inner.arena.len()
    }

    #[inline]
    fn height(&self) -> usize {
        self.inner.height.load(AtomicOrdering::Acquire)
    }

    fn random_height(&self) -> usize {
        let mut rng = rand::thread_rng();
        let mut height = 0;
        while height < MAX_HEIGHT - 1 && rng.gen_ratio(1, BRANCHING) {
            height += 1;
        }
        height
    }

    /// Walks level `level` from `start` and returns the last node whose
    /// key is < `key` (which may be `start` itself).
    fn find_less_than_at(&self, level: usize, start: u32, key: &[u8]) -> u32 {
        let arena = &self.inner.arena;
        let mut current = start;
        loop {
            let node = unsafe { &*arena.get::<Node>(current) };
            let next_offset = node.next(level);
            if next_offset == 0 {
                return current;
            }
            let next = unsafe { &*arena.get::<Node>(next_offset) };
            match self.cmp.compare(next.key(arena), key) {
                Ordering::Less => current = next_offset,
                _ => return current,
            }
        }
    }

    /// Finds the node nearest to `key`: with `less`, the rightmost node
    /// with key < `key` (or <= with `allow_equal`); without `less`, the
    /// leftmost node with key > `key` (or >= with `allow_equal`).
    /// Returns 0 when no such node exists.
    fn find_near(&self, key: &[u8], less: bool, allow_equal: bool) -> u32 {
        let inner = &*self.inner;
        let arena = &inner.arena;
        let mut current = inner.head;
        let mut level = self.height();
        loop {
            let node = unsafe { &*arena.get::<Node>(current) };
            let next_offset = node.next(level);
            if next_offset == 0 {
                // End of this level.
                if level > 0 {
                    level -= 1;
                    continue;
                }
                if !less || current == inner.head {
                    return 0;
                }
                return current;
            }
            let next = unsafe { &*arena.get::<Node>(next_offset) };
            match self.cmp.compare(key, next.key(arena)) {
                Ordering::Greater => current = next_offset,
                Ordering::Equal => {
                    if allow_equal {
                        return next_offset;
                    }
                    if !less {
                        // Want strictly greater: the successor at the
                        // bottom level.
                        return next.next(0);
                    }
                    if level > 0 {
                        level -= 1;
                        continue;
                    }
                    if current == inner.head {
                        return 0;
                    }
                    return current;
                }
                Ordering::Less => {
                    if level > 0 {
                        level -= 1;
                        continue;
                    }
                    if !less {
                        return next_offset;
                    }
                    if current == inner.head {
                        return 0;
                    }
                    return current;
                }
            }
        }
    }

    fn find_last(&self) -> u32 {
        let inner = &*self.inner;
        let mut current = inner.head;
        let mut level = self.height();
        loop {
            let node = unsafe { &*inner.arena.get::<Node>(current) };
            let next = node.next(level);
            if next != 0 {
                current = next;
            } else if level > 0 {
                level -= 1;
            } else if current == inner.head {
                return 0;
            } else {
                return current;
            }
        }
    }
}

/// An `Iter` over a skiplist. Holds a clone of the list, which pins the
/// arena for the iterator's lifetime.
pub struct SkiplistIterator<C: Comparator> {
    list: Skiplist<C>,
    current: u32,
}

impl<C: Comparator> SkiplistIterator<C> {
    pub fn new(list: Skiplist<C>) -> Self {
        SkiplistIterator { list, current: 0 }
    }

    #[inline]
    fn node(&self) -> &Node {
        assert!(self.valid(), "invalid skiplist iterator access");
        unsafe { &*self.list.inner.arena.get::<Node>(self.current) }
    }
}

impl<C: Comparator> Iter for SkiplistIterator<C> {
    fn valid(&self) -> bool {
        self.current != 0
    }

    fn seek_to_first(&mut self) {
        let inner = &*self.list.inner;
        self.current = unsafe { &*inner.arena.get::<Node>(inner.head) }.next(0);
    }

    fn seek_to_last(&mut self) {
        self.current = self.list.find_last();
    }

    fn seek(&mut self, target: &[u8]) {
        self.current = self.list.find_near(target, false, true);
    }

    fn next(&mut self) {
        self.current = self.node().next(0);
    }

    fn prev(&mut self) {
        let key = self.node().key(&self.list.inner.arena).to_vec();
        self.current = self.list.find_near(&key, true, false);
    }

    fn key(&self) -> &[u8] {
        self.node().key(&self.list.inner.arena)
    }

    fn value(&self) -> &[u8] {
        self.node().value(&self.list.inner.arena)
    }

    fn status(&mut self) -> IResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::comparator::BytewiseComparator;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn new_list() -> Skiplist<BytewiseComparator> {
        Skiplist::new(BytewiseComparator)
    }

    fn key(i: usize) -> Vec<u8> {
        format!("{:05}", i).into_bytes()
    }

    #[test]
    fn test_empty() {
        let list = new_list();
        assert!(list.is_empty());
        assert!(list.get_greater_or_equal(b"aaa").is_none());
        let mut iter = SkiplistIterator::new(list);
        assert!(!iter.valid());
        iter.seek_to_first();
        assert!(!iter.valid());
        iter.seek_to_last();
        assert!(!iter.valid());
        iter.seek(b"aaa");
        assert!(!iter.valid());
    }

    #[test]
    fn test_insert_and_lookup() {
        let list = new_list();
        // Insert out of order.
        for i in [5usize, 1, 4, 2, 3, 0, 9, 7] {
            list.insert(&key(i * 10), &key(i));
        }
        assert_eq!(list.len(), 8);
        // Exact and between-keys seeks.
        assert_eq!(
            list.get_greater_or_equal(&key(30)),
            Some((key(30).as_slice(), key(3).as_slice()))
        );
        assert_eq!(
            list.get_greater_or_equal(&key(31)),
            Some((key(40).as_slice(), key(4).as_slice()))
        );
        assert!(list.get_greater_or_equal(&key(91)).is_none());
    }

    #[test]
    fn test_iterator_orders() {
        let list = new_list();
        let n = 200;
        for i in (0..n).rev() {
            list.insert(&key(i), &key(i * 2));
        }
        let mut iter = SkiplistIterator::new(list);
        iter.seek_to_first();
        for i in 0..n {
            assert!(iter.valid());
            assert_eq!(iter.key(), key(i).as_slice());
            assert_eq!(iter.value(), key(i * 2).as_slice());
            iter.next();
        }
        assert!(!iter.valid());

        iter.seek_to_last();
        for i in (0..n).rev() {
            assert!(iter.valid());
            assert_eq!(iter.key(), key(i).as_slice());
            iter.prev();
        }
        assert!(!iter.valid());
    }

    #[test]
    fn test_iterator_seek() {
        let list = new_list();
        for i in 0..100 {
            list.insert(&key(i * 10 + 1000), &key(i));
        }
        let mut iter = SkiplistIterator::new(list);
        iter.seek(&key(0));
        assert_eq!(iter.key(), key(1000).as_slice());
        iter.seek(&key(1005));
        assert_eq!(iter.key(), key(1010).as_slice());
        iter.seek(&key(1010));
        assert_eq!(iter.key(), key(1010).as_slice());
        iter.seek(&key(99999));
        assert!(!iter.valid());
    }

    #[test]
    fn test_single_writer_concurrent_readers() {
        let list = new_list();
        let n = 2000usize;
        let (tx, rx) = mpsc::channel();
        let mut readers = vec![];
        for _ in 0..4 {
            let list = list.clone();
            let tx = tx.clone();
            readers.push(thread::spawn(move || {
                // Spin until the writer is done, checking that whatever
                // prefix is visible is internally consistent.
                loop {
                    let mut iter = SkiplistIterator::new(list.clone());
                    iter.seek_to_first();
                    let mut last: Option<Vec<u8>> = None;
                    let mut count = 0usize;
                    while iter.valid() {
                        if let Some(prev) = &last {
                            assert!(prev.as_slice() < iter.key());
                        }
                        last = Some(iter.key().to_vec());
                        count += 1;
                        iter.next();
                    }
                    if count == n {
                        tx.send(()).unwrap();
                        return;
                    }
                }
            }));
        }
        let writer = {
            let list = list.clone();
            thread::spawn(move || {
                for i in 0..n {
                    // A shuffled-ish but deterministic order.
                    let k = (i * 7919) % n;
                    list.insert(&key(k * 2 + 1), b"v");
                }
            })
        };
        writer.join().unwrap();
        for _ in 0..4 {
            rx.recv_timeout(Duration::from_secs(10)).unwrap();
        }
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(list.len(), n);
    }

    #[test]
    fn test_memory_usage_grows() {
        let list = new_list();
        let before = list.memory_usage();
        list.insert(b"key", &vec![0u8; 4096]);
        assert!(list.memory_usage() >= before + 4096);
    }
}
