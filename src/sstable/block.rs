use std::cmp::Ordering;
use std::mem::size_of;
use std::sync::Arc;

use crate::error::{Error, IResult};
use crate::iterator::Iter;
use crate::util::coding::{decode_fixed_32, put_fixed_32, VarintU32};
use crate::util::comparator::Comparator;

/// Builds blocks with prefix-compressed keys:
///
/// Each entry drops the prefix it shares with the previous key. Every
/// `restart_interval` entries the full key is stored (a "restart point")
/// and its offset recorded in a trailing array, which seeks binary
/// search. Values are stored verbatim after their key.
///
/// An entry has the form:
///
/// ```text
///     +-----------------+---------------------+--------------------+
///     | shared (varint) | non-shared (varint) | value len (varint) |
///     +-----------------+---------------------+--------------------+-...-+
///     | key delta (non-shared bytes) | value bytes                       |
///     +------------------------------+-----------------------------------+
/// ```
///
/// and the block ends with `{u32 restart_offset...; u32 num_restarts}`.
pub struct BlockBuilder<C: Comparator> {
    cmp: C,
    restart_interval: u32,
    buffer: Vec<u8>,
    restarts: Vec<u32>,
    /// Entries since the last restart point.
    counter: u32,
    finished: bool,
    last_key: Vec<u8>,
}

impl<C: Comparator> BlockBuilder<C> {
    pub fn new(restart_interval: u32, cmp: C) -> Self {
        assert!(
            restart_interval >= 1,
            "block restart interval must be at least 1, got {}",
            restart_interval
        );
        BlockBuilder {
            cmp,
            restart_interval,
            buffer: vec![],
            restarts: vec![0],
            counter: 0,
            finished: false,
            last_key: vec![],
        }
    }

    /// Appends an entry. Keys must arrive in strictly increasing order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        assert!(!self.finished, "add on a finished block");
        assert!(self.counter <= self.restart_interval);
        assert!(
            self.buffer.is_empty()
                || self.cmp.compare(key, &self.last_key) == Ordering::Greater,
            "keys must be added in strictly increasing order"
        );

        let mut shared = 0;
        if self.counter < self.restart_interval {
            let min_len = self.last_key.len().min(key.len());
            while shared < min_len && self.last_key[shared] == key[shared] {
                shared += 1;
            }
        } else {
            self.restarts.push(self.buffer.len() as u32);
            self.counter = 0;
        }

        VarintU32::put_varint(&mut self.buffer, shared as u32);
        VarintU32::put_varint(&mut self.buffer, (key.len() - shared) as u32);
        VarintU32::put_varint(&mut self.buffer, value.len() as u32);
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.counter += 1;
    }

    /// Appends the restart array and returns the finished block
    /// contents, valid until `reset`.
    pub fn finish(&mut self) -> &[u8] {
        for &restart in &self.restarts {
            put_fixed_32(&mut self.buffer, restart);
        }
        put_fixed_32(&mut self.buffer, self.restarts.len() as u32);
        self.finished = true;
        &self.buffer
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.restarts.clear();
        self.restarts.push(0);
        self.counter = 0;
        self.finished = false;
        self.last_key.clear();
    }

    /// Uncompressed size of the block as built so far.
    pub fn current_size_estimate(&self) -> usize {
        self.buffer.len() + self.restarts.len() * size_of::<u32>() + size_of::<u32>()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    #[inline]
    pub fn last_key(&self) -> &[u8] {
        &self.last_key
    }
}

/// An immutable, decoded block. Cheap to clone; iterators share the
/// underlying bytes.
#[derive(Clone)]
pub struct Block {
    data: Arc<Vec<u8>>,
    /// Offset of the restart array.
    restart_offset: u32,
    num_restarts: u32,
}

impl Block {
    pub fn new(data: Vec<u8>) -> IResult<Self> {
        let n = data.len();
        if n < size_of::<u32>() {
            return Err(Error::Corruption("bad block contents (too short)".to_owned()));
        }
        let num_restarts = decode_fixed_32(&data[n - 4..]);
        let max_restarts = (n - 4) / size_of::<u32>();
        if num_restarts as usize > max_restarts {
            return Err(Error::Corruption(
                "bad block contents (restart array overflows block)".to_owned(),
            ));
        }
        let restart_offset = (n - 4 - 4 * num_restarts as usize) as u32;
        Ok(Block {
            data: Arc::new(data),
            restart_offset,
            num_restarts,
        })
    }

    pub fn iter<C: Comparator>(&self, cmp: C) -> BlockIterator<C> {
        BlockIterator::new(
            cmp,
            self.data.clone(),
            self.restart_offset,
            self.num_restarts,
        )
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Iterates the entries of one block.
pub struct BlockIterator<C: Comparator> {
    cmp: C,
    data: Arc<Vec<u8>>,
    restarts: u32,
    num_restarts: u32,
    /// Offset of the current entry; `== restarts` when exhausted.
    current: u32,
    /// Restart block containing `current`.
    restart_index: u32,
    key: Vec<u8>,
    value_offset: u32,
    value_len: u32,
    err: Option<Error>,
}

impl<C: Comparator> BlockIterator<C> {
    fn new(cmp: C, data: Arc<Vec<u8>>, restarts: u32, num_restarts: u32) -> Self {
        debug_assert!(num_restarts > 0 || restarts as usize + 4 == data.len());
        BlockIterator {
            cmp,
            current: restarts,
            restart_index: num_restarts,
            data,
            restarts,
            num_restarts,
            key: vec![],
            value_offset: 0,
            value_len: 0,
            err: None,
        }
    }

    #[inline]
    fn restart_point(&self, index: u32) -> u32 {
        decode_fixed_32(&self.data[self.restarts as usize + 4 * index as usize..])
    }

    #[inline]
    fn next_entry_offset(&self) -> u32 {
        self.value_offset + self.value_len
    }

    fn seek_to_restart_point(&mut self, index: u32) {
        self.key.clear();
        self.restart_index = index;
        let offset = self.restart_point(index);
        // An empty "value" ending at the restart offset makes
        // `next_entry_offset` land on the first entry of the region.
        self.value_offset = offset;
        self.value_len = 0;
    }

    fn corruption(&mut self) {
        if self.err.is_none() {
            self.err = Some(Error::Corruption("bad entry in block".to_owned()));
        }
        self.current = self.restarts;
        self.restart_index = self.num_restarts;
        self.key.clear();
        self.value_len = 0;
    }

    /// Decodes the entry header at `offset`. Returns
    /// `(shared, non_shared, value_len, key_delta_offset)`.
    fn decode_entry(&self, offset: u32) -> Option<(u32, u32, u32, u32)> {
        let limit = self.restarts as usize;
        let mut src = &self.data[offset as usize..limit];
        let before = src.len();
        let shared = VarintU32::get_varint(&mut src)?;
        let non_shared = VarintU32::get_varint(&mut src)?;
        let value_len = VarintU32::get_varint(&mut src)?;
        let header_len = (before - src.len()) as u32;
        if (non_shared + value_len) as usize > src.len() {
            return None;
        }
        Some((shared, non_shared, value_len, offset + header_len))
    }

    /// Advances to the entry at `next_entry_offset`. Returns false at
    /// the end of the block or on corruption.
    fn parse_next_entry(&mut self) -> bool {
        self.current = self.next_entry_offset();
        if self.current >= self.restarts {
            // Walked off the end.
            self.current = self.restarts;
            self.restart_index = self.num_restarts;
            return false;
        }
        match self.decode_entry(self.current) {
            Some((shared, non_shared, value_len, delta_offset)) if shared as usize <= self.key.len() => {
                self.key.truncate(shared as usize);
                self.key.extend_from_slice(
                    &self.data[delta_offset as usize..(delta_offset + non_shared) as usize],
                );
                self.value_offset = delta_offset + non_shared;
                self.value_len = value_len;
                while self.restart_index + 1 < self.num_restarts
                    && self.restart_point(self.restart_index + 1) < self.current
                {
                    self.restart_index += 1;
                }
                true
            }
            _ => {
                self.corruption();
                false
            }
        }
    }
}

impl<C: Comparator> Iter for BlockIterator<C> {
    fn valid(&self) -> bool {
        self.err.is_none() && self.current < self.restarts
    }

    fn seek_to_first(&mut self) {
        if self.num_restarts == 0 {
            return;
        }
        self.seek_to_restart_point(0);
        self.parse_next_entry();
    }

    fn seek_to_last(&mut self) {
        if self.num_restarts == 0 {
            return;
        }
        self.seek_to_restart_point(self.num_restarts - 1);
        // Scan to the final entry of the block.
        while self.parse_next_entry() && self.next_entry_offset() < self.restarts {}
    }

    fn seek(&mut self, target: &[u8]) {
        if self.num_restarts == 0 {
            return;
        }
        // Binary search for the last restart whose key is < target.
        let mut left = 0u32;
        let mut right = self.num_restarts - 1;
        while left < right {
            let mid = (left + right + 1) / 2;
            match self.decode_entry(self.restart_point(mid)) {
                Some((shared, non_shared, _, delta_offset)) if shared == 0 => {
                    let key = &self.data
                        [delta_offset as usize..(delta_offset + non_shared) as usize];
                    if self.cmp.compare(key, target) == Ordering::Less {
                        left = mid;
                    } else {
                        right = mid - 1;
                    }
                }
                _ => {
                    // A restart entry always has shared == 0.
                    self.corruption();
                    return;
                }
            }
        }
        // Linear scan inside the restart region.
        self.seek_to_restart_point(left);
        loop {
            if !self.parse_next_entry() {
                return;
            }
            if self.cmp.compare(&self.key, target) != Ordering::Less {
                return;
            }
        }
    }

    fn next(&mut self) {
        assert!(self.valid());
        self.parse_next_entry();
    }

    fn prev(&mut self) {
        assert!(self.valid());
        let original = self.current;
        // Back up to the restart region that ends before the current
        // entry.
        while self.restart_point(self.restart_index) >= original {
            if self.restart_index == 0 {
                self.current = self.restarts;
                self.restart_index = self.num_restarts;
                return;
            }
            self.restart_index -= 1;
        }
        self.seek_to_restart_point(self.restart_index);
        // Scan forward until just before `original`.
        while self.parse_next_entry() && self.next_entry_offset() < original {}
    }

    fn key(&self) -> &[u8] {
        assert!(self.valid());
        &self.key
    }

    fn value(&self) -> &[u8] {
        assert!(self.valid());
        &self.data[self.value_offset as usize..(self.value_offset + self.value_len) as usize]
    }

    fn status(&mut self) -> IResult<()> {
        match &self.err {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}
