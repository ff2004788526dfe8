use std::sync::Arc;

use crate::filter::FilterPolicy;
use crate::util::coding::{decode_fixed_32, put_fixed_32};

/// Every 2 KiB window of table-file offset space gets its own filter.
const FILTER_BASE_LG: u32 = 11;
const FILTER_BASE: u64 = 1 << FILTER_BASE_LG;

/// Accumulates the filter block of a table under construction:
///
/// ```text
///     +---------------+---------------+---------------+----------+
///     | filter data 0 |      ...      | filter data n | trailer  |
///     +---------------+---------------+---------------+----------+
///
///     trailer := u32 offset of each filter datum,
///                u32 offset of the offset array,
///                u8 base lg (11)
/// ```
///
/// Filter `i` covers the keys of entries whose data block starts in
/// `[i << 11, (i+1) << 11)`.
pub struct FilterBlockBuilder {
    policy: Arc<dyn FilterPolicy>,
    /// Keys added since the last filter was generated.
    keys: Vec<Vec<u8>>,
    result: Vec<u8>,
    filter_offsets: Vec<u32>,
}

impl FilterBlockBuilder {
    pub fn new(policy: Arc<dyn FilterPolicy>) -> Self {
        FilterBlockBuilder {
            policy,
            keys: vec![],
            result: vec![],
            filter_offsets: vec![],
        }
    }

    /// Declares that the next data block begins at `block_offset`,
    /// sealing filters for every 2 KiB window before it.
    pub fn start_block(&mut self, block_offset: u64) {
        let filter_index = block_offset / FILTER_BASE;
        assert!(filter_index >= self.filter_offsets.len() as u64);
        while filter_index > self.filter_offsets.len() as u64 {
            self.generate_filter();
        }
    }

    pub fn add_key(&mut self, key: &[u8]) {
        self.keys.push(key.to_vec());
    }

    /// Seals the block and returns its contents.
    pub fn finish(&mut self) -> &[u8] {
        if !self.keys.is_empty() {
            self.generate_filter();
        }
        let array_offset = self.result.len() as u32;
        for i in 0..self.filter_offsets.len() {
            let offset = self.filter_offsets[i];
            put_fixed_32(&mut self.result, offset);
        }
        put_fixed_32(&mut self.result, array_offset);
        self.result.push(FILTER_BASE_LG as u8);
        &self.result
    }

    fn generate_filter(&mut self) {
        self.filter_offsets.push(self.result.len() as u32);
        if self.keys.is_empty() {
            // An empty window: its offset equals the next one's, which
            // the reader sees as a zero-length filter.
            return;
        }
        self.policy.append_filter(&self.keys, &mut self.result);
        self.keys.clear();
    }
}

/// Reads membership answers back out of a table's filter block.
pub struct FilterBlockReader {
    policy: Arc<dyn FilterPolicy>,
    data: Vec<u8>,
    /// Start of the offset array within `data`.
    offset_array_start: usize,
    num_filters: usize,
    base_lg: u32,
}

impl FilterBlockReader {
    pub fn new(policy: Arc<dyn FilterPolicy>, data: Vec<u8>) -> Self {
        let mut reader = FilterBlockReader {
            policy,
            data: vec![],
            offset_array_start: 0,
            num_filters: 0,
            base_lg: 0,
        };
        let n = data.len();
        if n < 5 {
            // 1 byte base lg + 4 bytes array offset at minimum.
            return reader;
        }
        let base_lg = data[n - 1] as u32;
        let array_offset = decode_fixed_32(&data[n - 5..]) as usize;
        if array_offset > n - 5 {
            return reader;
        }
        reader.base_lg = base_lg;
        reader.offset_array_start = array_offset;
        reader.num_filters = (n - 5 - array_offset) / 4;
        reader.data = data;
        reader
    }

    /// Whether `key` may be present in the data block starting at
    /// `block_offset`. False positives are possible, false negatives are
    /// not.
    pub fn key_may_match(&self, block_offset: u64, key: &[u8]) -> bool {
        let index = (block_offset >> self.base_lg) as usize;
        if index >= self.num_filters {
            // Out of range: be permissive, the block read will decide.
            return true;
        }
        let start =
            decode_fixed_32(&self.data[self.offset_array_start + index * 4..]) as usize;
        // The entry after the last filter offset is the array-offset
        // word itself, which equals the total filter data length.
        let limit =
            decode_fixed_32(&self.data[self.offset_array_start + index * 4 + 4..]) as usize;
        if start <= limit && limit <= self.offset_array_start {
            if start == limit {
                // Empty window: nothing was in this block.
                return false;
            }
            return self.policy.key_may_match(&self.data[start..limit], key);
        }
        // Corrupt offsets: err on the side of a match.
        true
    }
}
