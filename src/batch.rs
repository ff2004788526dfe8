use crate::db::format::ValueType;
use crate::error::{Error, IResult};
use crate::mem::MemTable;
use crate::util::coding::{decode_fixed_32, decode_fixed_64, encode_fixed_32, encode_fixed_64, VarintU32};
use crate::util::comparator::Comparator;

/// Bytes of the `{u64_le sequence, u32_le count}` header.
pub const BATCH_HEADER_SIZE: usize = 12;

/// A set of updates applied to the database atomically, in insertion
/// order. This is also the unit written to the WAL: the serialized form
/// *is* the log record.
///
/// ```text
///  +---------------------+
///  | sequence (u64 le)   |  sequence of the first entry
///  +---------------------+
///  | count (u32 le)      |
///  +---------------------+
///  | entries...          |
///  +---------------------+
///
///  entry := 0x1 varint(klen) key varint(vlen) value   ; put
///         | 0x0 varint(klen) key                      ; deletion
/// ```
#[derive(Clone)]
pub struct WriteBatch {
    rep: Vec<u8>,
}

impl Default for WriteBatch {
    fn default() -> Self {
        WriteBatch {
            rep: vec![0; BATCH_HEADER_SIZE],
        }
    }
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `key -> value`.
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(ValueType::KTypeValue as u8);
        VarintU32::put_varint_prefixed_slice(&mut self.rep, key);
        VarintU32::put_varint_prefixed_slice(&mut self.rep, value);
    }

    /// Records the erasure of `key`. Deleting an absent key is a no-op
    /// when applied.
    pub fn delete(&mut self, key: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(ValueType::KTypeDeletion as u8);
        VarintU32::put_varint_prefixed_slice(&mut self.rep, key);
    }

    /// Appends all entries of `other` to this batch.
    pub fn append(&mut self, other: &WriteBatch) {
        self.set_count(self.count() + other.count());
        self.rep.extend_from_slice(&other.rep[BATCH_HEADER_SIZE..]);
    }

    /// Drops all entries.
    pub fn clear(&mut self) {
        self.rep.clear();
        self.rep.resize(BATCH_HEADER_SIZE, 0);
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// The serialized size, which is also what this batch will add to
    /// the WAL.
    #[inline]
    pub fn approximate_size(&self) -> usize {
        self.rep.len()
    }

    /// The serialized batch (the WAL record).
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.rep
    }

    /// Adopts a serialized batch, e.g. a record replayed from the WAL.
    pub fn set_contents(&mut self, data: &[u8]) -> IResult<()> {
        if data.len() < BATCH_HEADER_SIZE {
            return Err(Error::Corruption("malformed WriteBatch (too small)".to_owned()));
        }
        self.rep.clear();
        self.rep.extend_from_slice(data);
        Ok(())
    }

    #[inline]
    pub fn count(&self) -> u32 {
        decode_fixed_32(&self.rep[8..])
    }

    pub(crate) fn set_count(&mut self, count: u32) {
        encode_fixed_32(&mut self.rep[8..], count)
    }

    /// Sequence number assigned to the first entry.
    #[inline]
    pub fn sequence(&self) -> u64 {
        decode_fixed_64(&self.rep)
    }

    pub(crate) fn set_sequence(&mut self, seq: u64) {
        encode_fixed_64(&mut self.rep, seq)
    }

    /// Decodes the entries.
    pub fn iter(&self) -> BatchIter<'_> {
        BatchIter {
            src: &self.rep[BATCH_HEADER_SIZE..],
            corrupted: false,
        }
    }

    /// Applies every entry to `mem`, assigning consecutive sequence
    /// numbers starting from this batch's sequence.
    pub fn insert_into<C: Comparator>(&self, mem: &MemTable<C>) -> IResult<()> {
        let mut seq = self.sequence();
        let mut applied = 0u32;
        for entry in self.iter() {
            match entry? {
                BatchEntry::Put { key, value } => mem.add(seq, ValueType::KTypeValue, key, value),
                BatchEntry::Deletion { key } => mem.add(seq, ValueType::KTypeDeletion, key, b""),
            }
            seq += 1;
            applied += 1;
        }
        if applied != self.count() {
            return Err(Error::Corruption("WriteBatch has wrong count".to_owned()));
        }
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum BatchEntry<'a> {
    Put { key: &'a [u8], value: &'a [u8] },
    Deletion { key: &'a [u8] },
}

/// Decodes batch entries in order, yielding `Corruption` on a malformed
/// tail and stopping afterwards.
pub struct BatchIter<'a> {
    src: &'a [u8],
    corrupted: bool,
}

impl<'a> Iterator for BatchIter<'a> {
    type Item = IResult<BatchEntry<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.corrupted || self.src.is_empty() {
            return None;
        }
        let tag = self.src[0];
        self.src = &self.src[1..];
        match ValueType::from(u64::from(tag)) {
            ValueType::KTypeValue => {
                match (
                    VarintU32::get_varint_prefixed_slice(&mut self.src),
                    VarintU32::get_varint_prefixed_slice(&mut self.src),
                ) {
                    (Some(key), Some(value)) => Some(Ok(BatchEntry::Put { key, value })),
                    _ => {
                        self.corrupted = true;
                        Some(Err(Error::Corruption("bad WriteBatch put".to_owned())))
                    }
                }
            }
            ValueType::KTypeDeletion => match VarintU32::get_varint_prefixed_slice(&mut self.src) {
                Some(key) => Some(Ok(BatchEntry::Deletion { key })),
                None => {
                    self.corrupted = true;
                    Some(Err(Error::Corruption("bad WriteBatch delete".to_owned())))
                }
            },
            ValueType::Unknown => {
                self.corrupted = true;
                Some(Err(Error::Corruption(format!(
                    "unknown WriteBatch entry tag: {}",
                    tag
                ))))
            }
        }
    }
}
