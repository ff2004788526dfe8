use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::filter::FilterPolicy;
use crate::util::coding::{decode_fixed_64, put_fixed_64, VarintU32};
use crate::util::comparator::Comparator;

/// Number of levels an LSM tree has.
pub const NUM_LEVELS: usize = 7;

/// Level-0 compaction starts when this many files accumulate.
pub const L0_COMPACTION_TRIGGER: usize = 4;

/// Writers are slowed down (one 1ms sleep) at this many level-0 files.
pub const L0_SLOWDOWN_WRITES_TRIGGER: usize = 8;

/// Writers stall entirely at this many level-0 files.
pub const L0_STOP_WRITES_TRIGGER: usize = 12;

/// Maximum level to which a new memtable flush may be pushed if it does
/// not overlap the levels in between. Larger levels would make compaction
/// of a hot range expensive and make every flush pay two level checks.
pub const MAX_MEM_COMPACT_LEVEL: usize = 2;

/// The tail of an internal key: 7 bytes of sequence plus 1 byte of type.
pub const INTERNAL_KEY_TAIL: usize = 8;

/// Sequence numbers are packed into 56 bits, leaving the low byte of the
/// tail for the value type.
pub const MAX_SEQUENCE_NUMBER: u64 = (1u64 << 56) - 1;

#[repr(u8)]
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ValueType {
    KTypeDeletion = 0x0,
    KTypeValue = 0x1,
    Unknown,
}

/// When seeking, entries with the same user key but larger sequence sort
/// first, so a lookup tag uses the largest type value.
pub const VALUE_TYPE_FOR_SEEK: ValueType = ValueType::KTypeValue;

impl From<u64> for ValueType {
    fn from(v: u64) -> Self {
        match v {
            0x0 => ValueType::KTypeDeletion,
            0x1 => ValueType::KTypeValue,
            _ => ValueType::Unknown,
        }
    }
}

/// Packs a sequence number and a value type into the 8-byte tail.
#[inline]
pub fn pack_seq_and_type(seq: u64, t: ValueType) -> u64 {
    assert!(seq <= MAX_SEQUENCE_NUMBER, "sequence {} out of range", seq);
    seq << 8 | t as u64
}

/// Extracts `(sequence, type)` from an encoded tail.
#[inline]
pub fn unpack_seq_and_type(tag: u64) -> (u64, ValueType) {
    (tag >> 8, ValueType::from(tag & 0xff))
}

/// Extracts the user key portion of an encoded internal key.
///
/// # Panics
///
/// If `ikey` is shorter than the 8-byte tail.
#[inline]
pub fn extract_user_key(ikey: &[u8]) -> &[u8] {
    assert!(
        ikey.len() >= INTERNAL_KEY_TAIL,
        "invalid internal key length {}",
        ikey.len()
    );
    &ikey[..ikey.len() - INTERNAL_KEY_TAIL]
}

/// An internal key destructured into its three components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedInternalKey<'a> {
    pub user_key: &'a [u8],
    pub seq: u64,
    pub value_type: ValueType,
}

impl<'a> ParsedInternalKey<'a> {
    pub fn new(user_key: &'a [u8], seq: u64, value_type: ValueType) -> Self {
        Self {
            user_key,
            seq,
            value_type,
        }
    }

    /// Decodes `ikey`. Returns `None` when the key is too short or its
    /// type byte is unknown.
    pub fn decode_from(ikey: &'a [u8]) -> Option<ParsedInternalKey<'a>> {
        if ikey.len() < INTERNAL_KEY_TAIL {
            return None;
        }
        let (seq, value_type) = unpack_seq_and_type(decode_fixed_64(&ikey[ikey.len() - INTERNAL_KEY_TAIL..]));
        if value_type == ValueType::Unknown {
            return None;
        }
        Some(ParsedInternalKey {
            user_key: extract_user_key(ikey),
            seq,
            value_type,
        })
    }
}

/// An owned internal key: `user_key ‖ u64_le((seq << 8) | type)`.
#[derive(Default, Clone, PartialEq, Eq)]
pub struct InternalKey {
    data: Vec<u8>,
}

impl InternalKey {
    pub fn new(user_key: &[u8], seq: u64, t: ValueType) -> Self {
        let mut data = Vec::with_capacity(user_key.len() + INTERNAL_KEY_TAIL);
        data.extend_from_slice(user_key);
        put_fixed_64(&mut data, pack_seq_and_type(seq, t));
        InternalKey { data }
    }

    pub fn decoded_from(src: &[u8]) -> Self {
        InternalKey { data: src.to_vec() }
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn user_key(&self) -> &[u8] {
        extract_user_key(&self.data)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for InternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match ParsedInternalKey::decode_from(&self.data) {
            Some(parsed) => write!(
                f,
                "{:?} @ {} : {:?}",
                String::from_utf8_lossy(parsed.user_key),
                parsed.seq,
                parsed.value_type
            ),
            None => write!(f, "(bad){:?}", &self.data),
        }
    }
}

/// A `Get` request key. Laid out so that all three spellings of the key
/// can be borrowed from one buffer:
///
/// ```text
///   +---------------------------------+
///   | varint32 of internal key length |
///   +---------------------------------+ ---- user key start
///   | user key bytes                  |
///   +---------------------------------+      internal key
///   | sequence (7)        |  type (1) |
///   +---------------------------------+ ----
/// ```
pub struct LookupKey {
    data: Vec<u8>,
    user_key_start: usize,
}

impl LookupKey {
    pub fn new(user_key: &[u8], seq: u64) -> Self {
        let mut data = vec![];
        VarintU32::put_varint(&mut data, (user_key.len() + INTERNAL_KEY_TAIL) as u32);
        let user_key_start = data.len();
        data.extend_from_slice(user_key);
        put_fixed_64(&mut data, pack_seq_and_type(seq, VALUE_TYPE_FOR_SEEK));
        LookupKey {
            data,
            user_key_start,
        }
    }

    /// The full key as stored in memtables.
    #[inline]
    pub fn mem_key(&self) -> &[u8] {
        &self.data
    }

    /// The internal key portion, as stored in tables.
    #[inline]
    pub fn internal_key(&self) -> &[u8] {
        &self.data[self.user_key_start..]
    }

    #[inline]
    pub fn user_key(&self) -> &[u8] {
        &self.data[self.user_key_start..self.data.len() - INTERNAL_KEY_TAIL]
    }
}

/// Orders internal keys by user key ascending (per the user comparator),
/// then sequence descending, then type descending, so the newest entry
/// for a user key is encountered first.
#[derive(Clone, Default)]
pub struct InternalKeyComparator<C: Comparator> {
    pub user_comparator: C,
}

impl<C: Comparator> InternalKeyComparator<C> {
    pub fn new(user_comparator: C) -> Self {
        Self { user_comparator }
    }
}

impl<C: Comparator> Comparator for InternalKeyComparator<C> {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self
            .user_comparator
            .compare(extract_user_key(a), extract_user_key(b))
        {
            Ordering::Equal => {
                let tag_a = decode_fixed_64(&a[a.len() - INTERNAL_KEY_TAIL..]);
                let tag_b = decode_fixed_64(&b[b.len() - INTERNAL_KEY_TAIL..]);
                // Descending by tag: bigger sequence sorts first.
                tag_b.cmp(&tag_a)
            }
            ord => ord,
        }
    }

    fn name(&self) -> &str {
        "leveldb.InternalKeyComparator"
    }

    fn find_shortest_separator(&self, start: &[u8], limit: &[u8]) -> Vec<u8> {
        let user_start = extract_user_key(start);
        let user_limit = extract_user_key(limit);
        let mut sep = self
            .user_comparator
            .find_shortest_separator(user_start, user_limit);
        if sep.len() < user_start.len()
            && self.user_comparator.compare(user_start, &sep) == Ordering::Less
        {
            // The user key grew shorter; tag it so it sorts before every
            // real entry with the same user key.
            put_fixed_64(
                &mut sep,
                pack_seq_and_type(MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK),
            );
            debug_assert_eq!(self.compare(start, &sep), Ordering::Less);
            debug_assert_eq!(self.compare(&sep, limit), Ordering::Less);
            return sep;
        }
        start.to_vec()
    }

    fn find_short_successor(&self, key: &[u8]) -> Vec<u8> {
        let user_key = extract_user_key(key);
        let mut succ = self.user_comparator.find_short_successor(user_key);
        if succ.len() < user_key.len()
            && self.user_comparator.compare(user_key, &succ) == Ordering::Less
        {
            put_fixed_64(
                &mut succ,
                pack_seq_and_type(MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK),
            );
            debug_assert_eq!(self.compare(key, &succ), Ordering::Less);
            return succ;
        }
        key.to_vec()
    }
}

/// Wraps the user filter policy so that filters are built over and probed
/// with user keys even though tables store internal keys.
#[derive(Clone)]
pub struct InternalFilterPolicy {
    user_policy: Arc<dyn FilterPolicy>,
}

impl InternalFilterPolicy {
    pub fn new(user_policy: Arc<dyn FilterPolicy>) -> Self {
        Self { user_policy }
    }
}

impl FilterPolicy for InternalFilterPolicy {
    fn name(&self) -> &str {
        // Deliberately the user policy's name: the filter contents match
        // what that policy would build over bare user keys.
        self.user_policy.name()
    }

    fn append_filter(&self, keys: &[Vec<u8>], dst: &mut Vec<u8>) {
        let user_keys: Vec<Vec<u8>> = keys
            .iter()
            .map(|ikey| extract_user_key(ikey).to_vec())
            .collect();
        self.user_policy.append_filter(&user_keys, dst)
    }

    fn key_may_match(&self, filter: &[u8], key: &[u8]) -> bool {
        self.user_policy.key_may_match(filter, extract_user_key(key))
    }
}
