use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::db::format::InternalKey;
use crate::error::{Error, IResult};
use crate::util::coding::{VarintU32, VarintU64};

/// Metadata for one table file, as tracked by versions and journalled in
/// the manifest.
pub struct FileMetaData {
    pub number: u64,
    pub file_size: u64,
    /// Smallest internal key served by the table.
    pub smallest: InternalKey,
    /// Largest internal key served by the table.
    pub largest: InternalKey,
    /// Seeks this file may "waste" before it becomes a compaction
    /// candidate. One compaction of a byte costs about as much as 25
    /// seeks do, so with 16 KiB per seek the file pays for its own
    /// compaction once the counter runs out.
    pub allowed_seeks: AtomicI64,
}

impl FileMetaData {
    pub fn new(number: u64, file_size: u64, smallest: InternalKey, largest: InternalKey) -> Self {
        let f = FileMetaData {
            number,
            file_size,
            smallest,
            largest,
            allowed_seeks: AtomicI64::new(0),
        };
        f.init_allowed_seeks();
        f
    }

    pub fn init_allowed_seeks(&self) {
        let seeks = (self.file_size / 16384).max(100) as i64;
        self.allowed_seeks.store(seeks, Ordering::Release);
    }

    /// Charges one seek; true when the budget just ran out.
    pub fn charge_seek(&self) -> bool {
        self.allowed_seeks.fetch_sub(1, Ordering::AcqRel) == 1
    }
}

impl Default for FileMetaData {
    fn default() -> Self {
        FileMetaData {
            number: 0,
            file_size: 0,
            smallest: InternalKey::default(),
            largest: InternalKey::default(),
            allowed_seeks: AtomicI64::new(0),
        }
    }
}

impl PartialEq for FileMetaData {
    fn eq(&self, other: &Self) -> bool {
        self.number == other.number
            && self.file_size == other.file_size
            && self.smallest == other.smallest
            && self.largest == other.largest
    }
}

impl Eq for FileMetaData {}

impl fmt::Debug for FileMetaData {
    // allowed_seeks is runtime state, not identity; keep it out of the
    // rendered form.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileMetaData")
            .field("number", &self.number)
            .field("file_size", &self.file_size)
            .field("smallest", &self.smallest)
            .field("largest", &self.largest)
            .finish()
    }
}

/// The per-level file changes carried by a `VersionEdit`.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct FileDelta {
    /// Resume points for round-robin compaction, per level.
    pub compaction_pointers: Vec<(usize, InternalKey)>,
    pub deleted_files: HashSet<(usize, u64)>,
    pub new_files: Vec<(usize, FileMetaData)>,
}

// Manifest record tags. The values are part of the on-disk format.
const TAG_COMPARATOR: u64 = 1;
const TAG_LOG_NUMBER: u64 = 2;
const TAG_NEXT_FILE_NUMBER: u64 = 3;
const TAG_LAST_SEQUENCE: u64 = 4;
const TAG_COMPACT_POINTER: u64 = 5;
const TAG_DELETED_FILE: u64 = 6;
const TAG_NEW_FILE: u64 = 7;
// 8 was used by a long-gone format revision.
const TAG_PREV_LOG_NUMBER: u64 = 9;

/// One journalled delta of the version state. The manifest is a record
/// log of these; replaying them in order reproduces the live file set
/// and counters.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct VersionEdit {
    pub comparator_name: Option<String>,
    pub log_number: Option<u64>,
    pub prev_log_number: Option<u64>,
    pub next_file_number: Option<u64>,
    pub last_sequence: Option<u64>,
    pub file_delta: FileDelta,
}

impl VersionEdit {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn set_comparator_name(&mut self, name: String) {
        self.comparator_name = Some(name);
    }

    #[inline]
    pub fn set_log_number(&mut self, n: u64) {
        self.log_number = Some(n);
    }

    #[inline]
    pub fn set_prev_log_number(&mut self, n: u64) {
        self.prev_log_number = Some(n);
    }

    #[inline]
    pub fn set_next_file_number(&mut self, n: u64) {
        self.next_file_number = Some(n);
    }

    #[inline]
    pub fn set_last_sequence(&mut self, n: u64) {
        self.last_sequence = Some(n);
    }

    pub fn add_file(
        &mut self,
        level: usize,
        number: u64,
        file_size: u64,
        smallest: InternalKey,
        largest: InternalKey,
    ) {
        self.file_delta
            .new_files
            .push((level, FileMetaData::new(number, file_size, smallest, largest)));
    }

    pub fn delete_file(&mut self, level: usize, number: u64) {
        self.file_delta.deleted_files.insert((level, number));
    }

    pub fn set_compact_pointer(&mut self, level: usize, key: InternalKey) {
        self.file_delta.compaction_pointers.push((level, key));
    }

    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        if let Some(name) = &self.comparator_name {
            VarintU64::put_varint(dst, TAG_COMPARATOR);
            VarintU32::put_varint_prefixed_slice(dst, name.as_bytes());
        }
        if let Some(n) = self.log_number {
            VarintU64::put_varint(dst, TAG_LOG_NUMBER);
            VarintU64::put_varint(dst, n);
        }
        if let Some(n) = self.prev_log_number {
            VarintU64::put_varint(dst, TAG_PREV_LOG_NUMBER);
            VarintU64::put_varint(dst, n);
        }
        if let Some(n) = self.next_file_number {
            VarintU64::put_varint(dst, TAG_NEXT_FILE_NUMBER);
            VarintU64::put_varint(dst, n);
        }
        if let Some(n) = self.last_sequence {
            VarintU64::put_varint(dst, TAG_LAST_SEQUENCE);
            VarintU64::put_varint(dst, n);
        }
        for (level, key) in &self.file_delta.compaction_pointers {
            VarintU64::put_varint(dst, TAG_COMPACT_POINTER);
            VarintU32::put_varint(dst, *level as u32);
            VarintU32::put_varint_prefixed_slice(dst, key.data());
        }
        for (level, number) in &self.file_delta.deleted_files {
            VarintU64::put_varint(dst, TAG_DELETED_FILE);
            VarintU32::put_varint(dst, *level as u32);
            VarintU64::put_varint(dst, *number);
        }
        for (level, f) in &self.file_delta.new_files {
            VarintU64::put_varint(dst, TAG_NEW_FILE);
            VarintU32::put_varint(dst, *level as u32);
            VarintU64::put_varint(dst, f.number);
            VarintU64::put_varint(dst, f.file_size);
            VarintU32::put_varint_prefixed_slice(dst, f.smallest.data());
            VarintU32::put_varint_prefixed_slice(dst, f.largest.data());
        }
    }

    pub fn decoded_from(&mut self, mut src: &[u8]) -> IResult<()> {
        *self = VersionEdit::default();
        while !src.is_empty() {
            let tag = VarintU64::get_varint(&mut src)
                .ok_or_else(|| corrupt("edit tag"))?;
            match tag {
                TAG_COMPARATOR => {
                    let name = VarintU32::get_varint_prefixed_slice(&mut src)
                        .ok_or_else(|| corrupt("comparator name"))?;
                    self.comparator_name = Some(
                        String::from_utf8(name.to_vec())
                            .map_err(|_| corrupt("comparator name"))?,
                    );
                }
                TAG_LOG_NUMBER => {
                    self.log_number =
                        Some(VarintU64::get_varint(&mut src).ok_or_else(|| corrupt("log number"))?);
                }
                TAG_PREV_LOG_NUMBER => {
                    self.prev_log_number = Some(
                        VarintU64::get_varint(&mut src)
                            .ok_or_else(|| corrupt("previous log number"))?,
                    );
                }
                TAG_NEXT_FILE_NUMBER => {
                    self.next_file_number = Some(
                        VarintU64::get_varint(&mut src)
                            .ok_or_else(|| corrupt("next file number"))?,
                    );
                }
                TAG_LAST_SEQUENCE => {
                    self.last_sequence = Some(
                        VarintU64::get_varint(&mut src)
                            .ok_or_else(|| corrupt("last sequence number"))?,
                    );
                }
                TAG_COMPACT_POINTER => {
                    let level = decode_level(&mut src)?;
                    let key = VarintU32::get_varint_prefixed_slice(&mut src)
                        .ok_or_else(|| corrupt("compaction pointer"))?;
                    self.file_delta
                        .compaction_pointers
                        .push((level, InternalKey::decoded_from(key)));
                }
                TAG_DELETED_FILE => {
                    let level = decode_level(&mut src)?;
                    let number = VarintU64::get_varint(&mut src)
                        .ok_or_else(|| corrupt("deleted file"))?;
                    self.file_delta.deleted_files.insert((level, number));
                }
                TAG_NEW_FILE => {
                    let level = decode_level(&mut src)?;
                    let number =
                        VarintU64::get_varint(&mut src).ok_or_else(|| corrupt("new-file entry"))?;
                    let file_size =
                        VarintU64::get_varint(&mut src).ok_or_else(|| corrupt("new-file entry"))?;
                    let smallest = VarintU32::get_varint_prefixed_slice(&mut src)
                        .ok_or_else(|| corrupt("new-file entry"))?;
                    let largest = VarintU32::get_varint_prefixed_slice(&mut src)
                        .ok_or_else(|| corrupt("new-file entry"))?;
                    self.file_delta.new_files.push((
                        level,
                        FileMetaData::new(
                            number,
                            file_size,
                            InternalKey::decoded_from(smallest),
                            InternalKey::decoded_from(largest),
                        ),
                    ));
                }
                unknown => {
                    return Err(corrupt(&format!("unknown tag: {}", unknown)));
                }
            }
        }
        Ok(())
    }
}

fn corrupt(what: &str) -> Error {
    Error::Corruption(format!("VersionEdit: {}", what))
}

fn decode_level(src: &mut &[u8]) -> IResult<usize> {
    let level = VarintU32::get_varint(src).ok_or_else(|| corrupt("level"))? as usize;
    if level >= crate::db::format::NUM_LEVELS {
        return Err(corrupt(&format!("over-large level: {}", level)));
    }
    Ok(level)
}
