//! The append-only record log used both for the write-ahead log and the
//! manifest. A file is a sequence of 32 KiB blocks; a logical record is
//! split into physical records that never cross a block boundary:
//!
//! ```text
//!     +---------+-----------+-----------+--- ... ---+
//!     | crc (4) | length(2) | type (1)  |  payload  |
//!     +---------+-----------+-----------+--- ... ---+
//! ```
//!
//! `crc` is the masked crc32c of the type byte and payload. A block tail
//! shorter than the 7-byte header is zero-padded and skipped by readers.

pub mod reader;
pub mod writer;

pub const BLOCK_SIZE: usize = 32768;

/// crc (4) + length (2) + type (1).
pub const HEADER_SIZE: usize = 7;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    /// Reserved for zero-padded tails and preallocated files.
    KZeroType = 0,
    /// A record contained entirely in one block.
    KFullType = 1,
    /// First fragment of a record spanning blocks.
    KFirstType = 2,
    KMiddleType = 3,
    KLastType = 4,
}

pub const MAX_RECORD_TYPE: u8 = RecordType::KLastType as u8;

impl From<u8> for RecordType {
    fn from(v: u8) -> Self {
        match v {
            1 => RecordType::KFullType,
            2 => RecordType::KFirstType,
            3 => RecordType::KMiddleType,
            4 => RecordType::KLastType,
            _ => RecordType::KZeroType,
        }
    }
}
