use crate::error::IResult;
use crate::storage::File;
use crate::util::coding::encode_fixed_32;
use crate::util::crc32;
use crate::wal::{RecordType, BLOCK_SIZE, HEADER_SIZE};

/// Appends records to a log file with the block framing described in the
/// module docs.
pub struct Writer<F: File> {
    dest: F,
    /// Write position inside the current 32 KiB block.
    block_offset: usize,
}

impl<F: File> Writer<F> {
    pub fn new(dest: F) -> Self {
        Writer {
            dest,
            block_offset: 0,
        }
    }

    /// Creates a writer that continues a log already `initial_length`
    /// bytes long (used when reusing a WAL across restarts).
    pub fn new_with_length(dest: F, initial_length: u64) -> Self {
        Writer {
            dest,
            block_offset: initial_length as usize % BLOCK_SIZE,
        }
    }

    /// Appends one logical record, fragmenting it across blocks as
    /// needed. An empty record is valid and emits a single empty
    /// `KFullType` fragment.
    pub fn add_record(&mut self, record: &[u8]) -> IResult<()> {
        let mut left = record;
        let mut begin = true;
        loop {
            let leftover = BLOCK_SIZE - self.block_offset;
            if leftover < HEADER_SIZE {
                // Not enough room for a header; pad the tail and switch
                // to a fresh block.
                if leftover > 0 {
                    self.dest.write_all(&[0u8; HEADER_SIZE - 1][..leftover])?;
                }
                self.block_offset = 0;
            }

            let available = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let fragment_len = left.len().min(available);
            let end = fragment_len == left.len();
            let record_type = match (begin, end) {
                (true, true) => RecordType::KFullType,
                (true, false) => RecordType::KFirstType,
                (false, true) => RecordType::KLastType,
                (false, false) => RecordType::KMiddleType,
            };
            self.emit_physical_record(record_type, &left[..fragment_len])?;
            left = &left[fragment_len..];
            begin = false;
            if end {
                return Ok(());
            }
        }
    }

    /// Flushes buffered bytes to the OS.
    #[inline]
    pub fn flush(&mut self) -> IResult<()> {
        self.dest.flush()
    }

    /// Forces the log contents to stable storage.
    #[inline]
    pub fn sync(&mut self) -> IResult<()> {
        self.dest.sync()
    }

    /// Consumes the writer, returning the underlying file.
    #[inline]
    pub fn into_file(self) -> F {
        self.dest
    }

    fn emit_physical_record(&mut self, t: RecordType, data: &[u8]) -> IResult<()> {
        debug_assert!(
            data.len() <= 0xffff,
            "fragment length {} exceeds the 2-byte length field",
            data.len()
        );
        debug_assert!(self.block_offset + HEADER_SIZE + data.len() <= BLOCK_SIZE);

        let mut header = [0u8; HEADER_SIZE];
        let crc = crc32::mask(crc32::hash_parts(&[&[t as u8], data]));
        encode_fixed_32(&mut header, crc);
        header[4] = (data.len() & 0xff) as u8;
        header[5] = (data.len() >> 8) as u8;
        header[6] = t as u8;

        self.dest.write_all(&header)?;
        self.dest.write_all(data)?;
        self.dest.flush()?;
        self.block_offset += HEADER_SIZE + data.len();
        Ok(())
    }
}
