use crate::error::IResult;
use crate::storage::File;
use crate::util::coding::decode_fixed_32;
use crate::util::crc32;
use crate::wal::{RecordType, BLOCK_SIZE, HEADER_SIZE};

/// Receives notice of corrupt or dropped log regions during a read pass.
/// Recovery installs a reporter that either records the first corruption
/// (paranoid mode) or merely counts it.
pub trait Reporter {
    /// `bytes` is the approximate number of bytes dropped.
    fn corruption(&mut self, bytes: u64, reason: &str);
}

enum ReadError {
    Eof,
    BadRecord,
}

/// Reads logical records back out of a log file, reassembling fragments
/// and validating checksums.
pub struct Reader<F: File> {
    file: F,
    reporter: Option<Box<dyn Reporter>>,
    checksum: bool,
    /// One block of the file; `buf[consumed..filled]` is unparsed.
    buf: Vec<u8>,
    consumed: usize,
    filled: usize,
    /// The last file read returned less than a whole block.
    eof: bool,
    /// Offset of the first record at or after `initial_offset` that was
    /// returned by `read_record`.
    last_record_offset: u64,
    /// File offset one past the bytes currently in `buf`.
    end_of_buffer_offset: u64,
    initial_offset: u64,
    /// After seeking into the middle of the log, fragments without their
    /// `KFirstType` are silently dropped until a record boundary.
    resyncing: bool,
}

impl<F: File> Reader<F> {
    pub fn new(
        file: F,
        reporter: Option<Box<dyn Reporter>>,
        checksum: bool,
        initial_offset: u64,
    ) -> Self {
        Reader {
            file,
            reporter,
            checksum,
            buf: vec![0; BLOCK_SIZE],
            consumed: 0,
            filled: 0,
            eof: false,
            last_record_offset: 0,
            end_of_buffer_offset: 0,
            initial_offset,
            resyncing: initial_offset > 0,
        }
    }

    /// Reads the next logical record into `record`. Returns false at the
    /// end of the log. Corrupt regions are reported and skipped.
    pub fn read_record(&mut self, record: &mut Vec<u8>) -> bool {
        if self.last_record_offset < self.initial_offset && !self.skip_to_initial_block() {
            return false;
        }
        record.clear();
        let mut in_fragmented_record = false;
        // Offset of the logical record being assembled.
        let mut prospective_offset = 0u64;

        loop {
            match self.read_physical_record() {
                Ok((record_type, start, len)) => {
                    if self.resyncing {
                        match record_type {
                            RecordType::KMiddleType => continue,
                            RecordType::KLastType => {
                                self.resyncing = false;
                                continue;
                            }
                            _ => self.resyncing = false,
                        }
                    }

                    let physical_offset = self.end_of_buffer_offset
                        - (self.filled - self.consumed) as u64
                        - HEADER_SIZE as u64
                        - len as u64;

                    match record_type {
                        RecordType::KFullType => {
                            if in_fragmented_record {
                                self.report(record.len() as u64, "partial record without end(1)");
                            }
                            record.clear();
                            record.extend_from_slice(&self.buf[start..start + len]);
                            self.last_record_offset = physical_offset;
                            return true;
                        }
                        RecordType::KFirstType => {
                            if in_fragmented_record {
                                self.report(record.len() as u64, "partial record without end(2)");
                            }
                            prospective_offset = physical_offset;
                            record.clear();
                            record.extend_from_slice(&self.buf[start..start + len]);
                            in_fragmented_record = true;
                        }
                        RecordType::KMiddleType => {
                            if !in_fragmented_record {
                                self.report(len as u64, "missing start of fragmented record(1)");
                            } else {
                                record.extend_from_slice(&self.buf[start..start + len]);
                            }
                        }
                        RecordType::KLastType => {
                            if !in_fragmented_record {
                                self.report(len as u64, "missing start of fragmented record(2)");
                            } else {
                                record.extend_from_slice(&self.buf[start..start + len]);
                                self.last_record_offset = prospective_offset;
                                return true;
                            }
                        }
                        RecordType::KZeroType => {
                            // Zero-padding should have been consumed as a
                            // bad record already.
                            self.report(len as u64, "unexpected zero-type record");
                            record.clear();
                            in_fragmented_record = false;
                        }
                    }
                }
                Err(ReadError::Eof) => {
                    if in_fragmented_record {
                        // The writer died mid-record; the partial tail is
                        // not an error.
                        record.clear();
                    }
                    return false;
                }
                Err(ReadError::BadRecord) => {
                    if in_fragmented_record {
                        self.report(record.len() as u64, "error in middle of record");
                        in_fragmented_record = false;
                        record.clear();
                    }
                }
            }
        }
    }

    /// Offset of the last record returned by `read_record`.
    #[inline]
    pub fn last_record_offset(&self) -> u64 {
        self.last_record_offset
    }

    /// Consumes the reader, returning the underlying file (used when the
    /// recovered log is reused for appending).
    #[inline]
    pub fn into_file(self) -> F {
        self.file
    }

    /// Returns `(type, payload start, payload length)` of the next
    /// physical record; the payload lives in `self.buf`.
    fn read_physical_record(&mut self) -> Result<(RecordType, usize, usize), ReadError> {
        loop {
            if self.filled - self.consumed < HEADER_SIZE {
                // Remainder of the block is padding (or a header torn by
                // a crash); refill from the file.
                self.consumed = 0;
                self.filled = 0;
                if self.eof {
                    return Err(ReadError::Eof);
                }
                match self.file.read(&mut self.buf) {
                    Ok(n) => {
                        self.end_of_buffer_offset += n as u64;
                        self.filled = n;
                        if n < BLOCK_SIZE {
                            self.eof = true;
                        }
                        continue;
                    }
                    Err(e) => {
                        self.report(BLOCK_SIZE as u64, &e.to_string());
                        self.eof = true;
                        return Err(ReadError::Eof);
                    }
                }
            }

            let header = &self.buf[self.consumed..self.consumed + HEADER_SIZE];
            let length = header[4] as usize | (header[5] as usize) << 8;
            let record_type = header[6];

            if self.consumed + HEADER_SIZE + length > self.filled {
                let drop_size = self.filled - self.consumed;
                self.consumed = self.filled;
                if !self.eof {
                    self.report(drop_size as u64, "bad record length");
                    return Err(ReadError::BadRecord);
                }
                // A record truncated by a crash during write; not an
                // error.
                return Err(ReadError::Eof);
            }

            if record_type == 0 && length == 0 {
                // Zero-filled region (e.g. preallocated file space).
                self.consumed = self.filled;
                return Err(ReadError::BadRecord);
            }

            if self.checksum {
                let expected = crc32::unmask(decode_fixed_32(header));
                let actual = crc32::hash(
                    &self.buf[self.consumed + HEADER_SIZE - 1..self.consumed + HEADER_SIZE + length],
                );
                if expected != actual {
                    // The length field itself may be corrupt; trusting it
                    // could resynchronize onto garbage that happens to
                    // look like a record. Drop the whole rest of the
                    // block instead.
                    let drop_size = self.filled - self.consumed;
                    self.consumed = self.filled;
                    self.report(drop_size as u64, "checksum mismatch");
                    return Err(ReadError::BadRecord);
                }
            }

            let start = self.consumed + HEADER_SIZE;
            self.consumed += HEADER_SIZE + length;

            // Skip physical records that started before initial_offset.
            if (self.end_of_buffer_offset as i64
                - (self.filled - self.consumed) as i64
                - HEADER_SIZE as i64
                - length as i64)
                < self.initial_offset as i64
            {
                return Err(ReadError::BadRecord);
            }

            return Ok((RecordType::from(record_type), start, length));
        }
    }

    /// Positions the file at the first block containing `initial_offset`.
    fn skip_to_initial_block(&mut self) -> bool {
        let offset_in_block = self.initial_offset as usize % BLOCK_SIZE;
        let mut block_start = self.initial_offset - offset_in_block as u64;
        // A tail shorter than a header belongs to the next block.
        if offset_in_block > BLOCK_SIZE - HEADER_SIZE + 1 {
            block_start += BLOCK_SIZE as u64;
        }
        self.end_of_buffer_offset = block_start;
        if block_start > 0 {
            if let Err(e) = self.file.seek(std::io::SeekFrom::Start(block_start)) {
                self.report(block_start, &e.to_string());
                return false;
            }
        }
        true
    }

    fn report(&mut self, bytes: u64, reason: &str) {
        if let Some(reporter) = self.reporter.as_mut() {
            reporter.corruption(bytes, reason);
        }
    }
}

/// A reporter that only counts dropped bytes, for non-paranoid recovery.
#[derive(Default)]
pub struct DroppedBytesCounter {
    pub dropped: u64,
}

impl Reporter for DroppedBytesCounter {
    fn corruption(&mut self, bytes: u64, _reason: &str) {
        self.dropped += bytes;
    }
}

pub fn read_all_records<F: File>(file: F) -> IResult<Vec<Vec<u8>>> {
    let mut reader = Reader::new(file, None, true, 0);
    let mut records = vec![];
    let mut buf = vec![];
    while reader.read_record(&mut buf) {
        records.push(buf.clone());
    }
    Ok(records)
}
