use std::io::Read;
use std::io::Write;

use crate::error::{Error, IResult};
use crate::options::CompressionType;
use crate::storage::File;
use crate::util::coding::{decode_fixed_32, decode_fixed_64, put_fixed_64, VarintU64};
use crate::util::crc32;

/// Maximum encoded length of a `BlockHandle` (two full-width varints).
pub const MAX_BLOCK_HANDLE_ENCODED_LENGTH: usize = 10 + 10;

/// Exact encoded length of a `Footer`: two padded block handles and the
/// magic number.
pub const FOOTER_ENCODED_LENGTH: usize = 2 * MAX_BLOCK_HANDLE_ENCODED_LENGTH + 8;

/// First 64 bits of the sha-1 of "http://code.google.com/p/leveldb/".
pub const TABLE_MAGIC_NUMBER: u64 = 0xdb47_7524_8b80_fb57;

/// Every block is followed by `{u8 compression, u32 masked crc}`.
pub const BLOCK_TRAILER_SIZE: usize = 5;

/// Points at the extent of a file holding a data or meta block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

impl BlockHandle {
    pub fn new(offset: u64, size: u64) -> Self {
        BlockHandle { offset, size }
    }

    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        VarintU64::put_varint(dst, self.offset);
        VarintU64::put_varint(dst, self.size);
    }

    #[inline]
    pub fn encoded(&self) -> Vec<u8> {
        let mut v = vec![];
        self.encode_to(&mut v);
        v
    }

    /// Decodes a handle from the head of `src`, returning it and the
    /// number of bytes consumed.
    pub fn decode_from(src: &[u8]) -> IResult<(Self, usize)> {
        let (offset, n) = VarintU64::read(src)
            .ok_or_else(|| Error::Corruption("bad block handle".to_owned()))?;
        let (size, m) = VarintU64::read(&src[n..])
            .ok_or_else(|| Error::Corruption("bad block handle".to_owned()))?;
        Ok((BlockHandle::new(offset, size), n + m))
    }
}

/// The fixed-size information at the tail of every table file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub metaindex_handle: BlockHandle,
    pub index_handle: BlockHandle,
}

impl Footer {
    pub fn new(metaindex_handle: BlockHandle, index_handle: BlockHandle) -> Self {
        Footer {
            metaindex_handle,
            index_handle,
        }
    }

    pub fn encoded(&self) -> Vec<u8> {
        let mut v = vec![];
        self.metaindex_handle.encode_to(&mut v);
        self.index_handle.encode_to(&mut v);
        v.resize(2 * MAX_BLOCK_HANDLE_ENCODED_LENGTH, 0);
        put_fixed_64(&mut v, TABLE_MAGIC_NUMBER);
        debug_assert_eq!(v.len(), FOOTER_ENCODED_LENGTH);
        v
    }

    pub fn decode_from(src: &[u8]) -> IResult<Self> {
        if src.len() < FOOTER_ENCODED_LENGTH {
            return Err(Error::Corruption("truncated table footer".to_owned()));
        }
        let magic = decode_fixed_64(&src[FOOTER_ENCODED_LENGTH - 8..]);
        if magic != TABLE_MAGIC_NUMBER {
            return Err(Error::Corruption(
                "not an sstable (bad magic number)".to_owned(),
            ));
        }
        let (metaindex_handle, n) = BlockHandle::decode_from(src)?;
        let (index_handle, _) = BlockHandle::decode_from(&src[n..])?;
        Ok(Footer::new(metaindex_handle, index_handle))
    }
}

/// Compresses `raw` with the requested codec, falling back to storing it
/// uncompressed unless compression saves at least 12.5%.
pub fn compress_block(
    raw: &[u8],
    compression: CompressionType,
) -> IResult<(Vec<u8>, CompressionType)> {
    let compressed = match compression {
        CompressionType::KNoCompression | CompressionType::Unknown => {
            return Ok((raw.to_vec(), CompressionType::KNoCompression))
        }
        CompressionType::KSnappyCompression => {
            let mut buf = vec![0; snap::raw::max_compress_len(raw.len())];
            let len = snap::raw::Encoder::new()
                .compress(raw, &mut buf)
                .map_err(|e| {
                    Error::IO(std::io::Error::new(std::io::ErrorKind::Other, e))
                })?;
            buf.truncate(len);
            buf
        }
        CompressionType::KZstdCompression => zstd::stream::encode_all(raw, 0)?,
        CompressionType::KZlibRawCompression => {
            let mut encoder =
                flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(raw)?;
            encoder.finish()?
        }
    };
    if compressed.len() < raw.len() - raw.len() / 8 {
        Ok((compressed, compression))
    } else {
        Ok((raw.to_vec(), CompressionType::KNoCompression))
    }
}

/// Inverse of `compress_block`. Any decoding failure is `Corruption`:
/// the stored crc already vouched for the bytes, so a codec error means
/// the block was written wrong.
pub fn decompress_block(data: &[u8], compression: CompressionType) -> IResult<Vec<u8>> {
    match compression {
        CompressionType::KNoCompression => Ok(data.to_vec()),
        CompressionType::KSnappyCompression => {
            let len = snap::raw::decompress_len(data)
                .map_err(|e| Error::Corruption(format!("corrupted snappy block: {}", e)))?;
            let mut out = vec![0; len];
            snap::raw::Decoder::new()
                .decompress(data, &mut out)
                .map_err(|e| Error::Corruption(format!("corrupted snappy block: {}", e)))?;
            Ok(out)
        }
        CompressionType::KZstdCompression => zstd::stream::decode_all(data)
            .map_err(|e| Error::Corruption(format!("corrupted zstd block: {}", e))),
        CompressionType::KZlibRawCompression => {
            let mut out = vec![];
            flate2::read::DeflateDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| Error::Corruption(format!("corrupted deflate block: {}", e)))?;
            Ok(out)
        }
        CompressionType::Unknown => Err(Error::Corruption(
            "bad block compression type".to_owned(),
        )),
    }
}

/// Reads and decodes the block at `handle`, optionally verifying its
/// trailer crc (which covers the raw block bytes and the compression
/// byte).
pub fn read_block<F: File>(file: &F, handle: &BlockHandle, verify_checksum: bool) -> IResult<Vec<u8>> {
    let n = handle.size as usize;
    let mut buf = vec![0; n + BLOCK_TRAILER_SIZE];
    file.read_exact_at(&mut buf, handle.offset)?;

    if verify_checksum {
        let expected = crc32::unmask(decode_fixed_32(&buf[n + 1..]));
        let actual = crc32::hash(&buf[..=n]);
        if expected != actual {
            return Err(Error::Corruption("block checksum mismatch".to_owned()));
        }
    }
    let compression = CompressionType::from(buf[n]);
    if compression == CompressionType::KNoCompression {
        buf.truncate(n);
        return Ok(buf);
    }
    decompress_block(&buf[..n], compression)
}

/// Appends `data` (already compressed as `compression`) and its trailer
/// to `file`, filling in `handle` and advancing `offset`.
pub fn write_raw_block<F: File>(
    file: &mut F,
    data: &[u8],
    compression: CompressionType,
    handle: &mut BlockHandle,
    offset: &mut u64,
) -> IResult<()> {
    file.write_all(data)?;
    handle.offset = *offset;
    handle.size = data.len() as u64;

    let mut trailer = [0u8; BLOCK_TRAILER_SIZE];
    trailer[0] = compression as u8;
    let crc = crc32::mask(crc32::hash_parts(&[data, &[compression as u8]]));
    trailer[1..].copy_from_slice(&crc.to_le_bytes());
    file.write_all(&trailer)?;

    *offset += (data.len() + BLOCK_TRAILER_SIZE) as u64;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::mem::MemStorage;
    use crate::storage::Storage;

    #[test]
    fn test_block_handle_roundtrip() {
        for (offset, size) in [(0u64, 0u64), (1, 2), (u64::MAX, u64::MAX >> 3)] {
            let encoded = BlockHandle::new(offset, size).encoded();
            let (decoded, consumed) = BlockHandle::decode_from(&encoded).unwrap();
            assert_eq!(consumed, encoded.len());
            assert_eq!(decoded, BlockHandle::new(offset, size));
        }
        assert!(BlockHandle::decode_from(&[0x80]).is_err());
    }

    #[test]
    fn test_footer_roundtrip() {
        let footer = Footer::new(BlockHandle::new(17, 4096), BlockHandle::new(4113, 512));
        let encoded = footer.encoded();
        assert_eq!(encoded.len(), FOOTER_ENCODED_LENGTH);
        assert_eq!(Footer::decode_from(&encoded).unwrap(), footer);
    }

    #[test]
    fn test_footer_rejects_bad_magic() {
        let mut encoded = Footer::new(BlockHandle::new(0, 1), BlockHandle::new(1, 1)).encoded();
        let n = encoded.len();
        encoded[n - 1] ^= 0x01;
        assert!(Footer::decode_from(&encoded).is_err());
    }

    #[test]
    fn test_compression_roundtrips() {
        // Compressible data so every codec clears the 12.5% bar.
        let raw: Vec<u8> = b"abcdefgh".repeat(512);
        for codec in [
            CompressionType::KSnappyCompression,
            CompressionType::KZstdCompression,
            CompressionType::KZlibRawCompression,
        ] {
            let (compressed, used) = compress_block(&raw, codec).unwrap();
            assert_eq!(used, codec, "{:?} should win on repetitive data", codec);
            assert!(compressed.len() < raw.len());
            assert_eq!(decompress_block(&compressed, used).unwrap(), raw);
        }
    }

    #[test]
    fn test_incompressible_data_stays_raw() {
        // A pseudo-random buffer no codec can shrink 12.5%.
        let mut raw = vec![0u8; 4096];
        let mut state = 0x9e37_79b9_u32;
        for b in raw.iter_mut() {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            *b = (state >> 24) as u8;
        }
        let (out, used) = compress_block(&raw, CompressionType::KSnappyCompression).unwrap();
        assert_eq!(used, CompressionType::KNoCompression);
        assert_eq!(out, raw);
    }

    #[test]
    fn test_write_and_read_block() {
        let storage = MemStorage::new();
        let mut file = storage.create("table").unwrap();
        let payload = b"silt block payload".to_vec();
        let mut handle = BlockHandle::default();
        let mut offset = 0;
        write_raw_block(
            &mut file,
            &payload,
            CompressionType::KNoCompression,
            &mut handle,
            &mut offset,
        )
        .unwrap();
        assert_eq!(offset, (payload.len() + BLOCK_TRAILER_SIZE) as u64);

        let file = storage.open("table").unwrap();
        assert_eq!(read_block(&file, &handle, true).unwrap(), payload);
    }

    #[test]
    fn test_read_block_detects_corruption() {
        let storage = MemStorage::new();
        let mut file = storage.create("table").unwrap();
        let mut handle = BlockHandle::default();
        let mut offset = 0;
        write_raw_block(
            &mut file,
            b"payload",
            CompressionType::KNoCompression,
            &mut handle,
            &mut offset,
        )
        .unwrap();
        // Flip one payload byte.
        let mut f = storage.open("table").unwrap();
        let mut all = vec![];
        f.read_all(&mut all).unwrap();
        all[0] ^= 0x40;
        let mut f = storage.create("table").unwrap();
        f.write_all(&all).unwrap();

        let f = storage.open("table").unwrap();
        assert!(matches!(
            read_block(&f, &handle, true),
            Err(Error::Corruption(_))
        ));
        // Without verification the corruption goes unnoticed.
        assert!(read_block(&f, &handle, false).is_ok());
    }
}
