pub mod file;
pub mod mem;

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use crate::error::{Error, IResult};

/// The filesystem abstraction injected into the database. All I/O and
/// file management flow through a `Storage` so tests can run against an
/// in-memory implementation and deployments can interpose their own.
pub trait Storage: Send + Sync {
    type F: File + 'static;

    /// Creates a file, truncating it if it exists.
    fn create<P: AsRef<Path>>(&self, name: P) -> IResult<Self::F>;

    /// Opens an existing file for reading and writing.
    /// Returns `Error::NotFound` if it does not exist.
    fn open<P: AsRef<Path>>(&self, name: P) -> IResult<Self::F>;

    fn remove<P: AsRef<Path>>(&self, name: P) -> IResult<()>;

    fn remove_dir<P: AsRef<Path>>(&self, dir: P, recursively: bool) -> IResult<()>;

    fn exists<P: AsRef<Path>>(&self, name: P) -> bool;

    /// Renames a file, replacing any existing file at `target`.
    fn rename<P: AsRef<Path>>(&self, src: P, target: P) -> IResult<()>;

    /// Creates a directory and any missing parents.
    fn mkdir_all<P: AsRef<Path>>(&self, dir: P) -> IResult<()>;

    /// Paths of every file directly inside `dir`.
    fn list<P: AsRef<Path>>(&self, dir: P) -> IResult<Vec<PathBuf>>;
}

/// An open file handle. Write methods take `&mut self`; positioned reads
/// take `&self` so one table file can serve concurrent readers.
pub trait File: Send + Sync {
    fn write(&mut self, buf: &[u8]) -> IResult<usize>;

    /// Pushes buffered bytes to the OS (not necessarily to disk).
    fn flush(&mut self) -> IResult<()>;

    /// Forces contents to stable storage.
    fn sync(&mut self) -> IResult<()>;

    fn seek(&mut self, pos: SeekFrom) -> IResult<u64>;

    /// Reads from the current position, filling as much of `buf` as the
    /// remaining file allows. A short return therefore means end of
    /// file.
    fn read(&mut self, buf: &mut [u8]) -> IResult<usize>;

    /// Reads the whole remaining file into `buf`.
    fn read_all(&mut self, buf: &mut Vec<u8>) -> IResult<usize>;

    fn len(&self) -> IResult<u64>;

    /// Positioned read; does not disturb the sequential cursor.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> IResult<usize>;

    /// Acquires an advisory exclusive lock. Fails if another process (or
    /// handle) holds it.
    fn lock(&self) -> IResult<()>;

    fn unlock(&self) -> IResult<()>;

    fn close(&mut self) -> IResult<()>;

    fn write_all(&mut self, mut buf: &[u8]) -> IResult<()> {
        while !buf.is_empty() {
            let n = self.write(buf)?;
            if n == 0 {
                return Err(Error::IO(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "failed to write whole buffer",
                )));
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    fn read_exact_at(&self, mut buf: &mut [u8], mut offset: u64) -> IResult<()> {
        while !buf.is_empty() {
            match self.read_at(buf, offset) {
                Ok(0) => break,
                Ok(n) => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
                Err(Error::IO(e)) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        if buf.is_empty() {
            Ok(())
        } else {
            Err(Error::IO(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "failed to fill whole buffer",
            )))
        }
    }
}

/// Writes `data` to `file_name`, fsyncing when `should_sync`. On a close
/// failure the half-written file is removed.
pub fn write_string_to_file<S: Storage, P: AsRef<Path>>(
    storage: &S,
    data: &str,
    file_name: P,
    should_sync: bool,
) -> IResult<()> {
    let mut file = storage.create(&file_name)?;
    file.write_all(data.as_bytes())?;
    file.flush()?;
    if should_sync {
        file.sync()?;
    }
    if file.close().is_err() {
        storage.remove(&file_name)?;
    }
    Ok(())
}

/// Reads the whole of `file_name` as UTF-8.
pub fn read_string_from_file<S: Storage, P: AsRef<Path>>(
    storage: &S,
    file_name: P,
) -> IResult<String> {
    let mut file = storage.open(&file_name)?;
    let mut buf = vec![];
    file.read_all(&mut buf)?;
    String::from_utf8(buf)
        .map_err(|e| Error::Corruption(format!("file is not valid utf-8: {}", e)))
}
