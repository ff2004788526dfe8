use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, IResult};
use crate::storage::{File, Storage};

/// `Storage` backed by the real filesystem.
#[derive(Clone, Copy, Default)]
pub struct FileStorage;

impl Storage for FileStorage {
    type F = SysFile;

    fn create<P: AsRef<Path>>(&self, name: P) -> IResult<Self::F> {
        let inner = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(name)?;
        Ok(SysFile { inner })
    }

    fn open<P: AsRef<Path>>(&self, name: P) -> IResult<Self::F> {
        match fs::OpenOptions::new().read(true).write(true).open(&name) {
            Ok(inner) => Ok(SysFile { inner }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound),
            Err(e) => Err(Error::IO(e)),
        }
    }

    fn remove<P: AsRef<Path>>(&self, name: P) -> IResult<()> {
        Ok(fs::remove_file(name)?)
    }

    fn remove_dir<P: AsRef<Path>>(&self, dir: P, recursively: bool) -> IResult<()> {
        if recursively {
            Ok(fs::remove_dir_all(dir)?)
        } else {
            Ok(fs::remove_dir(dir)?)
        }
    }

    fn exists<P: AsRef<Path>>(&self, name: P) -> bool {
        name.as_ref().exists()
    }

    fn rename<P: AsRef<Path>>(&self, src: P, target: P) -> IResult<()> {
        Ok(fs::rename(src, target)?)
    }

    fn mkdir_all<P: AsRef<Path>>(&self, dir: P) -> IResult<()> {
        Ok(fs::create_dir_all(dir)?)
    }

    fn list<P: AsRef<Path>>(&self, dir: P) -> IResult<Vec<PathBuf>> {
        let mut result = vec![];
        for entry in fs::read_dir(dir)? {
            result.push(entry?.path());
        }
        Ok(result)
    }
}

/// An open file on the real filesystem.
pub struct SysFile {
    inner: fs::File,
}

impl File for SysFile {
    fn write(&mut self, buf: &[u8]) -> IResult<usize> {
        Ok(self.inner.write(buf)?)
    }

    fn flush(&mut self) -> IResult<()> {
        Ok(self.inner.flush()?)
    }

    fn sync(&mut self) -> IResult<()> {
        Ok(self.inner.sync_all()?)
    }

    fn seek(&mut self, pos: SeekFrom) -> IResult<u64> {
        Ok(self.inner.seek(pos)?)
    }

    fn read(&mut self, buf: &mut [u8]) -> IResult<usize> {
        // Callers treat a short read as end-of-file, so fill greedily.
        let mut total = 0;
        while total < buf.len() {
            match self.inner.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::IO(e)),
            }
        }
        Ok(total)
    }

    fn read_all(&mut self, buf: &mut Vec<u8>) -> IResult<usize> {
        Ok(self.inner.read_to_end(buf)?)
    }

    fn len(&self) -> IResult<u64> {
        Ok(self.inner.metadata()?.len())
    }

    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> IResult<usize> {
        use std::os::unix::fs::FileExt;
        Ok(self.inner.read_at(buf, offset)?)
    }

    #[cfg(windows)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> IResult<usize> {
        use std::os::windows::fs::FileExt;
        Ok(self.inner.seek_read(buf, offset)?)
    }

    #[cfg(unix)]
    fn lock(&self) -> IResult<()> {
        use std::os::unix::io::AsRawFd;
        let rc = unsafe { libc::flock(self.inner.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let e = std::io::Error::last_os_error();
            return Err(Error::IO(std::io::Error::new(
                e.kind(),
                "database lock is held by another process",
            )));
        }
        Ok(())
    }

    #[cfg(unix)]
    fn unlock(&self) -> IResult<()> {
        use std::os::unix::io::AsRawFd;
        let rc = unsafe { libc::flock(self.inner.as_raw_fd(), libc::LOCK_UN) };
        if rc != 0 {
            return Err(Error::IO(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn lock(&self) -> IResult<()> {
        Ok(())
    }

    #[cfg(not(unix))]
    fn unlock(&self) -> IResult<()> {
        Ok(())
    }

    fn close(&mut self) -> IResult<()> {
        // Dropping the descriptor closes it; flush buffered writes first.
        Ok(self.inner.flush()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage;
        let path = dir.path().join("data.bin");
        let mut f = storage.create(&path).unwrap();
        f.write_all(b"layered sediment").unwrap();
        f.flush().unwrap();

        let mut f = storage.open(&path).unwrap();
        assert_eq!(f.len().unwrap(), 16);
        let mut buf = vec![0u8; 7];
        f.read_exact_at(&mut buf, 8).unwrap();
        assert_eq!(&buf, b"sedimen");
        let mut all = vec![];
        f.read_all(&mut all).unwrap();
        assert_eq!(all, b"layered sediment");
    }

    #[test]
    fn test_open_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        match FileStorage.open(dir.path().join("nope")) {
            Err(Error::NotFound) => {}
            other => panic!("expected NotFound, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_rename_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage;
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        storage.create(&a).unwrap().write_all(b"one").unwrap();
        storage.create(&b).unwrap().write_all(b"two").unwrap();
        storage.rename(&a, &b).unwrap();
        assert!(!storage.exists(&a));
        let mut buf = vec![];
        storage.open(&b).unwrap().read_all(&mut buf).unwrap();
        assert_eq!(buf, b"one");
    }

    #[cfg(unix)]
    #[test]
    fn test_lock_excludes_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage;
        let path = dir.path().join("LOCK");
        let f1 = storage.create(&path).unwrap();
        f1.lock().unwrap();
        let f2 = storage.open(&path).unwrap();
        assert!(f2.lock().is_err());
        f1.unlock().unwrap();
        f2.lock().unwrap();
    }

    #[test]
    fn test_list_sees_created_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage;
        storage.create(dir.path().join("x")).unwrap();
        storage.create(dir.path().join("y")).unwrap();
        let mut names: Vec<String> = storage
            .list(dir.path())
            .unwrap()
            .into_iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["x", "y"]);
    }
}
