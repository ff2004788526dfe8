use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::error::{Error, IResult};
use crate::storage::{File, Storage};

fn io_err(kind: std::io::ErrorKind, msg: &str) -> Error {
    Error::IO(std::io::Error::new(kind, msg))
}

/// Shared state of one in-memory file.
struct FileNode {
    data: RwLock<Vec<u8>>,
    locked: AtomicBool,
}

impl FileNode {
    fn new() -> Arc<Self> {
        Arc::new(FileNode {
            data: RwLock::new(vec![]),
            locked: AtomicBool::new(false),
        })
    }
}

/// Fault switches shared by every handle of a `MemStorage`. Tests flip
/// these to exercise the error paths.
#[derive(Default)]
pub struct FaultInjection {
    /// Every `sync` fails.
    pub sync_error: AtomicBool,
    /// Every `write` fails.
    pub write_error: AtomicBool,
}

/// A fully in-memory `Storage`. Directories are implicit: a file exists
/// under whatever path it was created with. Cloning shares the same
/// namespace, mirroring a shared filesystem.
#[derive(Clone, Default)]
pub struct MemStorage {
    files: Arc<Mutex<HashMap<PathBuf, Arc<FileNode>>>>,
    faults: Arc<FaultInjection>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> &FaultInjection {
        &self.faults
    }

    fn normalize<P: AsRef<Path>>(name: P) -> PathBuf {
        // Collapse `.` components so "db/./CURRENT" and "db/CURRENT"
        // address the same node.
        name.as_ref()
            .components()
            .filter(|c| !matches!(c, std::path::Component::CurDir))
            .collect()
    }
}

impl Storage for MemStorage {
    type F = MemFile;

    fn create<P: AsRef<Path>>(&self, name: P) -> IResult<Self::F> {
        let path = Self::normalize(name);
        let mut files = self.files.lock().unwrap();
        let node = FileNode::new();
        files.insert(path, node.clone());
        Ok(MemFile {
            node,
            pos: 0,
            faults: self.faults.clone(),
            owns_lock: AtomicBool::new(false),
        })
    }

    fn open<P: AsRef<Path>>(&self, name: P) -> IResult<Self::F> {
        let path = Self::normalize(name);
        let files = self.files.lock().unwrap();
        match files.get(&path) {
            Some(node) => Ok(MemFile {
                node: node.clone(),
                pos: 0,
                faults: self.faults.clone(),
                owns_lock: AtomicBool::new(false),
            }),
            None => Err(Error::NotFound),
        }
    }

    fn remove<P: AsRef<Path>>(&self, name: P) -> IResult<()> {
        let path = Self::normalize(name);
        match self.files.lock().unwrap().remove(&path) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound),
        }
    }

    fn remove_dir<P: AsRef<Path>>(&self, dir: P, recursively: bool) -> IResult<()> {
        let dir = Self::normalize(dir);
        let mut files = self.files.lock().unwrap();
        if recursively {
            files.retain(|path, _| !path.starts_with(&dir));
        } else {
            let occupied = files.keys().any(|path| path.parent() == Some(dir.as_path()));
            if occupied {
                return Err(io_err(
                    std::io::ErrorKind::Other,
                    "directory not empty",
                ));
            }
        }
        Ok(())
    }

    fn exists<P: AsRef<Path>>(&self, name: P) -> bool {
        let path = Self::normalize(name);
        let files = self.files.lock().unwrap();
        files.contains_key(&path) || files.keys().any(|p| p.starts_with(&path))
    }

    fn rename<P: AsRef<Path>>(&self, src: P, target: P) -> IResult<()> {
        let src = Self::normalize(src);
        let target = Self::normalize(target);
        let mut files = self.files.lock().unwrap();
        match files.remove(&src) {
            Some(node) => {
                files.insert(target, node);
                Ok(())
            }
            None => Err(Error::NotFound),
        }
    }

    fn mkdir_all<P: AsRef<Path>>(&self, _dir: P) -> IResult<()> {
        Ok(())
    }

    fn list<P: AsRef<Path>>(&self, dir: P) -> IResult<Vec<PathBuf>> {
        let dir = Self::normalize(dir);
        let files = self.files.lock().unwrap();
        Ok(files
            .keys()
            .filter(|path| path.parent() == Some(dir.as_path()))
            .cloned()
            .collect())
    }
}

pub struct MemFile {
    node: Arc<FileNode>,
    pos: u64,
    faults: Arc<FaultInjection>,
    /// Like `flock`, the lock dies with the handle that took it.
    owns_lock: AtomicBool,
}

impl Drop for MemFile {
    fn drop(&mut self) {
        if self.owns_lock.load(Ordering::SeqCst) {
            self.node.locked.store(false, Ordering::SeqCst);
        }
    }
}

impl File for MemFile {
    fn write(&mut self, buf: &[u8]) -> IResult<usize> {
        if self.faults.write_error.load(Ordering::Relaxed) {
            return Err(io_err(std::io::ErrorKind::Other, "injected write error"));
        }
        let mut data = self.node.data.write().unwrap();
        let pos = self.pos as usize;
        if pos + buf.len() > data.len() {
            data.resize(pos + buf.len(), 0);
        }
        data[pos..pos + buf.len()].copy_from_slice(buf);
        self.pos += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> IResult<()> {
        Ok(())
    }

    fn sync(&mut self) -> IResult<()> {
        if self.faults.sync_error.load(Ordering::Relaxed) {
            return Err(io_err(std::io::ErrorKind::Other, "injected sync error"));
        }
        Ok(())
    }

    fn seek(&mut self, pos: SeekFrom) -> IResult<u64> {
        let len = self.node.data.read().unwrap().len() as i64;
        let new_pos = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(offset) => len + offset,
            SeekFrom::Current(offset) => self.pos as i64 + offset,
        };
        if new_pos < 0 {
            return Err(io_err(
                std::io::ErrorKind::InvalidInput,
                "seek before start of file",
            ));
        }
        self.pos = new_pos as u64;
        Ok(self.pos)
    }

    fn read(&mut self, buf: &mut [u8]) -> IResult<usize> {
        let n = self.read_at(buf, self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }

    fn read_all(&mut self, buf: &mut Vec<u8>) -> IResult<usize> {
        let data = self.node.data.read().unwrap();
        let pos = (self.pos as usize).min(data.len());
        let n = data.len() - pos;
        buf.extend_from_slice(&data[pos..]);
        self.pos = data.len() as u64;
        Ok(n)
    }

    fn len(&self) -> IResult<u64> {
        Ok(self.node.data.read().unwrap().len() as u64)
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> IResult<usize> {
        let data = self.node.data.read().unwrap();
        if offset as usize >= data.len() {
            return Ok(0);
        }
        let end = (offset as usize + buf.len()).min(data.len());
        let n = end - offset as usize;
        buf[..n].copy_from_slice(&data[offset as usize..end]);
        Ok(n)
    }

    fn lock(&self) -> IResult<()> {
        if self
            .node
            .locked
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(io_err(
                std::io::ErrorKind::Other,
                "database lock is held by another process",
            ));
        }
        self.owns_lock.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn unlock(&self) -> IResult<()> {
        if self.owns_lock.swap(false, Ordering::SeqCst) {
            self.node.locked.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    fn close(&mut self) -> IResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_and_reopen() {
        let storage = MemStorage::new();
        let mut f = storage.create("dir/file").unwrap();
        f.write_all(b"hello").unwrap();
        drop(f);
        let mut f = storage.open("dir/file").unwrap();
        let mut buf = vec![];
        f.read_all(&mut buf).unwrap();
        assert_eq!(buf, b"hello");
    }

    #[test]
    fn test_create_truncates() {
        let storage = MemStorage::new();
        storage.create("f").unwrap().write_all(b"aaaa").unwrap();
        storage.create("f").unwrap();
        assert_eq!(storage.open("f").unwrap().len().unwrap(), 0);
    }

    #[test]
    fn test_list_is_per_directory() {
        let storage = MemStorage::new();
        storage.create("db/a").unwrap();
        storage.create("db/b").unwrap();
        storage.create("other/c").unwrap();
        let mut listed = storage.list("db").unwrap();
        listed.sort();
        assert_eq!(listed, vec![PathBuf::from("db/a"), PathBuf::from("db/b")]);
    }

    #[test]
    fn test_rename_and_exists() {
        let storage = MemStorage::new();
        storage.create("db/CURRENT.tmp").unwrap();
        storage.rename("db/CURRENT.tmp", "db/CURRENT").unwrap();
        assert!(storage.exists("db/CURRENT"));
        assert!(!storage.exists("db/CURRENT.tmp"));
        assert!(storage.exists("db"));
    }

    #[test]
    fn test_lock_is_exclusive() {
        let storage = MemStorage::new();
        let f1 = storage.create("LOCK").unwrap();
        f1.lock().unwrap();
        let f2 = storage.open("LOCK").unwrap();
        assert!(f2.lock().is_err());
        f1.unlock().unwrap();
        assert!(f2.lock().is_ok());
    }

    #[test]
    fn test_injected_sync_error() {
        let storage = MemStorage::new();
        let mut f = storage.create("f").unwrap();
        f.sync().unwrap();
        storage.faults().sync_error.store(true, Ordering::Relaxed);
        assert!(f.sync().is_err());
        storage.faults().sync_error.store(false, Ordering::Relaxed);
        assert!(f.sync().is_ok());
    }

    #[test]
    fn test_positioned_reads_do_not_move_cursor() {
        let storage = MemStorage::new();
        let mut f = storage.create("f").unwrap();
        f.write_all(b"0123456789").unwrap();
        f.seek(SeekFrom::Start(0)).unwrap();
        let mut buf = [0u8; 4];
        f.read_exact_at(&mut buf, 6).unwrap();
        assert_eq!(&buf, b"6789");
        let mut head = [0u8; 2];
        assert_eq!(f.read(&mut head).unwrap(), 2);
        assert_eq!(&head, b"01");
    }
}
