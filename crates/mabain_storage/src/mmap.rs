//! Memory-mapped file backend for persistent arenas.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use memmap2::{Mmap, MmapMut};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

enum Map {
    Ro(Mmap),
    Rw(MmapMut),
}

impl Map {
    fn as_bytes(&self) -> &[u8] {
        match self {
            Map::Ro(m) => m,
            Map::Rw(m) => m,
        }
    }
}

struct Inner {
    file: File,
    map: Option<Map>,
    mapped_len: u64,
}

/// A file-backed storage backend using a shared memory mapping.
///
/// The mapping extends monotonically: when the file grows past the mapped
/// length (because this handle called [`StorageBackend::grow_to`], or
/// because the writing process grew the file underneath a read-only
/// handle), the next access re-establishes a larger mapping. The mapping is
/// `MAP_SHARED`, so stores made by a writer process become visible to
/// reader processes that map the same file.
///
/// Bytes under the mapping may be written concurrently by the single
/// writer while readers copy them out. Readers of the trie engine validate
/// every such racy snapshot through the lock-free protocol before trusting
/// it, so a torn copy is detected and retried rather than interpreted.
pub struct MmapBackend {
    path: PathBuf,
    read_only: bool,
    inner: RwLock<Inner>,
}

impl MmapBackend {
    /// Opens or creates a writable backing file at the given path.
    pub fn open_rw(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Self::from_file(path, file, false)
    }

    /// Creates a writable backing file, truncating any existing content.
    pub fn create(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Self::from_file(path, file, false)
    }

    /// Opens an existing backing file read-only.
    pub fn open_ro(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Self::from_file(path, file, true)
    }

    fn from_file(path: &Path, file: File, read_only: bool) -> StorageResult<Self> {
        let len = file.metadata()?.len();
        let mut inner = Inner {
            file,
            map: None,
            mapped_len: 0,
        };
        if len > 0 {
            Self::remap(&mut inner, len, read_only)?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            read_only,
            inner: RwLock::new(inner),
        })
    }

    /// Returns the path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn remap(inner: &mut Inner, len: u64, read_only: bool) -> StorageResult<()> {
        // SAFETY: the mapping is over a regular file we hold open. The
        // engine tolerates concurrent modification of the mapped bytes by
        // validating every snapshot (see the type-level docs).
        let map = if read_only {
            Map::Ro(unsafe { Mmap::map(&inner.file)? })
        } else {
            Map::Rw(unsafe { MmapMut::map_mut(&inner.file)? })
        };
        inner.map = Some(map);
        inner.mapped_len = len;
        Ok(())
    }

    /// Re-stats the file and extends the mapping if it grew.
    fn refresh(&self, needed: u64) -> StorageResult<u64> {
        let mut inner = self.inner.write();
        let file_len = inner.file.metadata()?.len();
        if file_len > inner.mapped_len && file_len >= needed {
            Self::remap(&mut inner, file_len, self.read_only)?;
        }
        Ok(inner.mapped_len)
    }
}

impl StorageBackend for MmapBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_into(offset, &mut buf)?;
        Ok(buf)
    }

    fn read_into(&self, offset: u64, buf: &mut [u8]) -> StorageResult<()> {
        let needed = offset + buf.len() as u64;
        {
            let inner = self.inner.read();
            if needed <= inner.mapped_len {
                let map = inner.map.as_ref().expect("non-empty mapping");
                let start = offset as usize;
                buf.copy_from_slice(&map.as_bytes()[start..start + buf.len()]);
                return Ok(());
            }
        }
        // The writer may have grown the file underneath us.
        let mapped = self.refresh(needed)?;
        if needed > mapped {
            return Err(StorageError::ReadPastEnd {
                offset,
                len: buf.len(),
                size: mapped,
            });
        }
        let inner = self.inner.read();
        let map = inner.map.as_ref().expect("non-empty mapping");
        let start = offset as usize;
        buf.copy_from_slice(&map.as_bytes()[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> StorageResult<()> {
        if self.read_only {
            return Err(StorageError::ReadOnly);
        }
        if data.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.write();
        let end = offset + data.len() as u64;
        if end > inner.mapped_len {
            return Err(StorageError::WritePastEnd {
                offset,
                len: data.len(),
                size: inner.mapped_len,
            });
        }
        match inner.map.as_mut().expect("non-empty mapping") {
            Map::Rw(m) => {
                let start = offset as usize;
                m[start..start + data.len()].copy_from_slice(data);
                Ok(())
            }
            Map::Ro(_) => Err(StorageError::ReadOnly),
        }
    }

    fn grow_to(&self, new_size: u64) -> StorageResult<()> {
        if self.read_only {
            return Err(StorageError::ReadOnly);
        }
        let mut inner = self.inner.write();
        if new_size <= inner.mapped_len {
            return Ok(());
        }
        inner.file.set_len(new_size)?;
        Self::remap(&mut inner, new_size, self.read_only)
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.inner.read().mapped_len)
    }

    fn flush(&self) -> StorageResult<()> {
        let inner = self.inner.read();
        if let Some(Map::Rw(m)) = inner.map.as_ref() {
            m.flush()?;
        }
        Ok(())
    }

    fn sync(&self) -> StorageResult<()> {
        self.flush()?;
        self.inner.read().file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn grow_write_read_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("arena.dat");
        let backend = MmapBackend::create(&path).unwrap();
        backend.grow_to(4096).unwrap();
        backend.write_at(128, b"slot contents").unwrap();
        assert_eq!(backend.read_at(128, 13).unwrap(), b"slot contents");
    }

    #[test]
    fn reader_sees_writer_growth() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("arena.dat");
        let writer = MmapBackend::create(&path).unwrap();
        writer.grow_to(1024).unwrap();
        writer.write_at(0, b"first").unwrap();

        let reader = MmapBackend::open_ro(&path).unwrap();
        assert_eq!(reader.read_at(0, 5).unwrap(), b"first");

        // Grow underneath the reader and write beyond its mapping.
        writer.grow_to(8192).unwrap();
        writer.write_at(4096, b"beyond").unwrap();
        assert_eq!(reader.read_at(4096, 6).unwrap(), b"beyond");
    }

    #[test]
    fn read_only_rejects_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("arena.dat");
        let writer = MmapBackend::create(&path).unwrap();
        writer.grow_to(64).unwrap();

        let reader = MmapBackend::open_ro(&path).unwrap();
        assert!(matches!(
            reader.write_at(0, b"x"),
            Err(StorageError::ReadOnly)
        ));
    }

    #[test]
    fn contents_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("arena.dat");
        {
            let backend = MmapBackend::create(&path).unwrap();
            backend.grow_to(256).unwrap();
            backend.write_at(32, b"persistent").unwrap();
            backend.sync().unwrap();
        }
        let backend = MmapBackend::open_rw(&path).unwrap();
        assert_eq!(backend.read_at(32, 10).unwrap(), b"persistent");
    }
}
