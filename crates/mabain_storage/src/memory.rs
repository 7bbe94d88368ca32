//! In-memory storage backend for testing.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;

/// An in-memory storage backend.
///
/// Stores all data in a `Vec<u8>` and is suitable for unit tests and
/// ephemeral stores that don't need persistence.
///
/// # Thread Safety
///
/// This backend is thread-safe and can be shared across threads.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    data: RwLock<Vec<u8>>,
}

impl InMemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new in-memory backend with pre-existing data.
    ///
    /// Useful for testing recovery scenarios.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }

    /// Returns a copy of all data in the backend.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_into(offset, &mut buf)?;
        Ok(buf)
    }

    fn read_into(&self, offset: u64, buf: &mut [u8]) -> StorageResult<()> {
        let data = self.data.read();
        let size = data.len() as u64;
        let start = offset as usize;
        let end = start.saturating_add(buf.len());
        if offset > size || end as u64 > size {
            return Err(StorageError::ReadPastEnd {
                offset,
                len: buf.len(),
                size,
            });
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_at(&self, offset: u64, bytes: &[u8]) -> StorageResult<()> {
        let mut data = self.data.write();
        let size = data.len() as u64;
        let start = offset as usize;
        let end = start.saturating_add(bytes.len());
        if end as u64 > size {
            return Err(StorageError::WritePastEnd {
                offset,
                len: bytes.len(),
                size,
            });
        }
        data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn grow_to(&self, new_size: u64) -> StorageResult<()> {
        let mut data = self.data.write();
        if new_size as usize > data.len() {
            data.resize(new_size as usize, 0);
        }
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn flush(&self) -> StorageResult<()> {
        Ok(())
    }

    fn sync(&self) -> StorageResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_and_read_back() {
        let backend = InMemoryBackend::new();
        backend.grow_to(64).unwrap();
        backend.write_at(16, b"hello").unwrap();
        assert_eq!(backend.read_at(16, 5).unwrap(), b"hello");
    }

    #[test]
    fn read_past_end_fails() {
        let backend = InMemoryBackend::new();
        backend.grow_to(8).unwrap();
        let result = backend.read_at(4, 8);
        assert!(matches!(result, Err(StorageError::ReadPastEnd { .. })));
    }

    #[test]
    fn write_past_end_fails() {
        let backend = InMemoryBackend::new();
        backend.grow_to(8).unwrap();
        let result = backend.write_at(6, b"abcd");
        assert!(matches!(result, Err(StorageError::WritePastEnd { .. })));
    }

    #[test]
    fn grow_never_shrinks() {
        let backend = InMemoryBackend::new();
        backend.grow_to(32).unwrap();
        backend.grow_to(8).unwrap();
        assert_eq!(backend.size().unwrap(), 32);
    }
}
