//! Fixed-size shared memory region backed by a mapped file.
//!
//! The trie header lives in a small file mapped read-write by every handle,
//! writer and reader alike. Counter fields in it (handle counts, the
//! lock-free modification counter) need real atomic semantics across
//! processes, so this module exposes word-sized atomic accessors over the
//! mapping instead of handing out raw byte slices.

use crate::error::{StorageError, StorageResult};
use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// A fixed-size, read-write shared mapping of a header file.
///
/// Word accessors are atomic with `Acquire`/`Release` semantics so the
/// single writer can publish multi-step changes to lock-free readers in
/// other processes. Byte-range accessors are plain copies; callers must
/// only use them for fields owned exclusively by the writer.
pub struct MmapRegion {
    map: MmapMut,
    len: usize,
}

// The mapping is shared memory; cross-thread access goes through the
// atomic accessors or writer-exclusive byte ranges.
unsafe impl Send for MmapRegion {}
unsafe impl Sync for MmapRegion {}

impl MmapRegion {
    /// Opens (or creates and zero-fills) a region file of exactly `len` bytes.
    ///
    /// An existing file smaller than `len` is extended; a larger file is
    /// mapped at its full size but only `len` bytes are addressable here.
    pub fn open(path: &Path, len: usize) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if (file.metadata()?.len() as usize) < len {
            file.set_len(len as u64)?;
        }
        // SAFETY: regular file held open for the lifetime of the mapping;
        // concurrent access is mediated by the atomic accessors below.
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { map, len })
    }

    /// Returns the addressable length of the region.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the region is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check(&self, offset: usize, len: usize, align: usize) -> StorageResult<()> {
        if offset % align != 0 || offset + len > self.len {
            return Err(StorageError::Corrupted(format!(
                "region access out of bounds: offset {offset}, len {len}"
            )));
        }
        Ok(())
    }

    fn atomic_u32(&self, offset: usize) -> &AtomicU32 {
        // SAFETY: bounds and alignment checked by callers via `check`; the
        // mapping outlives the returned reference.
        unsafe { AtomicU32::from_ptr(self.map.as_ptr().add(offset).cast_mut().cast()) }
    }

    fn atomic_u64(&self, offset: usize) -> &AtomicU64 {
        // SAFETY: as above.
        unsafe { AtomicU64::from_ptr(self.map.as_ptr().add(offset).cast_mut().cast()) }
    }

    /// Atomically loads a `u32` at `offset` (acquire).
    pub fn load_u32(&self, offset: usize) -> StorageResult<u32> {
        self.check(offset, 4, 4)?;
        Ok(self.atomic_u32(offset).load(Ordering::Acquire))
    }

    /// Atomically stores a `u32` at `offset` (release).
    pub fn store_u32(&self, offset: usize, value: u32) -> StorageResult<()> {
        self.check(offset, 4, 4)?;
        self.atomic_u32(offset).store(value, Ordering::Release);
        Ok(())
    }

    /// Atomically adds to a `u32` at `offset`, returning the previous value.
    pub fn fetch_add_u32(&self, offset: usize, delta: u32) -> StorageResult<u32> {
        self.check(offset, 4, 4)?;
        Ok(self.atomic_u32(offset).fetch_add(delta, Ordering::AcqRel))
    }

    /// Atomically subtracts from a `u32` at `offset`, returning the previous value.
    pub fn fetch_sub_u32(&self, offset: usize, delta: u32) -> StorageResult<u32> {
        self.check(offset, 4, 4)?;
        Ok(self.atomic_u32(offset).fetch_sub(delta, Ordering::AcqRel))
    }

    /// Atomically loads a `u64` at `offset` (acquire).
    pub fn load_u64(&self, offset: usize) -> StorageResult<u64> {
        self.check(offset, 8, 8)?;
        Ok(self.atomic_u64(offset).load(Ordering::Acquire))
    }

    /// Atomically stores a `u64` at `offset` (release).
    pub fn store_u64(&self, offset: usize, value: u64) -> StorageResult<()> {
        self.check(offset, 8, 8)?;
        self.atomic_u64(offset).store(value, Ordering::Release);
        Ok(())
    }

    /// Copies bytes out of the region. Writer-owned fields only.
    pub fn read_bytes(&self, offset: usize, buf: &mut [u8]) -> StorageResult<()> {
        self.check(offset, buf.len(), 1)?;
        buf.copy_from_slice(&self.map[offset..offset + buf.len()]);
        Ok(())
    }

    /// Copies bytes into the region. Writer-owned fields only.
    pub fn write_bytes(&self, offset: usize, bytes: &[u8]) -> StorageResult<()> {
        self.check(offset, bytes.len(), 1)?;
        // SAFETY: bounds checked; the writer is the only mutator of these
        // byte ranges by protocol.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.map.as_ptr().add(offset).cast_mut(),
                bytes.len(),
            );
        }
        Ok(())
    }

    /// Flushes the region to its backing file.
    pub fn flush(&self) -> StorageResult<()> {
        self.map.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn words_round_trip() {
        let dir = tempdir().unwrap();
        let region = MmapRegion::open(&dir.path().join("hdr"), 4096).unwrap();
        region.store_u32(0, 0xDEAD_BEEF).unwrap();
        region.store_u64(8, u64::MAX - 7).unwrap();
        assert_eq!(region.load_u32(0).unwrap(), 0xDEAD_BEEF);
        assert_eq!(region.load_u64(8).unwrap(), u64::MAX - 7);
    }

    #[test]
    fn counters_are_atomic_across_mappings() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hdr");
        let a = MmapRegion::open(&path, 4096).unwrap();
        let b = MmapRegion::open(&path, 4096).unwrap();
        a.fetch_add_u32(64, 1).unwrap();
        b.fetch_add_u32(64, 1).unwrap();
        assert_eq!(a.load_u32(64).unwrap(), 2);
    }

    #[test]
    fn misaligned_access_rejected() {
        let dir = tempdir().unwrap();
        let region = MmapRegion::open(&dir.path().join("hdr"), 4096).unwrap();
        assert!(region.load_u64(12).is_err());
        assert!(region.load_u32(4094).is_err());
    }

    #[test]
    fn bytes_round_trip() {
        let dir = tempdir().unwrap();
        let region = MmapRegion::open(&dir.path().join("hdr"), 4096).unwrap();
        region.write_bytes(100, b"journal image").unwrap();
        let mut buf = [0u8; 13];
        region.read_bytes(100, &mut buf).unwrap();
        assert_eq!(&buf, b"journal image");
    }
}
