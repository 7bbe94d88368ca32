//! Append/free-list arenas over a storage backend.
//!
//! Each arena is an offset-addressed heap divided into slots. Slot sizes
//! are rounded up to the arena's size-class granularity, so a freed slot is
//! reusable by any later allocation of the same class. Free-list heads live
//! in the header; the list links thread through the last eight bytes of
//! each freed slot. Every allocation reserves that link space beyond its
//! payload: a crash-recovery undo can resurrect a slot that was already
//! threaded onto a list, and the payload bytes must still be intact when
//! it does.
//!
//! Freed slots are never coalesced. Space fragmentation is reclaimed by
//! resource collection, which rebuilds both arenas from the live trie.

use crate::config::CHUNK_SIZE;
use crate::error::{MbError, MbResult};
use crate::header::{ArenaKind, Header, NUM_SIZE_CLASSES};
use mabain_storage::{StorageBackend, StorageError};

/// One offset-addressed arena (index or data) over a storage backend.
pub struct Arena {
    backend: Box<dyn StorageBackend>,
    kind: ArenaKind,
    memcap: u64,
}

impl Arena {
    /// Wraps a backend as an arena of the given kind.
    pub fn new(backend: Box<dyn StorageBackend>, kind: ArenaKind, memcap: u64) -> Self {
        Self {
            backend,
            kind,
            memcap,
        }
    }

    /// The arena kind.
    #[must_use]
    pub fn kind(&self) -> ArenaKind {
        self.kind
    }

    /// Bytes reserved past the payload for the free-list link.
    const LINK_SIZE: usize = 8;

    /// Rounds a request up to its slot size, link space included.
    #[must_use]
    pub fn slot_size(kind: ArenaKind, size: usize) -> usize {
        let gran = kind.granularity();
        (size.max(1) + Self::LINK_SIZE).div_ceil(gran) * gran
    }

    fn class_of(kind: ArenaKind, rounded: usize) -> MbResult<usize> {
        let class = rounded / kind.granularity() - 1;
        if class >= NUM_SIZE_CLASSES {
            return Err(MbError::InvalidArg(format!(
                "allocation of {rounded} bytes exceeds arena slot limit"
            )));
        }
        Ok(class)
    }

    /// Allocates a slot of at least `size` bytes.
    ///
    /// Serves from the matching free-list class first; otherwise bumps the
    /// high-water mark, growing the backing file chunk by chunk up to the
    /// configured cap.
    ///
    /// # Errors
    ///
    /// Returns `NoMemory` when growth would exceed the cap.
    pub fn alloc(&self, hdr: &Header, size: usize) -> MbResult<u64> {
        let rounded = Self::slot_size(self.kind, size);
        let class = Self::class_of(self.kind, rounded)?;

        let head = hdr.free_head(self.kind, class)?;
        if head != 0 {
            let mut link = [0u8; Self::LINK_SIZE];
            self.backend
                .read_into(head + (rounded - Self::LINK_SIZE) as u64, &mut link)?;
            hdr.set_free_head(self.kind, class, u64::from_le_bytes(link))?;
            let pending = hdr.pending_free(self.kind)?;
            hdr.set_pending_free(self.kind, pending.saturating_sub(rounded as u64))?;
            return Ok(head);
        }

        let hwm = hdr.hwm(self.kind)?;
        let new_hwm = hwm + rounded as u64;
        let file_size = hdr.file_size(self.kind)?;
        if new_hwm > file_size {
            let grown = new_hwm.div_ceil(CHUNK_SIZE) * CHUNK_SIZE;
            if grown > self.memcap {
                return Err(MbError::NoMemory);
            }
            self.backend.grow_to(grown)?;
            hdr.set_file_size(self.kind, grown)?;
        }
        hdr.set_hwm(self.kind, new_hwm)?;
        Ok(hwm)
    }

    /// Frees the slot at `offset`, threading it onto its size-class list.
    pub fn free(&self, hdr: &Header, offset: u64, size: usize) -> MbResult<()> {
        let rounded = Self::slot_size(self.kind, size);
        let class = Self::class_of(self.kind, rounded)?;
        let head = hdr.free_head(self.kind, class)?;
        self.backend.write_at(
            offset + (rounded - Self::LINK_SIZE) as u64,
            &head.to_le_bytes(),
        )?;
        hdr.set_free_head(self.kind, class, offset)?;
        let pending = hdr.pending_free(self.kind)?;
        hdr.set_pending_free(self.kind, pending + rounded as u64)?;
        Ok(())
    }

    /// Reads `len` bytes at `offset`.
    pub fn read(&self, offset: u64, len: usize) -> MbResult<Vec<u8>> {
        Ok(self.backend.read_at(offset, len)?)
    }

    /// Reads into a caller buffer.
    pub fn read_into(&self, offset: u64, buf: &mut [u8]) -> MbResult<()> {
        Ok(self.backend.read_into(offset, buf)?)
    }

    /// Writes bytes at `offset`.
    pub fn write(&self, offset: u64, data: &[u8]) -> MbResult<()> {
        Ok(self.backend.write_at(offset, data)?)
    }

    /// Flushes the backend.
    pub fn flush(&self) -> MbResult<()> {
        Ok(self.backend.flush()?)
    }

    /// Syncs the backend to durable storage.
    pub fn sync(&self) -> MbResult<()> {
        Ok(self.backend.sync()?)
    }

    /// Number of slots on the free list serving allocations of `size`.
    ///
    /// Diagnostic; walks the list.
    pub fn free_count(&self, hdr: &Header, size: usize) -> MbResult<u64> {
        let rounded = Self::slot_size(self.kind, size);
        let class = Self::class_of(self.kind, rounded)?;
        let mut n = 0u64;
        let mut cursor = hdr.free_head(self.kind, class)?;
        while cursor != 0 {
            n += 1;
            let mut link = [0u8; Self::LINK_SIZE];
            self.backend
                .read_into(cursor + (rounded - Self::LINK_SIZE) as u64, &mut link)?;
            cursor = u64::from_le_bytes(link);
            if n > 1 << 32 {
                return Err(MbError::Unknown("free list cycle".into()));
            }
        }
        Ok(n)
    }

    /// True when `err` is a read past the mapped range - for readers this
    /// means a torn snapshot handed out a bogus offset, not corruption.
    #[must_use]
    pub fn is_out_of_range(err: &MbError) -> bool {
        matches!(
            err,
            MbError::Storage(StorageError::ReadPastEnd { .. })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::ARENA_START;
    use mabain_storage::MmapBackend;
    use tempfile::tempdir;

    fn arena_fixture(kind: ArenaKind) -> (tempfile::TempDir, Header, Arena) {
        let dir = tempdir().unwrap();
        let header = Header::map(&dir.path().join("_mabain_h")).unwrap();
        header.init(0).unwrap();
        let backend = MmapBackend::create(&dir.path().join("_arena")).unwrap();
        let arena = Arena::new(Box::new(backend), kind, 8 << 20);
        (dir, header, arena)
    }

    #[test]
    fn bump_allocation_advances_high_water() {
        let (_t, hdr, arena) = arena_fixture(ArenaKind::Index);
        let a = arena.alloc(&hdr, 8).unwrap();
        let b = arena.alloc(&hdr, 8).unwrap();
        assert_eq!(a, ARENA_START);
        assert_eq!(b, ARENA_START + 16);
        assert_eq!(hdr.hwm(ArenaKind::Index).unwrap(), ARENA_START + 32);
    }

    #[test]
    fn freed_slot_is_reused_exactly() {
        let (_t, hdr, arena) = arena_fixture(ArenaKind::Index);
        let a = arena.alloc(&hdr, 40).unwrap();
        let _b = arena.alloc(&hdr, 40).unwrap();
        arena.free(&hdr, a, 40).unwrap();
        assert_eq!(arena.free_count(&hdr, 40).unwrap(), 1);

        let c = arena.alloc(&hdr, 40).unwrap();
        assert_eq!(c, a);
        assert_eq!(arena.free_count(&hdr, 40).unwrap(), 0);
    }

    #[test]
    fn different_classes_do_not_mix() {
        let (_t, hdr, arena) = arena_fixture(ArenaKind::Index);
        let a = arena.alloc(&hdr, 16).unwrap();
        arena.free(&hdr, a, 16).unwrap();
        // A larger request must not be served from the small class.
        let b = arena.alloc(&hdr, 64).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn memcap_is_enforced() {
        let dir = tempdir().unwrap();
        let header = Header::map(&dir.path().join("_mabain_h")).unwrap();
        header.init(0).unwrap();
        let backend = MmapBackend::create(&dir.path().join("_arena")).unwrap();
        // Cap below one chunk: the very first growth fails.
        let arena = Arena::new(Box::new(backend), ArenaKind::Index, CHUNK_SIZE / 2);
        assert!(matches!(
            arena.alloc(&header, 16),
            Err(MbError::NoMemory)
        ));
    }

    #[test]
    fn pending_free_tracks_freed_bytes() {
        let (_t, hdr, arena) = arena_fixture(ArenaKind::Data);
        let a = arena.alloc(&hdr, 100).unwrap();
        arena.free(&hdr, a, 100).unwrap();
        assert_eq!(hdr.pending_free(ArenaKind::Data).unwrap(), 128);

        let _again = arena.alloc(&hdr, 100).unwrap();
        assert_eq!(hdr.pending_free(ArenaKind::Data).unwrap(), 0);
    }
}
