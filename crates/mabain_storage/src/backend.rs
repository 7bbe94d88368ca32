//! Storage backend trait definition.

use crate::error::StorageResult;

/// A low-level, offset-addressed storage backend.
///
/// Backends are **opaque byte stores**. They provide read and write access
/// at arbitrary offsets plus explicit growth. The trie engine owns all
/// format interpretation - backends do not understand nodes, edges, slots,
/// or free lists.
///
/// # Invariants
///
/// - `read_at` returns exactly the bytes last written at that offset
/// - `grow_to` only ever extends the store; it never shrinks it
/// - `flush` pushes pending writes toward durable storage
/// - Backends must be `Send + Sync`; all methods take `&self` so a single
///   backend can serve concurrent readers (implementations lock internally)
///
/// # Implementors
///
/// - [`super::InMemoryBackend`] - for unit tests
/// - [`super::MmapBackend`] - memory-mapped files for persistent arenas
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `ReadPastEnd` if the read extends beyond the current size.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Reads exactly `buf.len()` bytes starting at `offset` into `buf`.
    ///
    /// Avoids an allocation on hot read paths.
    fn read_into(&self, offset: u64, buf: &mut [u8]) -> StorageResult<()>;

    /// Writes `data` at `offset`. The target range must already exist.
    ///
    /// # Errors
    ///
    /// Returns `WritePastEnd` if the write extends beyond the current size,
    /// or `ReadOnly` for read-only backends.
    fn write_at(&self, offset: u64, data: &[u8]) -> StorageResult<()>;

    /// Extends the store to `new_size` bytes, zero-filling the new range.
    ///
    /// A `new_size` at or below the current size is a no-op.
    fn grow_to(&self, new_size: u64) -> StorageResult<()>;

    /// Returns the current size of the storage in bytes.
    fn size(&self) -> StorageResult<u64>;

    /// Flushes all pending writes to the OS.
    fn flush(&self) -> StorageResult<()>;

    /// Syncs data and metadata to durable storage.
    ///
    /// This is a stronger guarantee than `flush`.
    fn sync(&self) -> StorageResult<()>;
}
