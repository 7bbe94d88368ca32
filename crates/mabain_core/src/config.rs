//! Open options and engine constants.

/// Longest accepted key, in bytes.
pub const MAX_KEY_LENGTH: usize = 4096;

/// Largest accepted value, in bytes.
///
/// Chosen so a data slot (2-byte length prefix, payload, and free-link
/// space) still fits the largest data-arena size class.
pub const MAX_DATA_SIZE: usize = 32_758;

/// Arena files grow in chunks of this many bytes.
pub const CHUNK_SIZE: u64 = 1 << 20;

/// Default cap on the index arena.
pub const DEFAULT_MEMCAP_INDEX: u64 = 64 << 20;

/// Default cap on the data arena.
pub const DEFAULT_MEMCAP_DATA: u64 = 64 << 20;

/// Number of slots in the async writer ring.
pub const ASYNC_QUEUE_SIZE: usize = 256;

/// How a handle accesses the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Read path enabled, all mutators disabled.
    Reader,
    /// Synchronous mutation enabled.
    Writer,
}

/// Options for opening a store handle.
///
/// ```rust,ignore
/// let opts = Options::writer()
///     .async_writer(true)
///     .memcap_index(128 << 20);
/// let db = Db::open(path, opts)?;
/// ```
#[derive(Debug, Clone)]
pub struct Options {
    /// Access mode for this handle.
    pub mode: AccessMode,

    /// Run a background mutator thread fed by a bounded ring buffer.
    /// Requires [`AccessMode::Writer`]; lookups are forbidden on the handle.
    pub async_writer: bool,

    /// `find_prefix` enumerates every prefix match instead of only the
    /// longest one.
    pub all_prefix: bool,

    /// A successful `find` on a synchronous writer handle also deletes the
    /// key, in a single traversal.
    pub find_and_delete: bool,

    /// Cap on the index arena in bytes.
    pub memcap_index: u64,

    /// Cap on the data arena in bytes.
    pub memcap_data: u64,

    /// Fixed per-entry value size; `None` for variable-size values.
    pub data_size: Option<u32>,

    /// Connector identifier used in log lines; 0 picks a per-process value.
    pub id: u32,
}

impl Options {
    /// Options for a reader handle.
    #[must_use]
    pub fn reader() -> Self {
        Self::with_mode(AccessMode::Reader)
    }

    /// Options for a synchronous writer handle.
    #[must_use]
    pub fn writer() -> Self {
        Self::with_mode(AccessMode::Writer)
    }

    fn with_mode(mode: AccessMode) -> Self {
        Self {
            mode,
            async_writer: false,
            all_prefix: false,
            find_and_delete: false,
            memcap_index: DEFAULT_MEMCAP_INDEX,
            memcap_data: DEFAULT_MEMCAP_DATA,
            data_size: None,
            id: 0,
        }
    }

    /// Sets async writer mode.
    #[must_use]
    pub const fn async_writer(mut self, value: bool) -> Self {
        self.async_writer = value;
        self
    }

    /// Sets all-prefix enumeration for `find_prefix`.
    #[must_use]
    pub const fn all_prefix(mut self, value: bool) -> Self {
        self.all_prefix = value;
        self
    }

    /// Sets find-and-delete behavior for `find` on a writer handle.
    #[must_use]
    pub const fn find_and_delete(mut self, value: bool) -> Self {
        self.find_and_delete = value;
        self
    }

    /// Sets the index arena cap.
    #[must_use]
    pub const fn memcap_index(mut self, bytes: u64) -> Self {
        self.memcap_index = bytes;
        self
    }

    /// Sets the data arena cap.
    #[must_use]
    pub const fn memcap_data(mut self, bytes: u64) -> Self {
        self.memcap_data = bytes;
        self
    }

    /// Fixes the per-entry value size.
    #[must_use]
    pub const fn data_size(mut self, bytes: u32) -> Self {
        self.data_size = Some(bytes);
        self
    }

    /// Sets the connector identifier.
    #[must_use]
    pub const fn id(mut self, id: u32) -> Self {
        self.id = id;
        self
    }

    /// True when this handle may call `Dict` mutators synchronously.
    #[must_use]
    pub fn is_sync_writer(&self) -> bool {
        self.mode == AccessMode::Writer && !self.async_writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_pattern() {
        let opts = Options::writer()
            .async_writer(true)
            .memcap_index(1 << 20)
            .data_size(32);

        assert_eq!(opts.mode, AccessMode::Writer);
        assert!(opts.async_writer);
        assert_eq!(opts.memcap_index, 1 << 20);
        assert_eq!(opts.data_size, Some(32));
        assert!(!opts.is_sync_writer());
    }

    #[test]
    fn reader_defaults() {
        let opts = Options::reader();
        assert_eq!(opts.mode, AccessMode::Reader);
        assert!(!opts.async_writer);
        assert_eq!(opts.memcap_index, DEFAULT_MEMCAP_INDEX);
    }
}
