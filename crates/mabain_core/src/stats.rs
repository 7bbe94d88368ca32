//! Handle-level operation counters.
//!
//! All counters are atomic and can be read while operations are in
//! progress. They are per-handle and in-memory only; persistent store
//! state (entry count, arena sizes) lives in the header.

use std::sync::atomic::{AtomicU64, Ordering};

/// Operation counters for one handle.
#[derive(Debug, Default)]
pub struct DbStats {
    finds: AtomicU64,
    prefix_finds: AtomicU64,
    adds: AtomicU64,
    removes: AtomicU64,
    retries: AtomicU64,
    collections: AtomicU64,
}

impl DbStats {
    /// Creates a zeroed stats block.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_find(&self) {
        self.finds.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_prefix_find(&self) {
        self.prefix_finds.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_add(&self) {
        self.adds.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_remove(&self) {
        self.removes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retries(&self, n: u64) {
        if n > 0 {
            self.retries.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_collection(&self) {
        self.collections.fetch_add(1, Ordering::Relaxed);
    }

    /// Total exact and prefix lookups.
    pub fn finds(&self) -> u64 {
        self.finds.load(Ordering::Relaxed)
    }

    /// Total prefix lookups.
    pub fn prefix_finds(&self) -> u64 {
        self.prefix_finds.load(Ordering::Relaxed)
    }

    /// Total add operations submitted through this handle.
    pub fn adds(&self) -> u64 {
        self.adds.load(Ordering::Relaxed)
    }

    /// Total remove operations submitted through this handle.
    pub fn removes(&self) -> u64 {
        self.removes.load(Ordering::Relaxed)
    }

    /// Total lock-free read retries.
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Total resource collections run through this handle.
    pub fn collections(&self) -> u64 {
        self.collections.load(Ordering::Relaxed)
    }
}
