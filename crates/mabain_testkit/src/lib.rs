//! # Mabain Testkit
//!
//! Test utilities for the mabain trie store.
//!
//! This crate provides:
//! - Deterministic key generators matching common key shapes
//! - Temp-directory database fixtures
//! - The abnormal-exit harness for crash-recovery simulation
//! - Property-based generators using proptest
//!
//! Cross-crate integration tests live in this crate's `tests/` directory.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use mabain_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_database() {
//!     with_writer_db(|db| {
//!         db.add(b"key", b"value").unwrap();
//!     });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod keys;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::crash::CrashHarness;
    pub use crate::fixtures::{with_writer_db, TestDb};
    pub use crate::generators::*;
    pub use crate::keys::{KeyKind, TestKey};
}

pub use crash::CrashHarness;
pub use fixtures::{with_writer_db, TestDb};
pub use keys::{KeyKind, TestKey};
