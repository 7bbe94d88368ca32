//! # Mabain Core
//!
//! An embedded, persistent key-value store whose on-disk representation is
//! a radix trie held in memory-mapped files.
//!
//! This crate provides:
//! - the on-disk data model: two offset-addressed arenas (trie index and
//!   leaf payloads) plus a fixed header record
//! - exact lookup, all-prefix enumeration, and longest-prefix match
//! - a single-writer update protocol with crash-recovery journaling
//! - a lock-free reader protocol that cooperates with a mutating writer,
//!   across process boundaries
//! - an asynchronous writer queue funneling writes from many threads into
//!   one mutator
//! - resource collection that compacts both arenas
//!
//! ## Opening a store
//!
//! ```rust,ignore
//! use mabain_core::{Db, Options};
//!
//! let writer = Db::open("/var/tmp/store", Options::writer())?;
//! writer.add(b"apple", b"1")?;
//!
//! // Readers may run in other processes.
//! let reader = Db::open("/var/tmp/store", Options::reader())?;
//! assert_eq!(reader.find(b"apple")?, b"1");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod arena;
mod async_writer;
pub mod config;
mod db;
mod dict;
mod dir;
mod error;
mod header;
mod rc;
mod recovery;
mod stats;
mod trie;

pub use arena::Arena;
pub use config::{AccessMode, Options};
pub use db::Db;
pub use dict::{Dict, PrefixCursor};
pub use dir::DbDir;
pub use error::{MbError, MbResult};
pub use header::{ArenaKind, ExceptionClass, Header, HeaderSnapshot, ROOT_PARENT};
pub use rc::ResourceCollection;
pub use stats::DbStats;
pub use trie::{EdgeRec, NodeRec, TrieMem, EDGE_RECORD_SIZE, NODE_HEADER_SIZE};
