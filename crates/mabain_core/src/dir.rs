//! Database directory management.
//!
//! File system layout:
//!
//! ```text
//! <db_dir>/
//! ├─ _mabain_h     # header record (fixed size, mapped by every handle)
//! ├─ _ibfl         # index arena (trie nodes and edges), grown in chunks
//! ├─ _dbfl         # data arena (leaf payloads)
//! └─ mabain.log    # log sink, written by the embedding writer process
//! ```
//!
//! The writer holds an exclusive advisory lock on the header file for its
//! whole lifetime. The kernel releases the lock when the process dies, so a
//! crashed writer never wedges the directory; the next writer open detects
//! the stale handle counts and recovers.

use crate::error::{MbError, MbResult};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// File names within the database directory.
const HEADER_FILE: &str = "_mabain_h";
const INDEX_FILE: &str = "_ibfl";
const DATA_FILE: &str = "_dbfl";
const LOG_FILE: &str = "mabain.log";
/// Scratch files produced by resource collection before the atomic swap.
const INDEX_RC_FILE: &str = "_ibfl.rc";
const DATA_RC_FILE: &str = "_dbfl.rc";

/// Paths and writer locking for one database directory.
#[derive(Debug)]
pub struct DbDir {
    path: PathBuf,
    /// Exclusive lock handle; held only by writer handles.
    lock_file: Option<File>,
}

impl DbDir {
    /// Opens the directory for a reader handle. The directory and the
    /// header file must already exist.
    pub fn open_reader(path: &Path) -> MbResult<Self> {
        let dir = Self::checked(path)?;
        if !dir.header_path().exists() {
            return Err(MbError::NoDb(format!(
                "no header in {}",
                dir.path.display()
            )));
        }
        Ok(dir)
    }

    /// Opens the directory for a writer handle, acquiring the exclusive
    /// writer lock.
    ///
    /// # Errors
    ///
    /// Returns `NotAllowed` if another live writer holds the lock.
    pub fn open_writer(path: &Path) -> MbResult<Self> {
        let mut dir = Self::checked(path)?;
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.header_path())?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(MbError::NotAllowed);
        }
        dir.lock_file = Some(lock_file);
        Ok(dir)
    }

    fn checked(path: &Path) -> MbResult<Self> {
        if !path.is_dir() {
            return Err(MbError::NoDb(format!(
                "database directory check for {} failed",
                path.display()
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
            lock_file: None,
        })
    }

    /// Returns the database directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the header file path.
    #[must_use]
    pub fn header_path(&self) -> PathBuf {
        self.path.join(HEADER_FILE)
    }

    /// Returns the index arena file path.
    #[must_use]
    pub fn index_path(&self) -> PathBuf {
        self.path.join(INDEX_FILE)
    }

    /// Returns the data arena file path.
    #[must_use]
    pub fn data_path(&self) -> PathBuf {
        self.path.join(DATA_FILE)
    }

    /// Returns the log file path for the embedding process to write.
    #[must_use]
    pub fn log_path(&self) -> PathBuf {
        self.path.join(LOG_FILE)
    }

    /// Returns the resource-collection scratch path for the index arena.
    #[must_use]
    pub fn index_rc_path(&self) -> PathBuf {
        self.path.join(INDEX_RC_FILE)
    }

    /// Returns the resource-collection scratch path for the data arena.
    #[must_use]
    pub fn data_rc_path(&self) -> PathBuf {
        self.path.join(DATA_RC_FILE)
    }

    /// True when this handle holds the writer lock.
    #[must_use]
    pub fn is_writer(&self) -> bool {
        self.lock_file.is_some()
    }
}

impl Drop for DbDir {
    fn drop(&mut self) {
        // The kernel drops the advisory lock when the file closes.
    }
}
