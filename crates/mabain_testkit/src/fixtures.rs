//! Test fixtures and database helpers.

use mabain_core::{Db, MbResult, Options};
use std::path::Path;
use tempfile::TempDir;

/// A writer database in a temporary directory with automatic cleanup.
pub struct TestDb {
    /// The writer handle.
    pub db: Db,
    /// Kept alive so the directory outlives the handle.
    temp_dir: TempDir,
}

impl TestDb {
    /// Creates a fresh store with a synchronous writer handle.
    pub fn writer() -> Self {
        Self::with_options(Options::writer())
    }

    /// Creates a fresh store with the given open options.
    pub fn with_options(options: Options) -> Self {
        let temp_dir = TempDir::new().expect("create temp directory");
        let db = Db::open(temp_dir.path(), options).expect("open writer db");
        Self { db, temp_dir }
    }

    /// The database directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Opens an additional reader handle on the same directory.
    pub fn reader(&self) -> MbResult<Db> {
        Db::open(self.path(), Options::reader())
    }

    /// Opens an additional reader handle with specific options.
    pub fn reader_with(&self, options: Options) -> MbResult<Db> {
        Db::open(self.path(), options)
    }
}

impl std::ops::Deref for TestDb {
    type Target = Db;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

impl std::ops::DerefMut for TestDb {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.db
    }
}

/// Runs a test body against a fresh writer database.
pub fn with_writer_db<F, R>(f: F) -> R
where
    F: FnOnce(&Db) -> R,
{
    let fixture = TestDb::writer();
    f(&fixture.db)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixture_round_trip() {
        with_writer_db(|db| {
            db.add(b"hello", b"world").unwrap();
            assert_eq!(db.find(b"hello").unwrap(), b"world");
        });
    }

    #[test]
    fn reader_sees_writer_data() {
        let fixture = TestDb::writer();
        fixture.add(b"shared", b"data").unwrap();
        let reader = fixture.reader().unwrap();
        assert_eq!(reader.find(b"shared").unwrap(), b"data");
    }
}
