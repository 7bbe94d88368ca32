//! The public store handle.
//!
//! A `Db` is one connector to a database directory: either the single
//! writer (synchronous or async) or one of many readers. Readers may live
//! in other processes; handle counts in the shared header track them.
//!
//! Lookup calls absorb `TryAgain` from the lock-free read protocol by
//! retrying with nanosecond backoff, so callers only ever see it after the
//! retry budget is exhausted under pathological write pressure.

use crate::async_writer::{AsyncWriter, Request};
use crate::config::{AccessMode, Options};
use crate::dict::{Dict, PrefixCursor};
use crate::dir::DbDir;
use crate::error::{MbError, MbResult};
use crate::header::HEADER_SIZE;
use crate::rc::ResourceCollection;
use crate::stats::DbStats;
use parking_lot::RwLock;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::info;

/// Lookup retry budget before `TryAgain` surfaces to the caller.
const MAX_READ_RETRIES: u64 = 100_000;

/// Backoff between lookup retries.
const RETRY_BACKOFF: Duration = Duration::from_nanos(100);

/// A handle to one database directory.
pub struct Db {
    path: PathBuf,
    options: Options,
    /// Holds the writer lock for the lifetime of a writer handle.
    _dir: DbDir,
    dict: Arc<RwLock<Dict>>,
    async_writer: Option<Arc<AsyncWriter>>,
    /// True when `async_writer` belongs to another handle's queue.
    attached: bool,
    stats: Arc<DbStats>,
    seen_generation: AtomicU64,
    open: bool,
    id: u32,
}

impl Db {
    /// Opens a handle to the database directory at `path`.
    ///
    /// The directory itself must exist. A writer creates the header and
    /// arena files on first open; a reader fails with `NoDb` until a
    /// writer has created them.
    pub fn open(path: impl AsRef<Path>, options: Options) -> MbResult<Self> {
        let path = path.as_ref().to_path_buf();
        if options.async_writer && options.mode != AccessMode::Writer {
            return Err(MbError::InvalidArg(
                "async writer mode requires a writer handle".into(),
            ));
        }
        let id = if options.id != 0 {
            options.id
        } else {
            std::process::id()
        };

        let (dir, init_header) = match options.mode {
            AccessMode::Writer => {
                let fresh = match fs::metadata(path.join("_mabain_h")) {
                    Ok(meta) => (meta.len() as usize) < HEADER_SIZE,
                    Err(_) => true,
                };
                (DbDir::open_writer(&path)?, fresh)
            }
            AccessMode::Reader => (DbDir::open_reader(&path)?, false),
        };

        let dict = Dict::open(&dir, &options, init_header)?;
        if options.mode == AccessMode::Reader {
            dict.header().update_num_reader(1)?;
        }
        let generation = dict.header().rc_generation()?;
        let dict = Arc::new(RwLock::new(dict));

        let async_writer = if options.async_writer {
            Some(AsyncWriter::start(Arc::clone(&dict))?)
        } else {
            None
        };

        info!(
            id,
            dir = %path.display(),
            mode = ?options.mode,
            async_writer = options.async_writer,
            "connector opened db"
        );
        Ok(Self {
            path,
            options,
            _dir: dir,
            dict,
            async_writer,
            attached: false,
            stats: Arc::new(DbStats::new()),
            seen_generation: AtomicU64::new(generation),
            open: true,
            id,
        })
    }

    /// True until `close` runs.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// The handle's current status: `Ok` while the handle is usable,
    /// `DbClosed` after `close`. Open failures surface from [`Db::open`]
    /// itself, so a constructed handle starts out healthy.
    pub fn status(&self) -> MbResult<()> {
        self.check_open()
    }

    /// The directory this handle is connected to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// This handle's operation counters.
    #[must_use]
    pub fn stats(&self) -> &DbStats {
        &self.stats
    }

    /// The underlying dictionary, for diagnostics and test harnesses.
    /// Only a writer handle exposes it.
    #[must_use]
    pub fn dict(&self) -> Option<Arc<RwLock<Dict>>> {
        (self.options.mode == AccessMode::Writer).then(|| Arc::clone(&self.dict))
    }

    fn check_open(&self) -> MbResult<()> {
        if !self.open {
            return Err(MbError::DbClosed);
        }
        Ok(())
    }

    fn check_lookup_allowed(&self) -> MbResult<()> {
        self.check_open()?;
        // The async-mode writer is not a reader.
        if self.options.async_writer {
            return Err(MbError::NotAllowed);
        }
        Ok(())
    }

    /// Remaps the arenas if a resource collection swapped them.
    fn ensure_generation(&self) -> MbResult<()> {
        let current = self.dict.read().header().rc_generation()?;
        if current != self.seen_generation.load(Ordering::Acquire) {
            let mut dict = self.dict.write();
            let fresh = dict.header().rc_generation()?;
            dict.reopen_arenas()?;
            self.seen_generation.store(fresh, Ordering::Release);
        }
        Ok(())
    }

    fn with_retries<T>(&self, mut op: impl FnMut() -> MbResult<T>) -> MbResult<T> {
        let mut retries = 0u64;
        let result = loop {
            match op() {
                Err(MbError::TryAgain) if retries < MAX_READ_RETRIES => {
                    retries += 1;
                    thread::sleep(RETRY_BACKOFF);
                }
                other => break other,
            }
        };
        self.stats.record_retries(retries);
        result
    }

    // === lookups ===

    /// Exact-match lookup.
    ///
    /// On a synchronous writer handle opened with the find-and-delete
    /// option, a successful lookup also removes the key.
    pub fn find(&self, key: &[u8]) -> MbResult<Vec<u8>> {
        self.check_lookup_allowed()?;
        self.ensure_generation()?;
        self.stats.record_find();
        let value = self.with_retries(|| self.dict.read().find(key))?;
        if self.options.find_and_delete && self.options.is_sync_writer() {
            self.dict.write().remove(key)?;
        }
        Ok(value)
    }

    /// Longest-prefix lookup: `(prefix_len, value)` of the longest present
    /// key that is a prefix of `key`.
    pub fn find_longest_prefix(&self, key: &[u8]) -> MbResult<(usize, Vec<u8>)> {
        self.check_lookup_allowed()?;
        self.ensure_generation()?;
        self.stats.record_prefix_find();
        self.with_retries(|| self.dict.read().find_longest_prefix(key))
    }

    /// Resumable prefix enumeration.
    ///
    /// With the all-prefix option, each call yields the next-longer present
    /// prefix of `key`; without it, the first call yields the longest
    /// prefix and the cursor is exhausted.
    pub fn find_prefix(
        &self,
        key: &[u8],
        cursor: &mut PrefixCursor,
    ) -> MbResult<Option<(usize, Vec<u8>)>> {
        self.check_lookup_allowed()?;
        self.ensure_generation()?;
        self.stats.record_prefix_find();
        if !self.options.all_prefix {
            if cursor.done {
                return Ok(None);
            }
            cursor.done = true;
            return match self.with_retries(|| self.dict.read().find_longest_prefix(key)) {
                Ok((len, value)) => {
                    cursor.match_len = len;
                    Ok(Some((len, value)))
                }
                Err(MbError::NotExist) => Ok(None),
                Err(e) => Err(e),
            };
        }
        self.with_retries(|| {
            let mut scratch = cursor.clone();
            let yielded = self.dict.read().find_prefix(key, &mut scratch)?;
            *cursor = scratch;
            Ok(yielded)
        })
    }

    // === mutations ===

    /// Inserts a key; fails with `InDict` if present.
    pub fn add(&self, key: &[u8], value: &[u8]) -> MbResult<()> {
        self.add_with(key, value, false)
    }

    /// Inserts a key, optionally overwriting an existing value.
    pub fn add_with(&self, key: &[u8], value: &[u8], overwrite: bool) -> MbResult<()> {
        self.check_open()?;
        self.stats.record_add();
        if let Some(writer) = &self.async_writer {
            return writer.submit(Request::Add {
                key: key.to_vec(),
                value: value.to_vec(),
                overwrite,
            });
        }
        if self.options.mode != AccessMode::Writer {
            return Err(MbError::NotAllowed);
        }
        self.dict.write().add(key, value, overwrite)
    }

    /// Removes a key.
    pub fn remove(&self, key: &[u8]) -> MbResult<()> {
        self.check_open()?;
        self.stats.record_remove();
        if let Some(writer) = &self.async_writer {
            return writer.submit(Request::Remove { key: key.to_vec() });
        }
        if self.options.mode != AccessMode::Writer {
            return Err(MbError::NotAllowed);
        }
        self.dict.write().remove(key)
    }

    /// Removes every key and reinitializes the arenas.
    pub fn remove_all(&self) -> MbResult<()> {
        self.check_open()?;
        if let Some(writer) = &self.async_writer {
            return writer.submit(Request::RemoveAll);
        }
        if self.options.mode != AccessMode::Writer {
            return Err(MbError::NotAllowed);
        }
        self.dict.write().remove_all()
    }

    /// Compacts the arenas when at least `min_index` / `min_data` freed
    /// bytes have accumulated; `RcSkipped` otherwise.
    pub fn collect_resource(&self, min_index: u64, min_data: u64) -> MbResult<()> {
        self.check_open()?;
        if let Some(writer) = &self.async_writer {
            return writer.submit(Request::Collect {
                min_index,
                min_data,
            });
        }
        if self.options.mode != AccessMode::Writer {
            return Err(MbError::NotAllowed);
        }
        let mut dict = self.dict.write();
        ResourceCollection::new(&mut dict).reclaim(min_index, min_data)?;
        self.stats.record_collection();
        Ok(())
    }

    // === async queue attachment ===

    /// Opts this reader handle into submitting mutations through the
    /// writer handle's async queue.
    pub fn set_async_writer_ptr(&mut self, writer: &Db) -> MbResult<()> {
        self.check_open()?;
        if self.options.mode == AccessMode::Writer {
            return Err(MbError::NotAllowed);
        }
        if writer.path != self.path {
            return Err(MbError::InvalidArg("writer serves a different db".into()));
        }
        let Some(queue) = &writer.async_writer else {
            return Err(MbError::InvalidArg("handle has no async writer".into()));
        };
        if self.async_writer.is_some() {
            return Err(MbError::InvalidArg("already attached".into()));
        }
        queue.update_num_users(1);
        self.async_writer = Some(Arc::clone(queue));
        self.attached = true;
        Ok(())
    }

    /// Detaches this reader handle from the writer's async queue.
    pub fn unset_async_writer_ptr(&mut self, writer: &Db) -> MbResult<()> {
        self.check_open()?;
        if self.options.mode == AccessMode::Writer {
            return Err(MbError::NotAllowed);
        }
        if writer.path != self.path {
            return Err(MbError::InvalidArg("writer serves a different db".into()));
        }
        if !self.attached {
            return Err(MbError::InvalidArg("not attached".into()));
        }
        if let Some(queue) = self.async_writer.take() {
            queue.update_num_users(-1);
        }
        self.attached = false;
        Ok(())
    }

    // === maintenance ===

    /// Number of present keys.
    pub fn count(&self) -> MbResult<u64> {
        self.check_open()?;
        self.dict.read().count()
    }

    /// Flushes arenas and header toward durable storage.
    pub fn flush(&self) -> MbResult<()> {
        self.check_open()?;
        self.dict.read().flush()
    }

    /// Writes handle counters and store state to `sink`.
    pub fn print_stats(&self, sink: &mut dyn Write) -> MbResult<()> {
        self.check_open()?;
        let snapshot = self.dict.read().header().snapshot()?;
        writeln!(sink, "=== store ===")?;
        writeln!(sink, "entry count:         {}", snapshot.count)?;
        writeln!(
            sink,
            "index arena:         {} used of {}",
            snapshot.index_hwm, snapshot.index_file_size
        )?;
        writeln!(
            sink,
            "data arena:          {} used of {}",
            snapshot.data_hwm, snapshot.data_file_size
        )?;
        writeln!(
            sink,
            "pending free:        {} index, {} data",
            snapshot.index_pending_free, snapshot.data_pending_free
        )?;
        writeln!(sink, "=== handle {} ===", self.id)?;
        writeln!(sink, "finds:               {}", self.stats.finds())?;
        writeln!(sink, "prefix finds:        {}", self.stats.prefix_finds())?;
        writeln!(sink, "adds:                {}", self.stats.adds())?;
        writeln!(sink, "removes:             {}", self.stats.removes())?;
        writeln!(sink, "read retries:        {}", self.stats.retries())?;
        writeln!(sink, "collections:         {}", self.stats.collections())?;
        Ok(())
    }

    /// Dumps every header field to `sink`.
    pub fn print_header(&self, sink: &mut dyn Write) -> MbResult<()> {
        self.check_open()?;
        let snapshot = self.dict.read().header().snapshot()?;
        write!(sink, "{snapshot}")?;
        Ok(())
    }

    /// Closes the handle. A writer in async mode first waits for attached
    /// users to detach and for the queue to drain.
    pub fn close(&mut self) -> MbResult<()> {
        if !self.open {
            return Ok(());
        }
        if let Some(queue) = self.async_writer.take() {
            if self.attached {
                // Implicit detach for a reader that forgot to unset.
                queue.update_num_users(-1);
            } else {
                queue.stop()?;
            }
        }
        {
            let dict = self.dict.read();
            dict.flush()?;
            match self.options.mode {
                AccessMode::Writer => {
                    dict.header().set_num_writer(0)?;
                    dict.header().flush()?;
                }
                AccessMode::Reader => {
                    dict.header().update_num_reader(-1)?;
                }
            }
        }
        self.open = false;
        info!(id = self.id, "connector disconnected from db");
        Ok(())
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if self.open {
            let _ = self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn writer_then_reader_round_trip() {
        let tmp = tempdir().unwrap();
        let writer = Db::open(tmp.path(), Options::writer()).unwrap();
        writer.add(b"alpha", b"1").unwrap();
        writer.add(b"beta", b"2").unwrap();

        let reader = Db::open(tmp.path(), Options::reader()).unwrap();
        assert_eq!(reader.find(b"alpha").unwrap(), b"1");
        assert_eq!(reader.find(b"beta").unwrap(), b"2");
        assert!(matches!(reader.find(b"gamma"), Err(MbError::NotExist)));
        assert_eq!(reader.count().unwrap(), 2);
    }

    #[test]
    fn reader_cannot_mutate() {
        let tmp = tempdir().unwrap();
        let writer = Db::open(tmp.path(), Options::writer()).unwrap();
        writer.add(b"k", b"v").unwrap();

        let reader = Db::open(tmp.path(), Options::reader()).unwrap();
        assert!(matches!(reader.add(b"x", b"y"), Err(MbError::NotAllowed)));
        assert!(matches!(reader.remove(b"k"), Err(MbError::NotAllowed)));
        assert!(matches!(reader.remove_all(), Err(MbError::NotAllowed)));
    }

    #[test]
    fn reader_open_without_db_fails() {
        let tmp = tempdir().unwrap();
        assert!(matches!(
            Db::open(tmp.path(), Options::reader()),
            Err(MbError::NoDb(_))
        ));
    }

    #[test]
    fn second_writer_rejected() {
        let tmp = tempdir().unwrap();
        let _writer = Db::open(tmp.path(), Options::writer()).unwrap();
        assert!(matches!(
            Db::open(tmp.path(), Options::writer()),
            Err(MbError::NotAllowed)
        ));
    }

    #[test]
    fn contents_survive_reopen() {
        let tmp = tempdir().unwrap();
        {
            let mut writer = Db::open(tmp.path(), Options::writer()).unwrap();
            writer.add(b"persistent", b"yes").unwrap();
            writer.close().unwrap();
        }
        let writer = Db::open(tmp.path(), Options::writer()).unwrap();
        assert_eq!(writer.find(b"persistent").unwrap(), b"yes");
        assert_eq!(writer.count().unwrap(), 1);
    }

    #[test]
    fn async_handle_cannot_look_up() {
        let tmp = tempdir().unwrap();
        let mut writer =
            Db::open(tmp.path(), Options::writer().async_writer(true)).unwrap();
        writer.add(b"k", b"v").unwrap();
        assert!(matches!(writer.find(b"k"), Err(MbError::NotAllowed)));
        assert!(matches!(
            writer.find_longest_prefix(b"k"),
            Err(MbError::NotAllowed)
        ));
        writer.close().unwrap();

        let reader = Db::open(tmp.path(), Options::reader()).unwrap();
        assert_eq!(reader.find(b"k").unwrap(), b"v");
    }

    #[test]
    fn attached_reader_submits_mutations() {
        let tmp = tempdir().unwrap();
        let mut writer =
            Db::open(tmp.path(), Options::writer().async_writer(true)).unwrap();
        writer.add(b"seed", b"1").unwrap();

        let mut reader = Db::open(tmp.path(), Options::reader()).unwrap();
        reader.set_async_writer_ptr(&writer).unwrap();
        reader.add(b"via-queue", b"2").unwrap();
        reader.unset_async_writer_ptr(&writer).unwrap();
        writer.close().unwrap();

        let check = Db::open(tmp.path(), Options::reader()).unwrap();
        assert_eq!(check.find(b"via-queue").unwrap(), b"2");
    }

    #[test]
    fn attach_validations() {
        let tmp = tempdir().unwrap();
        let other = tempdir().unwrap();
        {
            let writer_sync = Db::open(tmp.path(), Options::writer()).unwrap();
            writer_sync.add(b"k", b"v").unwrap();

            let mut reader = Db::open(tmp.path(), Options::reader()).unwrap();
            // Sync writer has no queue.
            assert!(matches!(
                reader.set_async_writer_ptr(&writer_sync),
                Err(MbError::InvalidArg(_))
            ));
        }

        let mut writer_async =
            Db::open(tmp.path(), Options::writer().async_writer(true)).unwrap();
        let mut other_writer =
            Db::open(other.path(), Options::writer().async_writer(true)).unwrap();
        let mut reader = Db::open(tmp.path(), Options::reader()).unwrap();

        // A queue serving a different directory is rejected.
        assert!(matches!(
            reader.set_async_writer_ptr(&other_writer),
            Err(MbError::InvalidArg(_))
        ));
        // Detaching before attaching is rejected.
        assert!(matches!(
            reader.unset_async_writer_ptr(&writer_async),
            Err(MbError::InvalidArg(_))
        ));
        reader.set_async_writer_ptr(&writer_async).unwrap();
        assert!(matches!(
            reader.set_async_writer_ptr(&writer_async),
            Err(MbError::InvalidArg(_))
        ));
        reader.unset_async_writer_ptr(&writer_async).unwrap();
        writer_async.close().unwrap();
        other_writer.close().unwrap();
    }

    #[test]
    fn find_and_delete_option() {
        let tmp = tempdir().unwrap();
        let writer =
            Db::open(tmp.path(), Options::writer().find_and_delete(true)).unwrap();
        writer.add(b"once", b"gone").unwrap();
        assert_eq!(writer.find(b"once").unwrap(), b"gone");
        assert!(matches!(writer.find(b"once"), Err(MbError::NotExist)));
    }

    #[test]
    fn prefix_modes() {
        let tmp = tempdir().unwrap();
        let writer = Db::open(tmp.path(), Options::writer()).unwrap();
        writer.add(b"a", b"1").unwrap();
        writer.add(b"ab", b"2").unwrap();
        writer.add(b"abc", b"3").unwrap();

        // Default: longest only.
        let mut cursor = PrefixCursor::new();
        let first = writer.find_prefix(b"abcd", &mut cursor).unwrap();
        assert_eq!(first, Some((3, b"3".to_vec())));
        assert!(writer.find_prefix(b"abcd", &mut cursor).unwrap().is_none());
        drop(writer);

        // All-prefix enumeration.
        let reader = Db::open(tmp.path(), Options::reader().all_prefix(true)).unwrap();
        let mut cursor = PrefixCursor::new();
        let mut lengths = Vec::new();
        while let Some((len, _)) = reader.find_prefix(b"abcd", &mut cursor).unwrap() {
            lengths.push(len);
        }
        assert_eq!(lengths, vec![1, 2, 3]);
    }

    #[test]
    fn closed_handle_rejects_operations() {
        let tmp = tempdir().unwrap();
        let mut writer = Db::open(tmp.path(), Options::writer()).unwrap();
        writer.add(b"k", b"v").unwrap();
        assert!(writer.status().is_ok());
        writer.close().unwrap();
        assert!(matches!(writer.status(), Err(MbError::DbClosed)));
        assert!(matches!(writer.add(b"x", b"y"), Err(MbError::DbClosed)));
        assert!(matches!(writer.find(b"k"), Err(MbError::DbClosed)));
        assert!(matches!(writer.count(), Err(MbError::DbClosed)));
    }

    #[test]
    fn print_stats_and_header() {
        let tmp = tempdir().unwrap();
        let writer = Db::open(tmp.path(), Options::writer()).unwrap();
        writer.add(b"k", b"v").unwrap();
        let _ = writer.find(b"k").unwrap();

        let mut out = Vec::new();
        writer.print_stats(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("entry count:         1"));
        assert!(text.contains("finds:               1"));

        let mut out = Vec::new();
        writer.print_header(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("root offset"));
    }
}
