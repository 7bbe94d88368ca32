//! Crash recovery from the header's exception descriptor.
//!
//! Every destructive mutation journals the single slot it is about to
//! overwrite together with the image recovery should put there (see
//! `dict.rs`). Recovery is therefore one write plus invariant repair:
//!
//! - `ADD_EDGE` / `ADD_NODE` / `ADD_DATA_OFF` - the image is the slot's
//!   pre-mutation bytes; writing it back undoes the insert, as if the
//!   mutation never happened. Fresh records the mutation allocated become
//!   unreachable leaks, reclaimed by the next resource collection.
//! - `REMOVE_EDGE` / `CLEAR_EDGE` - the image is the intended post-mutation
//!   bytes; writing it replays the removal to completion.
//! - `RC_SWAP` - an interrupted arena swap is aborted or completed based on
//!   which scratch files survive; see below.
//!
//! After the image is restored, the journaled entry count is installed and
//! the free lists are abandoned (an undo can resurrect a slot that was
//! about to be threaded onto one, so the lists cannot be trusted). An
//! orphaned writer with no journal record instead gets a full recount from
//! a live-trie walk. Both repairs keep the header's global invariants
//! unconditional.

use crate::dict::Dict;
use crate::error::{MbError, MbResult};
use crate::header::{ArenaKind, ExceptionClass, ROOT_PARENT};
use std::fs;
use tracing::{info, warn};

impl Dict {
    /// Runs on every writer open: detects an interrupted mutation or an
    /// orphaned writer (stale handle count with a free writer lock) and
    /// repairs the store before any new mutation is accepted.
    pub(crate) fn writer_startup_recovery(&mut self) -> MbResult<()> {
        let status = self.header().excep_status()?;
        let orphaned = self.header().num_writer()? != 0;
        if status == ExceptionClass::None && !orphaned {
            self.cleanup_rc_scratch()?;
            return Ok(());
        }
        warn!(
            ?status,
            orphaned, "previous writer did not shut down cleanly, recovering"
        );
        self.exception_recovery()?;
        self.cleanup_rc_scratch()?;
        Ok(())
    }

    /// Replays or undoes the journaled mutation and re-establishes the
    /// header's global invariants.
    ///
    /// Safe to call when no exception is pending; the invariant repair
    /// still runs.
    pub fn exception_recovery(&mut self) -> MbResult<()> {
        let class = self.header().excep_status()?;
        match class {
            ExceptionClass::None => {
                // No record: the trie is consistent, but a crashed writer
                // may have left the count or free lists untrustworthy.
                self.header().clear_free_lists()?;
                let count = self.recount()?;
                self.header().set_count(count)?;
                self.header().flush()?;
                info!(count, "recovery complete");
                return Ok(());
            }
            ExceptionClass::RcSwap => self.complete_rc_swap()?,
            _ => {
                let target = self.header().excep_offset()?;
                let image = self.header().excep_image()?;
                warn!(?class, target, "restoring journaled slot image");
                if target == ROOT_PARENT {
                    if image.len() != 8 {
                        return Err(MbError::NoDb(
                            "root journal image has wrong length".into(),
                        ));
                    }
                    let root = u64::from_le_bytes(image.as_slice().try_into().expect("8 bytes"));
                    self.header().set_root_offset(root)?;
                } else {
                    self.mem().write_raw(target, &image)?;
                }
                self.header().set_count(self.header().excep_saved_count()?)?;
            }
        }

        self.header().journal_clear()?;
        // An undo can resurrect slots that were already threaded onto a
        // list, so the lists cannot be trusted after any recovery.
        self.header().clear_free_lists()?;
        self.header().flush()?;
        info!(count = self.header().count()?, "recovery complete");
        Ok(())
    }

    /// Recomputes the entry count by walking every reachable node.
    pub fn recount(&self) -> MbResult<u64> {
        let root = self.header().root_offset()?;
        if root == 0 {
            return Ok(0);
        }
        // More records than could ever fit in the arena means a cycle.
        let record_limit = self.header().hwm(ArenaKind::Index)? / 16 + 2;
        let mut stack = vec![root];
        let mut visited = 0u64;
        let mut count = 0u64;
        while let Some(off) = stack.pop() {
            visited += 1;
            if visited > record_limit {
                return Err(MbError::NoDb("trie walk exceeded arena bounds".into()));
            }
            let node = self
                .mem()
                .read_node(off)
                .map_err(|e| MbError::NoDb(format!("unreadable node at {off}: {e}")))?;
            if node.terminal {
                count += 1;
            }
            for &(_, eoff) in &node.edges {
                let edge = self
                    .mem()
                    .read_edge(eoff)
                    .map_err(|e| MbError::NoDb(format!("unreadable edge at {eoff}: {e}")))?;
                stack.push(edge.child);
            }
        }
        Ok(count)
    }

    /// Finishes or aborts an arena swap that was interrupted mid-flight.
    ///
    /// The swap renames `_ibfl.rc` over `_ibfl` first, then `_dbfl.rc`
    /// over `_dbfl`, so the surviving scratch files tell us how far it got:
    ///
    /// - both scratch files present: neither rename happened - abort by
    ///   deleting them; the old arenas are untouched.
    /// - only the data scratch present: the index rename happened - finish
    ///   the data rename and install the saved target state.
    /// - neither present: both renames happened - install the saved state.
    fn complete_rc_swap(&mut self) -> MbResult<()> {
        let (root, index_hwm, data_hwm) = self.header().rc_saved()?;
        let (index_rc, data_rc) = self.rc_paths();
        let (_, data_path) = self.arena_paths();

        if index_rc.exists() && data_rc.exists() {
            fs::remove_file(&index_rc)?;
            fs::remove_file(&data_rc)?;
            warn!("aborted resource collection that never swapped");
            return Ok(());
        }
        if data_rc.exists() {
            fs::rename(&data_rc, &data_path)?;
            warn!("completed interrupted arena swap");
        }
        self.install_rc_result(root, index_hwm, data_hwm)
    }

    /// Points the header at freshly swapped arenas and reopens them.
    pub(crate) fn install_rc_result(
        &mut self,
        root: u64,
        index_hwm: u64,
        data_hwm: u64,
    ) -> MbResult<()> {
        self.reopen_arenas()?;
        let (index_path, data_path) = self.arena_paths();
        let header = self.header();
        header.set_file_size(ArenaKind::Index, fs::metadata(&index_path)?.len())?;
        header.set_file_size(ArenaKind::Data, fs::metadata(&data_path)?.len())?;
        header.set_hwm(ArenaKind::Index, index_hwm)?;
        header.set_hwm(ArenaKind::Data, data_hwm)?;
        header.clear_free_lists()?;
        header.lf_publish(ROOT_PARENT)?;
        header.set_root_offset(root)?;
        header.lf_done()?;
        header.bump_rc_generation()?;
        header.flush()?;
        Ok(())
    }

    /// Deletes scratch files from a collection that died before journaling.
    fn cleanup_rc_scratch(&self) -> MbResult<()> {
        let (index_rc, data_rc) = self.rc_paths();
        for path in [index_rc, data_rc] {
            if path.exists() {
                warn!(path = %path.display(), "removing stale collection scratch");
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::dir::DbDir;
    use tempfile::tempdir;

    fn writer_dict(tmp: &tempfile::TempDir, init: bool) -> Dict {
        let dir = DbDir::open_writer(tmp.path()).unwrap();
        Dict::open(&dir, &Options::writer(), init).unwrap()
    }

    fn populate(dict: &mut Dict, n: u32) {
        for i in 0..n {
            let key = format!("{i:08}");
            dict.add(key.as_bytes(), key.as_bytes(), false).unwrap();
        }
    }

    #[test]
    fn recount_matches_live_count() {
        let tmp = tempdir().unwrap();
        let mut dict = writer_dict(&tmp, true);
        populate(&mut dict, 500);
        dict.remove(b"00000007").unwrap();
        dict.remove(b"00000499").unwrap();

        assert_eq!(dict.recount().unwrap(), 498);
        assert_eq!(dict.count().unwrap(), 498);
    }

    #[test]
    fn recovery_with_no_exception_repairs_invariants() {
        let tmp = tempdir().unwrap();
        let mut dict = writer_dict(&tmp, true);
        populate(&mut dict, 100);
        dict.header().set_count(9999).unwrap();

        dict.exception_recovery().unwrap();
        assert_eq!(dict.count().unwrap(), 100);
    }

    #[test]
    fn undo_of_interrupted_add_edge() {
        let tmp = tempdir().unwrap();
        let mut dict = writer_dict(&tmp, true);
        populate(&mut dict, 50);

        // Complete an add, then pretend the pointer swing was torn:
        // re-arm the journal (the descriptor survives the clear) and
        // scribble over the target slot.
        dict.add(b"zz-target", b"payload", false).unwrap();
        let target = dict.header().excep_offset().unwrap();
        assert_eq!(dict.header().excep_status().unwrap(), ExceptionClass::None);
        dict.header()
            .set_excep_status(ExceptionClass::AddEdge)
            .unwrap();
        if target != ROOT_PARENT {
            dict.mem().write_raw(target, &[0xAB; 13]).unwrap();
        }

        dict.exception_recovery().unwrap();

        // The interrupted add is gone; everything else survives.
        assert!(matches!(dict.find(b"zz-target"), Err(MbError::NotExist)));
        for i in 0..50u32 {
            let key = format!("{i:08}");
            assert_eq!(dict.find(key.as_bytes()).unwrap(), key.as_bytes());
        }
    }

    #[test]
    fn orphaned_writer_triggers_startup_recovery() {
        let tmp = tempdir().unwrap();
        {
            let mut dict = writer_dict(&tmp, true);
            populate(&mut dict, 20);
            // Simulate a crash: the writer count is never reset.
            assert_eq!(dict.header().num_writer().unwrap(), 1);
            dict.header().set_count(1234).unwrap();
        }
        let dict = writer_dict(&tmp, false);
        assert_eq!(dict.count().unwrap(), 20);
    }
}
