//! Abnormal-exit simulation for crash-recovery testing.
//!
//! A real crash tears the store between a journal capture and the journal
//! clear. The harness reproduces that window on a live store:
//!
//! 1. Run an operation of the class under test to completion. The journal
//!    descriptor (image, target, class) survives the clear; only the
//!    status byte was reset.
//! 2. Re-arm the status and scribble random bytes over the descriptor's
//!    target slot, exactly the state a mid-write crash leaves behind.
//! 3. Run `exception_recovery` and sweep the whole store for mismatches.
//!
//! Recovery must restore every untouched key, and leave the interrupted
//! operation either fully absent (`ADD_*` classes) or fully applied
//! (`REMOVE_EDGE` / `CLEAR_EDGE`).

use crate::keys::{KeyKind, TestKey};
use mabain_core::{Db, ExceptionClass, MbError, Options, ROOT_PARENT};
use rand::RngCore;
use std::cell::Cell;
use tempfile::TempDir;

/// A writer store plus the machinery to tear and recover it.
pub struct CrashHarness {
    temp_dir: TempDir,
    db: Db,
    keys: TestKey,
    /// Makes each simulation's probe keys unique.
    probe_nonce: Cell<u64>,
    /// Key index targeted by removal-crash simulation.
    pub remove_index: Option<u64>,
}

impl CrashHarness {
    /// A fresh store populated by keys of the given kind.
    pub fn new(kind: KeyKind) -> Self {
        let temp_dir = TempDir::new().expect("create temp directory");
        let db = Db::open(
            temp_dir.path(),
            Options::writer()
                .memcap_index(512 << 20)
                .memcap_data(512 << 20),
        )
        .expect("open writer");
        Self {
            temp_dir,
            db,
            keys: TestKey::new(kind),
            probe_nonce: Cell::new(0),
            remove_index: None,
        }
    }

    /// The writer handle.
    #[must_use]
    pub fn db(&self) -> &Db {
        &self.db
    }

    /// The key for `index`.
    #[must_use]
    pub fn key(&self, index: u64) -> String {
        self.keys.key(index)
    }

    /// Clears the store and inserts keys `1..=count`, each mapped to
    /// itself.
    pub fn populate(&self, count: u64) {
        self.db.remove_all().expect("remove all");
        for i in 1..=count {
            let key = self.keys.key(i);
            self.db.add(key.as_bytes(), key.as_bytes()).expect("add");
        }
    }

    /// Performs an operation of the requested class, then tears its
    /// journaled target as an interrupted writer would have left it.
    pub fn simulate_crash(&self, class: ExceptionClass) {
        let nonce = self.probe_nonce.get();
        self.probe_nonce.set(nonce + 1);
        match class {
            ExceptionClass::AddDataOff => {
                let key = self.keys.key(1278);
                let updated = format!("{key}_UPDATED");
                self.db
                    .add_with(key.as_bytes(), updated.as_bytes(), true)
                    .expect("overwrite");
            }
            ExceptionClass::AddNode => {
                // The second key ends inside the first one's edge label,
                // forcing a split.
                let long = format!("##{nonce}abcdef");
                let short = format!("##{nonce}abcd");
                self.db.add(long.as_bytes(), long.as_bytes()).expect("add");
                self.db
                    .add(short.as_bytes(), short.as_bytes())
                    .expect("add");
            }
            ExceptionClass::AddEdge => {
                // Split first, then install a third sibling so the final
                // operation is an edge insertion.
                for suffix in ["a", "b", "c"] {
                    let key = format!("!!{nonce}{suffix}");
                    self.db.add(key.as_bytes(), key.as_bytes()).expect("add");
                }
            }
            ExceptionClass::ClearEdge => {
                let index = self.remove_index.expect("remove_index set");
                let key = self.keys.key(index);
                self.db.remove(key.as_bytes()).expect("remove");
            }
            other => panic!("no crash simulation for {other:?}"),
        }

        let dict = self.db.dict().expect("writer dict");
        let dict = dict.read();
        let header = dict.header();

        // Re-arm the completed operation's descriptor. A removal's final
        // journal record may be a REMOVE_EDGE pointer swing or merge
        // instead of CLEAR_EDGE; both replay to completion.
        let armed = header.excep_last_class().expect("journal class");
        match class {
            ExceptionClass::ClearEdge => assert!(matches!(
                armed,
                ExceptionClass::ClearEdge | ExceptionClass::RemoveEdge
            )),
            expected => assert_eq!(armed, expected),
        }
        header.set_excep_status(armed).expect("arm status");

        // Scribble over the target, simulating the torn in-place write.
        let target = header.excep_offset().expect("journal target");
        let image_len = header.excep_image().expect("journal image").len();
        if target == ROOT_PARENT {
            header.set_root_offset(0xDEAD_BEEF).expect("smash root");
        } else {
            let mut junk = vec![0u8; image_len];
            rand::thread_rng().fill_bytes(&mut junk);
            dict.mem().write_raw(target, &junk).expect("smash slot");
        }
    }

    /// Runs exception recovery on the writer's dictionary.
    pub fn recover(&self) {
        let dict = self.db.dict().expect("writer dict");
        dict.write().exception_recovery().expect("recovery");
    }

    /// Sweeps keys `1..=count` through a fresh reader handle, returning
    /// the number of mismatches. The key at `remove_index` is skipped;
    /// values may carry the `_UPDATED` suffix from overwrite simulation.
    pub fn check_consistency(&self, count: u64) -> u64 {
        self.check(count, |_| true)
    }

    /// Like [`Self::check_consistency`] but only checks even (or odd)
    /// indices; the complement is expected to be absent.
    pub fn check_half_consistency(&self, count: u64, check_even: bool) -> u64 {
        let mut failed = self.check(count, |i| (i % 2 == 0) == check_even);
        // The skipped half must be gone.
        let reader = Db::open(self.temp_dir.path(), Options::reader()).expect("open reader");
        for i in 1..=count {
            if (i % 2 == 0) == check_even {
                continue;
            }
            let key = self.keys.key(i);
            if !matches!(reader.find(key.as_bytes()), Err(MbError::NotExist)) {
                failed += 1;
            }
        }
        failed
    }

    fn check(&self, count: u64, include: impl Fn(u64) -> bool) -> u64 {
        let reader = Db::open(self.temp_dir.path(), Options::reader()).expect("open reader");
        let mut failed = 0u64;
        for i in 1..=count {
            if Some(i) == self.remove_index || !include(i) {
                continue;
            }
            let key = self.keys.key(i);
            match reader.find(key.as_bytes()) {
                Ok(value) => {
                    let updated = format!("{key}_UPDATED");
                    if value != key.as_bytes() && value != updated.as_bytes() {
                        failed += 1;
                    }
                }
                Err(_) => failed += 1,
            }
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consistency_check_counts_mismatches() {
        let harness = CrashHarness::new(KeyKind::Int);
        harness.populate(50);
        assert_eq!(harness.check_consistency(50), 0);

        harness.db().remove(harness.key(17).as_bytes()).unwrap();
        assert_eq!(harness.check_consistency(50), 1);
    }

    #[test]
    fn simulated_add_edge_crash_recovers() {
        let harness = CrashHarness::new(KeyKind::Int);
        harness.populate(200);
        harness.simulate_crash(ExceptionClass::AddEdge);
        harness.recover();
        assert_eq!(harness.check_consistency(200), 0);
    }
}
