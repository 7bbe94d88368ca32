//! Lock-free readers racing a mutating writer.
//!
//! Readers run on their own handles (as a separate process would) while
//! the writer churns keys. At every instant the set a reader observes must
//! be a subset of the keys ever added and never contain a torn value:
//! every key maps to itself, so any successful lookup must return exactly
//! the key bytes.

use mabain_core::{Db, MbError, Options};
use mabain_testkit::TestDb;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

#[test]
fn readers_never_see_torn_values() {
    let fixture = TestDb::writer();
    let path = fixture.path().to_path_buf();
    let stop = Arc::new(AtomicBool::new(false));

    // Seed half the key space so readers have hits from the start.
    for i in (0..500u32).step_by(2) {
        let key = format!("rw-{i:04}");
        fixture.add(key.as_bytes(), key.as_bytes()).unwrap();
    }

    let mut readers = Vec::new();
    for _ in 0..3 {
        let path = path.clone();
        let stop = Arc::clone(&stop);
        readers.push(thread::spawn(move || {
            let reader = Db::open(&path, Options::reader()).unwrap();
            let mut hits = 0u64;
            while !stop.load(Ordering::Acquire) {
                for i in 0..500u32 {
                    let key = format!("rw-{i:04}");
                    match reader.find(key.as_bytes()) {
                        Ok(value) => {
                            assert_eq!(
                                value,
                                key.as_bytes(),
                                "torn or misdirected value for {key}"
                            );
                            hits += 1;
                        }
                        Err(MbError::NotExist) | Err(MbError::TryAgain) => {}
                        Err(other) => panic!("unexpected reader error: {other}"),
                    }
                }
            }
            hits
        }));
    }

    // Writer churn: flip every key between present and absent.
    for round in 0..20 {
        for i in 0..500u32 {
            let key = format!("rw-{i:04}");
            if (i + round) % 2 == 0 {
                let _ = fixture.add_with(key.as_bytes(), key.as_bytes(), true);
            } else {
                let _ = fixture.remove(key.as_bytes());
            }
        }
    }
    stop.store(true, Ordering::Release);

    let mut total_hits = 0;
    for reader in readers {
        total_hits += reader.join().unwrap();
    }
    assert!(total_hits > 0, "readers never observed a key");
}

#[test]
fn reader_count_is_a_subset_of_added_keys() {
    let fixture = TestDb::writer();
    let path = fixture.path().to_path_buf();
    let stop = Arc::new(AtomicBool::new(false));

    let reader_handle = {
        let path = path.clone();
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let reader = Db::open(&path, Options::reader()).unwrap();
            while !stop.load(Ordering::Acquire) {
                // Keys outside the writer's namespace must never appear.
                for key in [b"alien-1".as_slice(), b"alien-2", b"zzz"] {
                    assert!(matches!(
                        reader.find(key),
                        Err(MbError::NotExist) | Err(MbError::TryAgain)
                    ));
                }
            }
        })
    };

    for i in 0..2000u32 {
        let key = format!("subset-{i:05}");
        fixture.add(key.as_bytes(), key.as_bytes()).unwrap();
        if i % 3 == 0 {
            fixture.remove(key.as_bytes()).unwrap();
        }
    }
    stop.store(true, Ordering::Release);
    reader_handle.join().unwrap();

    let expected = (0..2000u32).filter(|i| i % 3 != 0).count() as u64;
    assert_eq!(fixture.count().unwrap(), expected);
}
