//! Resource collection end to end: thresholds, compaction, reader remap.

use mabain_core::MbError;
use mabain_testkit::TestDb;

#[test]
fn skipped_below_thresholds() {
    let db = TestDb::writer();
    db.add(b"a", b"1").unwrap();
    assert!(matches!(
        db.collect_resource(u64::MAX, u64::MAX),
        Err(MbError::RcSkipped)
    ));
}

#[test]
fn arena_usage_returns_to_pre_add_levels() {
    let db = TestDb::writer();

    let dict = db.dict().unwrap();
    let baseline = {
        let d = dict.read();
        d.header().hwm(mabain_core::ArenaKind::Data).unwrap()
    };

    for i in 0..500u32 {
        let key = format!("bulk-{i:05}");
        db.add(key.as_bytes(), &[0x55; 200]).unwrap();
    }
    for i in 0..500u32 {
        let key = format!("bulk-{i:05}");
        db.remove(key.as_bytes()).unwrap();
    }
    db.collect_resource(1, 1).unwrap();

    let after = {
        let d = dict.read();
        d.header().hwm(mabain_core::ArenaKind::Data).unwrap()
    };
    assert_eq!(after, baseline);
    assert_eq!(db.count().unwrap(), 0);
}

#[test]
fn live_keys_survive_compaction() {
    let db = TestDb::writer();
    for i in 0..1000u32 {
        let key = format!("live-{i:05}");
        db.add(key.as_bytes(), key.as_bytes()).unwrap();
    }
    for i in (0..1000u32).step_by(3) {
        let key = format!("live-{i:05}");
        db.remove(key.as_bytes()).unwrap();
    }
    db.collect_resource(1, 1).unwrap();

    for i in 0..1000u32 {
        let key = format!("live-{i:05}");
        match db.find(key.as_bytes()) {
            Ok(value) => {
                assert_ne!(i % 3, 0);
                assert_eq!(value, key.as_bytes());
            }
            Err(MbError::NotExist) => assert_eq!(i % 3, 0),
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
}

#[test]
fn reader_remaps_after_collection() {
    let fixture = TestDb::writer();
    for i in 0..300u32 {
        let key = format!("remap-{i:04}");
        fixture.add(key.as_bytes(), key.as_bytes()).unwrap();
    }

    // Open the reader before the swap so it maps the old arena files.
    let reader = fixture.reader().unwrap();
    assert_eq!(reader.find(b"remap-0000").unwrap(), b"remap-0000");

    for i in 100..300u32 {
        let key = format!("remap-{i:04}");
        fixture.remove(key.as_bytes()).unwrap();
    }
    fixture.collect_resource(1, 1).unwrap();

    // The reader detects the new generation and reopens the arenas.
    for i in 0..100u32 {
        let key = format!("remap-{i:04}");
        assert_eq!(reader.find(key.as_bytes()).unwrap(), key.as_bytes());
    }
    assert!(matches!(
        reader.find(b"remap-0250"),
        Err(MbError::NotExist)
    ));
}

#[test]
fn store_remains_writable_after_collection() {
    let db = TestDb::writer();
    for i in 0..200u32 {
        let key = format!("w-{i:04}");
        db.add(key.as_bytes(), key.as_bytes()).unwrap();
    }
    for i in 0..100u32 {
        let key = format!("w-{i:04}");
        db.remove(key.as_bytes()).unwrap();
    }
    db.collect_resource(1, 1).unwrap();

    for i in 0..100u32 {
        let key = format!("w2-{i:04}");
        db.add(key.as_bytes(), key.as_bytes()).unwrap();
    }
    assert_eq!(db.count().unwrap(), 200);
    db.collect_resource(1, 1).unwrap();
    assert_eq!(db.count().unwrap(), 200);
}
