//! Multiple threads inserting through one async writer queue.
//!
//! Each worker opens its own reader handle, attaches it to the writer's
//! queue, and claims key indices from a shared atomic counter. After the
//! workers join, the writer drains and the contents are verified.
//!
//! ```text
//! cargo run --example multi_thread_insert -- /tmp/mabain_demo
//! ```

use mabain_core::{Db, MbResult, Options};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

const MAX_KEY: u64 = 1000;
const NUM_THREADS: usize = 4;

fn main() -> MbResult<()> {
    let dir = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/tmp/mabain_demo".to_string());
    std::fs::create_dir_all(&dir)?;

    // Log to <dir>/mabain.log, the conventional writer log sink.
    let log_file = std::fs::File::create(std::path::Path::new(&dir).join("mabain.log"))?;
    tracing_subscriber::fmt()
        .with_writer(Arc::new(log_file))
        .with_ansi(false)
        .init();

    // The writer enables async mode; readers funnel updates through it.
    let writer = Arc::new(Db::open(
        &dir,
        Options::writer()
            .async_writer(true)
            .memcap_index(128 << 20)
            .memcap_data(128 << 20),
    )?);
    writer.remove_all()?;

    let next_key = Arc::new(AtomicU64::new(0));
    let mut handles = Vec::new();
    for _ in 0..NUM_THREADS {
        let writer = Arc::clone(&writer);
        let next_key = Arc::clone(&next_key);
        let dir = dir.clone();
        handles.push(thread::spawn(move || -> MbResult<()> {
            let mut reader = Db::open(&dir, Options::reader())?;
            reader.set_async_writer_ptr(&writer)?;
            loop {
                let i = next_key.fetch_add(1, Ordering::AcqRel);
                if i >= MAX_KEY {
                    break;
                }
                let key = format!("{i:08}");
                reader.add(key.as_bytes(), key.as_bytes())?;
            }
            reader.unset_async_writer_ptr(&writer)?;
            reader.close()
        }));
    }
    for handle in handles {
        handle.join().expect("insert thread panicked")?;
    }

    // The writer handle closes last: it waits for the queue to drain.
    let mut writer = Arc::into_inner(writer).expect("all clones joined");
    writer.close()?;

    let verify = Db::open(&dir, Options::reader())?;
    assert_eq!(verify.count()?, MAX_KEY);
    for i in 0..MAX_KEY {
        let key = format!("{i:08}");
        assert_eq!(verify.find(key.as_bytes())?, key.as_bytes());
    }
    println!("inserted and verified {MAX_KEY} keys");
    Ok(())
}
