//! The asynchronous writer: a bounded ring of request slots drained by a
//! dedicated mutator thread.
//!
//! Producers on any thread claim a slot by atomically fetching the next
//! ticket, then block on that slot's condition variable while it is still
//! occupied by an older request (natural backpressure when the ring laps).
//! The consumer advances its own cursor through the ring in ticket order,
//! so effects apply in exactly the order producers acquired slots, and it
//! is the sole caller of `Dict` mutators.
//!
//! Requests are fire-and-forget: the producer's return value reports
//! enqueueing, not the eventual mutation outcome, which is logged instead.
//! The ring lives only in the writer process; queued requests are lost if
//! the writer dies.

use crate::config::ASYNC_QUEUE_SIZE;
use crate::dict::Dict;
use crate::error::{MbError, MbResult};
use crate::rc::ResourceCollection;
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A queued mutation request.
#[derive(Debug)]
pub(crate) enum Request {
    /// Insert or overwrite a key.
    Add {
        /// The key bytes.
        key: Vec<u8>,
        /// The value bytes.
        value: Vec<u8>,
        /// Overwrite an existing entry.
        overwrite: bool,
    },
    /// Remove a key.
    Remove {
        /// The key bytes.
        key: Vec<u8>,
    },
    /// Reinitialize the store.
    RemoveAll,
    /// Run resource collection with the given thresholds.
    Collect {
        /// Minimum freed index bytes to proceed.
        min_index: u64,
        /// Minimum freed data bytes to proceed.
        min_data: u64,
    },
}

#[derive(Default)]
struct SlotState {
    in_use: bool,
    req: Option<Request>,
}

struct Slot {
    state: Mutex<SlotState>,
    cond: Condvar,
}

struct Shared {
    slots: Vec<Slot>,
    ticket: AtomicU64,
    stop: AtomicBool,
    users: AtomicU32,
}

/// Handle to the writer's request ring and background mutator thread.
pub struct AsyncWriter {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncWriter {
    /// Spawns the mutator thread over the shared dictionary.
    pub(crate) fn start(dict: Arc<RwLock<Dict>>) -> MbResult<Arc<Self>> {
        let shared = Arc::new(Shared {
            slots: (0..ASYNC_QUEUE_SIZE)
                .map(|_| Slot {
                    state: Mutex::new(SlotState::default()),
                    cond: Condvar::new(),
                })
                .collect(),
            ticket: AtomicU64::new(0),
            stop: AtomicBool::new(false),
            users: AtomicU32::new(0),
        });
        let consumer = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("mabain-async-writer".into())
            .spawn(move || consumer_loop(&consumer, &dict))?;
        Ok(Arc::new(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        }))
    }

    /// Enqueues a request, blocking while the claimed slot is occupied.
    pub(crate) fn submit(&self, req: Request) -> MbResult<()> {
        if self.shared.stop.load(Ordering::Acquire) {
            return Err(MbError::DbClosed);
        }
        let ticket = self.shared.ticket.fetch_add(1, Ordering::AcqRel);
        let slot = &self.shared.slots[ticket as usize % ASYNC_QUEUE_SIZE];
        let mut state = slot.state.lock();
        while state.in_use {
            slot.cond.wait(&mut state);
        }
        state.req = Some(req);
        state.in_use = true;
        slot.cond.notify_all();
        Ok(())
    }

    /// Registers or releases an attached user handle.
    pub(crate) fn update_num_users(&self, delta: i32) {
        if delta >= 0 {
            self.shared.users.fetch_add(delta as u32, Ordering::AcqRel);
        } else {
            self.shared.users.fetch_sub((-delta) as u32, Ordering::AcqRel);
        }
    }

    /// Number of attached user handles.
    #[must_use]
    pub fn num_users(&self) -> u32 {
        self.shared.users.load(Ordering::Acquire)
    }

    /// Waits for attached users to detach and the ring to drain, then
    /// stops and joins the mutator thread.
    pub(crate) fn stop(&self) -> MbResult<()> {
        let deadline = Instant::now() + Duration::from_secs(10);
        while self.num_users() > 0 {
            if Instant::now() > deadline {
                warn!(
                    users = self.num_users(),
                    "closing async writer with attached users"
                );
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        self.shared.stop.store(true, Ordering::Release);
        for slot in &self.shared.slots {
            slot.cond.notify_all();
        }
        if let Some(handle) = self.handle.lock().take() {
            handle
                .join()
                .map_err(|_| MbError::Unknown("async writer thread panicked".into()))?;
        }
        info!("async writer stopped");
        Ok(())
    }
}

fn consumer_loop(shared: &Shared, dict: &RwLock<Dict>) {
    let mut cursor = 0u64;
    loop {
        let slot = &shared.slots[cursor as usize % ASYNC_QUEUE_SIZE];
        let req = {
            let mut state = slot.state.lock();
            loop {
                if state.in_use {
                    break state.req.take();
                }
                // Drained: every issued ticket has been consumed.
                if shared.stop.load(Ordering::Acquire)
                    && cursor == shared.ticket.load(Ordering::Acquire)
                {
                    return;
                }
                slot.cond
                    .wait_for(&mut state, Duration::from_millis(20));
            }
        };

        if let Some(req) = req {
            let result = execute(dict, req);
            if let Err(err) = result {
                match err {
                    MbError::InDict | MbError::NotExist | MbError::RcSkipped => {
                        debug!(%err, "async request was a no-op");
                    }
                    other => warn!(%other, "async request failed"),
                }
            }
            // The slot frees only after the mutation applied, so a lapped
            // producer cannot reorder ahead of it.
            let mut state = slot.state.lock();
            state.in_use = false;
            slot.cond.notify_all();
            cursor += 1;
        }
    }
}

fn execute(dict: &RwLock<Dict>, req: Request) -> MbResult<()> {
    let mut dict = dict.write();
    match req {
        Request::Add {
            key,
            value,
            overwrite,
        } => dict.add(&key, &value, overwrite),
        Request::Remove { key } => dict.remove(&key),
        Request::RemoveAll => dict.remove_all(),
        Request::Collect {
            min_index,
            min_data,
        } => ResourceCollection::new(&mut dict).reclaim(min_index, min_data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::dir::DbDir;
    use tempfile::tempdir;

    fn shared_dict(tmp: &tempfile::TempDir) -> Arc<RwLock<Dict>> {
        let dir = DbDir::open_writer(tmp.path()).unwrap();
        Arc::new(RwLock::new(
            Dict::open(&dir, &Options::writer(), true).unwrap(),
        ))
    }

    #[test]
    fn requests_apply_in_order() {
        let tmp = tempdir().unwrap();
        let dict = shared_dict(&tmp);
        let writer = AsyncWriter::start(Arc::clone(&dict)).unwrap();

        writer
            .submit(Request::Add {
                key: b"k".to_vec(),
                value: b"first".to_vec(),
                overwrite: false,
            })
            .unwrap();
        writer
            .submit(Request::Add {
                key: b"k".to_vec(),
                value: b"second".to_vec(),
                overwrite: true,
            })
            .unwrap();
        writer
            .submit(Request::Remove {
                key: b"gone".to_vec(),
            })
            .unwrap();
        writer.stop().unwrap();

        assert_eq!(dict.read().find(b"k").unwrap(), b"second");
    }

    #[test]
    fn stop_drains_the_ring() {
        let tmp = tempdir().unwrap();
        let dict = shared_dict(&tmp);
        let writer = AsyncWriter::start(Arc::clone(&dict)).unwrap();

        for i in 0..(ASYNC_QUEUE_SIZE * 3) {
            let key = format!("key{i:05}");
            writer
                .submit(Request::Add {
                    key: key.into_bytes(),
                    value: b"v".to_vec(),
                    overwrite: false,
                })
                .unwrap();
        }
        writer.stop().unwrap();
        assert_eq!(
            dict.read().count().unwrap(),
            (ASYNC_QUEUE_SIZE * 3) as u64
        );
    }

    #[test]
    fn submit_after_stop_is_rejected() {
        let tmp = tempdir().unwrap();
        let dict = shared_dict(&tmp);
        let writer = AsyncWriter::start(dict).unwrap();
        writer.stop().unwrap();
        assert!(matches!(
            writer.submit(Request::RemoveAll),
            Err(MbError::DbClosed)
        ));
    }

    #[test]
    fn concurrent_producers_all_land() {
        let tmp = tempdir().unwrap();
        let dict = shared_dict(&tmp);
        let writer = AsyncWriter::start(Arc::clone(&dict)).unwrap();

        let counter = Arc::new(AtomicU64::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let writer = Arc::clone(&writer);
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || loop {
                let i = counter.fetch_add(1, Ordering::AcqRel);
                if i >= 1000 {
                    break;
                }
                let key = format!("{i:06}");
                writer
                    .submit(Request::Add {
                        key: key.clone().into_bytes(),
                        value: key.into_bytes(),
                        overwrite: false,
                    })
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        writer.stop().unwrap();

        let dict = dict.read();
        assert_eq!(dict.count().unwrap(), 1000);
        for i in 0..1000u64 {
            let key = format!("{i:06}");
            assert_eq!(dict.find(key.as_bytes()).unwrap(), key.as_bytes());
        }
    }
}
