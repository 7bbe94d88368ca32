//! Resource collection: compaction of the two arenas.
//!
//! Updates and removals free slots onto per-class lists, but fragmentation
//! and recovery leaks accumulate. Collection rebuilds both arenas from the
//! live trie: a depth-first copy into fresh backing files at compact
//! offsets, then an atomic swap-by-rename, a header rewrite (new root,
//! cleared free lists, bumped generation), and a backend reopen. Readers
//! notice the generation change and remap; until then their mappings pin
//! the old inodes, which stay fully intact - the copy never touches the
//! live arenas.
//!
//! The swap itself is the only dangerous window and is journaled as
//! `RC_SWAP`; see `recovery.rs` for the completion state machine.

use crate::config::CHUNK_SIZE;
use crate::dict::Dict;
use crate::error::{MbError, MbResult};
use crate::header::{ArenaKind, ExceptionClass};
use crate::trie::{EdgeRec, NodeRec, EDGE_RECORD_SIZE, INLINE_LABEL_MAX, OFFSET_SIZE};
use crate::arena::Arena;
use mabain_storage::{MmapBackend, StorageBackend};
use std::fs;
use tracing::info;

/// A bump-only output arena for the copy pass. No free lists: everything
/// written is live by construction.
struct Bump {
    backend: MmapBackend,
    hwm: u64,
    kind: ArenaKind,
    memcap: u64,
}

impl Bump {
    fn new(backend: MmapBackend, kind: ArenaKind, memcap: u64) -> Self {
        Self {
            backend,
            hwm: crate::header::ARENA_START,
            kind,
            memcap,
        }
    }

    fn append(&mut self, bytes: &[u8]) -> MbResult<u64> {
        let rounded = Arena::slot_size(self.kind, bytes.len()) as u64;
        let offset = self.hwm;
        let end = offset + rounded;
        if end > self.backend.size()? {
            let grown = end.div_ceil(CHUNK_SIZE) * CHUNK_SIZE;
            if grown > self.memcap {
                return Err(MbError::NoMemory);
            }
            self.backend.grow_to(grown)?;
        }
        self.backend.write_at(offset, bytes)?;
        self.hwm = end;
        Ok(offset)
    }
}

/// One collection pass over a writer's dictionary.
pub struct ResourceCollection<'a> {
    dict: &'a mut Dict,
}

impl<'a> ResourceCollection<'a> {
    /// Prepares a collection over the given (writer) dictionary.
    pub fn new(dict: &'a mut Dict) -> Self {
        Self { dict }
    }

    /// Runs the collection.
    ///
    /// # Errors
    ///
    /// Returns `RcSkipped` when neither arena's freed total reaches its
    /// threshold; the store is untouched.
    pub fn reclaim(&mut self, min_index: u64, min_data: u64) -> MbResult<()> {
        let (index_pending, data_pending) = {
            let header = self.dict.header();
            (
                header.pending_free(ArenaKind::Index)?,
                header.pending_free(ArenaKind::Data)?,
            )
        };
        if index_pending < min_index && data_pending < min_data {
            return Err(MbError::RcSkipped);
        }
        info!(
            index_pending,
            data_pending, "starting resource collection"
        );

        let (index_rc, data_rc) = self.dict.rc_paths();
        let mut index_out = Bump::new(
            MmapBackend::create(&index_rc)?,
            ArenaKind::Index,
            u64::MAX,
        );
        let mut data_out = Bump::new(MmapBackend::create(&data_rc)?, ArenaKind::Data, u64::MAX);

        let root = self.dict.header().root_offset()?;
        let new_root = self.copy_node(root, &mut index_out, &mut data_out)?;

        index_out.backend.sync()?;
        data_out.backend.sync()?;

        // Journal the swap, then rename index first, data second; the
        // recovery state machine relies on this order.
        {
            let header = self.dict.header();
            header.set_rc_saved(new_root, index_out.hwm, data_out.hwm)?;
            header.set_excep_status(ExceptionClass::RcSwap)?;
            header.flush()?;
        }
        let (index_path, data_path) = self.dict.arena_paths();
        fs::rename(&index_rc, &index_path)?;
        fs::rename(&data_rc, &data_path)?;

        self.dict
            .install_rc_result(new_root, index_out.hwm, data_out.hwm)?;
        self.dict.header().journal_clear()?;
        self.dict.header().flush()?;

        info!(
            index_size = index_out.hwm,
            data_size = data_out.hwm,
            "resource collection complete"
        );
        Ok(())
    }

    /// Depth-first copy of the subtree rooted at `node_off`; returns the
    /// node's offset in the output arena.
    fn copy_node(
        &self,
        node_off: u64,
        index_out: &mut Bump,
        data_out: &mut Bump,
    ) -> MbResult<u64> {
        let node = self.dict.mem().read_node(node_off)?;

        let data_off = if node.terminal {
            let mut len_bytes = [0u8; 2];
            self.dict
                .data_arena()
                .read_into(node.data_off, &mut len_bytes)?;
            let len = u16::from_le_bytes(len_bytes) as usize;
            let slot = self.dict.data_arena().read(node.data_off, 2 + len)?;
            data_out.append(&slot)?
        } else {
            0
        };

        let mut edges = Vec::with_capacity(node.edges.len());
        for &(first, eoff) in &node.edges {
            let edge = self.dict.mem().read_edge(eoff)?;
            let label = self.dict.mem().read_label(&edge)?;
            let child = self.copy_node(edge.child, index_out, data_out)?;

            let mut tail = [0u8; OFFSET_SIZE];
            if label.len() <= INLINE_LABEL_MAX {
                tail[..label.len() - 1].copy_from_slice(&label[1..]);
            } else {
                let spill = index_out.append(&label[1..])?;
                tail[..].copy_from_slice(&encode_off5(spill));
            }
            let copied = EdgeRec {
                first: label[0],
                label_len: label.len() as u8,
                tail,
                child,
                flags: 0,
            };
            let mut record = [0u8; EDGE_RECORD_SIZE];
            record.copy_from_slice(&copied.encode());
            edges.push((first, index_out.append(&record)?));
        }

        let copied = NodeRec {
            terminal: node.terminal,
            data_off,
            edges,
        };
        index_out.append(&copied.encode())
    }
}

fn encode_off5(v: u64) -> [u8; OFFSET_SIZE] {
    let mut out = [0u8; OFFSET_SIZE];
    for (i, b) in out.iter_mut().enumerate() {
        *b = (v >> (8 * i)) as u8;
    }
    out
}
