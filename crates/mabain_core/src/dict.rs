//! The dictionary: lookups and journaled mutations over the trie.
//!
//! All mutators follow one discipline:
//!
//! 1. Build every new record (subtrees, relocated nodes, payload slots) in
//!    freshly allocated slots. Fresh slots are unreachable, so a crash here
//!    only leaks space.
//! 2. Capture a journal record in the header: the exception class, the one
//!    slot about to be overwritten, and the image recovery should put
//!    there (the pre-image for Add classes, the post-image for Remove
//!    classes).
//! 3. Perform the single in-place write under the lock-free publication
//!    protocol.
//! 4. Clear the journal, then thread replaced slots onto the free lists.
//!
//! Because step 3 touches exactly one slot, recovery after a crash is one
//! write: put the journaled image back. See `recovery.rs`.

use crate::arena::Arena;
use crate::config::{Options, MAX_DATA_SIZE, MAX_KEY_LENGTH};
use crate::dir::DbDir;
use crate::error::{MbError, MbResult};
use crate::header::{ArenaKind, ExceptionClass, Header, ROOT_PARENT};
use crate::trie::{
    EdgeRec, NodeRec, TrieMem, EDGE_FLAG_IN_PROGRESS, INLINE_LABEL_MAX, MAX_LABEL_LEN,
    NODE_HEADER_SIZE,
};
use mabain_storage::MmapBackend;
use std::path::PathBuf;
use tracing::info;

/// Resumable state for all-prefix enumeration.
///
/// `match_len` is the length of the longest prefix already yielded; each
/// call resumes the traversal from the root and yields the next-longer
/// present prefix, so the sequence is strictly increasing in length and a
/// concurrent mutation costs at most a restart, never a duplicate.
#[derive(Debug, Clone, Default)]
pub struct PrefixCursor {
    /// Length of the last prefix match returned.
    pub match_len: usize,
    /// Set once the trie cannot extend the sequence further.
    pub done: bool,
}

impl PrefixCursor {
    /// A cursor positioned before the first match.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// The trie dictionary over one database directory.
///
/// A `Dict` is either the single mutating instance owned by the writer
/// handle, or one of any number of read-only instances. Mutators check at
/// runtime and fail with `NotAllowed` on a read-only instance.
pub struct Dict {
    header: Header,
    mem: TrieMem,
    data: Arena,
    read_only: bool,
    memcap_index: u64,
    memcap_data: u64,
    index_path: PathBuf,
    data_path: PathBuf,
    index_rc_path: PathBuf,
    data_rc_path: PathBuf,
}

impl Dict {
    /// Opens the dictionary. `init_header` is set on the first writer open
    /// of a fresh directory and reinitializes everything.
    pub fn open(dir: &DbDir, opts: &Options, init_header: bool) -> MbResult<Self> {
        let read_only = !dir.is_writer();
        if read_only && (!dir.index_path().exists() || !dir.data_path().exists()) {
            return Err(MbError::NoDb(format!(
                "arena files missing in {}",
                dir.path().display()
            )));
        }

        let header = Header::map(&dir.header_path())?;
        let (index_backend, data_backend) = if read_only {
            (
                MmapBackend::open_ro(&dir.index_path())?,
                MmapBackend::open_ro(&dir.data_path())?,
            )
        } else {
            (
                MmapBackend::open_rw(&dir.index_path())?,
                MmapBackend::open_rw(&dir.data_path())?,
            )
        };

        let mem = TrieMem::new(Arena::new(
            Box::new(index_backend),
            ArenaKind::Index,
            opts.memcap_index,
        ));
        let data = Arena::new(Box::new(data_backend), ArenaKind::Data, opts.memcap_data);

        let mut dict = Self {
            header,
            mem,
            data,
            read_only,
            memcap_index: opts.memcap_index,
            memcap_data: opts.memcap_data,
            index_path: dir.index_path(),
            data_path: dir.data_path(),
            index_rc_path: dir.index_rc_path(),
            data_rc_path: dir.data_rc_path(),
        };

        if init_header {
            dict.header.init(opts.data_size.unwrap_or(0))?;
            let root = dict.mem.write_new_node(&dict.header, &NodeRec::empty())?;
            dict.header.set_root_offset(root)?;
            dict.header.flush()?;
            info!(dir = %dir.path().display(), "initialized new db");
        } else {
            dict.header.validate()?;
            if !read_only {
                if let Some(fixed) = opts.data_size {
                    if fixed != dict.header.data_size()? {
                        return Err(MbError::InvalidArg(
                            "data size option does not match existing db".into(),
                        ));
                    }
                }
                dict.writer_startup_recovery()?;
            }
        }
        if !read_only {
            dict.header.set_num_writer(1)?;
        }
        Ok(dict)
    }

    /// The mapped header.
    #[must_use]
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// The trie memory. Exposed for diagnostics and the crash harness.
    #[must_use]
    pub fn mem(&self) -> &TrieMem {
        &self.mem
    }

    /// The data arena.
    #[must_use]
    pub fn data_arena(&self) -> &Arena {
        &self.data
    }

    /// Number of present keys.
    pub fn count(&self) -> MbResult<u64> {
        self.header.count()
    }

    /// Flushes both arenas and the header.
    pub fn flush(&self) -> MbResult<()> {
        self.mem.arena().flush()?;
        self.data.flush()?;
        self.header.flush()
    }

    /// Re-opens both arena backends from their paths. Called after a
    /// resource-collection swap replaced the backing files, and by readers
    /// that observe a new collection generation.
    pub fn reopen_arenas(&mut self) -> MbResult<()> {
        let (index_backend, data_backend) = if self.read_only {
            (
                MmapBackend::open_ro(&self.index_path)?,
                MmapBackend::open_ro(&self.data_path)?,
            )
        } else {
            (
                MmapBackend::open_rw(&self.index_path)?,
                MmapBackend::open_rw(&self.data_path)?,
            )
        };
        self.mem.set_arena(Arena::new(
            Box::new(index_backend),
            ArenaKind::Index,
            self.memcap_index,
        ));
        self.data = Arena::new(Box::new(data_backend), ArenaKind::Data, self.memcap_data);
        Ok(())
    }

    pub(crate) fn rc_paths(&self) -> (PathBuf, PathBuf) {
        (self.index_rc_path.clone(), self.data_rc_path.clone())
    }

    pub(crate) fn arena_paths(&self) -> (PathBuf, PathBuf) {
        (self.index_path.clone(), self.data_path.clone())
    }

    fn check_writable(&self) -> MbResult<()> {
        if self.read_only {
            return Err(MbError::NotAllowed);
        }
        Ok(())
    }

    fn check_key(key: &[u8]) -> MbResult<()> {
        if key.is_empty() {
            return Err(MbError::InvalidArg("empty key".into()));
        }
        if key.len() > MAX_KEY_LENGTH {
            return Err(MbError::OutOfBound);
        }
        Ok(())
    }

    fn check_value(&self, value: &[u8]) -> MbResult<()> {
        if value.len() > MAX_DATA_SIZE {
            return Err(MbError::OutOfBound);
        }
        let fixed = self.header.data_size()?;
        if fixed != 0 && value.len() != fixed as usize {
            return Err(MbError::InvalidArg(format!(
                "value length {} does not match fixed data size {fixed}",
                value.len()
            )));
        }
        Ok(())
    }

    // === lookups ===

    /// Exact-match lookup.
    pub fn find(&self, key: &[u8]) -> MbResult<Vec<u8>> {
        Self::check_key(key)?;
        let mut lf = self.header.lf_begin()?;
        let mut cur = self.header.root_offset()?;
        if cur == 0 {
            return Err(MbError::NotInitialized);
        }
        let mut consumed = 0usize;
        loop {
            let node = self.mem.read_node(cur)?;
            self.header.lf_validate(&mut lf, cur)?;
            if consumed == key.len() {
                if !node.terminal {
                    return Err(MbError::NotExist);
                }
                return self.read_terminal_value(cur);
            }
            let Ok(idx) = node.find_edge(key[consumed]) else {
                return Err(MbError::NotExist);
            };
            let eoff = node.edges[idx].1;
            let (edge, label) = self.read_edge_checked(&mut lf, eoff)?;
            let rem = &key[consumed..];
            let common = common_prefix(&label, rem);
            if common < label.len() {
                // Divergence inside the label, or key exhausted mid-edge.
                return Err(MbError::NotExist);
            }
            consumed += label.len();
            cur = edge.child;
        }
    }

    /// Longest-prefix lookup: the longest present key that is a prefix of
    /// `key`. Returns `(prefix_len, value)`.
    pub fn find_longest_prefix(&self, key: &[u8]) -> MbResult<(usize, Vec<u8>)> {
        Self::check_key(key)?;
        let mut lf = self.header.lf_begin()?;
        let mut cur = self.header.root_offset()?;
        if cur == 0 {
            return Err(MbError::NotInitialized);
        }
        let mut consumed = 0usize;
        let mut best: Option<(usize, u64)> = None;
        loop {
            let node = self.mem.read_node(cur)?;
            self.header.lf_validate(&mut lf, cur)?;
            if node.terminal && consumed > 0 {
                best = Some((consumed, cur));
            }
            if consumed == key.len() {
                break;
            }
            let Ok(idx) = node.find_edge(key[consumed]) else {
                break;
            };
            let eoff = node.edges[idx].1;
            let (edge, label) = self.read_edge_checked(&mut lf, eoff)?;
            let common = common_prefix(&label, &key[consumed..]);
            if common < label.len() {
                break;
            }
            consumed += label.len();
            cur = edge.child;
        }
        match best {
            Some((len, node_off)) => Ok((len, self.read_terminal_value(node_off)?)),
            None => Err(MbError::NotExist),
        }
    }

    /// Yields the next prefix of `key` present in the trie, strictly longer
    /// than `cursor.match_len`. `Ok(None)` once the sequence is exhausted.
    pub fn find_prefix(
        &self,
        key: &[u8],
        cursor: &mut PrefixCursor,
    ) -> MbResult<Option<(usize, Vec<u8>)>> {
        Self::check_key(key)?;
        if cursor.done {
            return Ok(None);
        }
        if cursor.match_len >= key.len() {
            return Err(MbError::OutOfBound);
        }
        let mut lf = self.header.lf_begin()?;
        let mut cur = self.header.root_offset()?;
        if cur == 0 {
            return Err(MbError::NotInitialized);
        }
        let mut consumed = 0usize;
        loop {
            let node = self.mem.read_node(cur)?;
            self.header.lf_validate(&mut lf, cur)?;
            if node.terminal && consumed > cursor.match_len {
                let value = self.read_terminal_value(cur)?;
                cursor.match_len = consumed;
                if consumed == key.len() {
                    cursor.done = true;
                }
                return Ok(Some((consumed, value)));
            }
            if consumed == key.len() {
                break;
            }
            let Ok(idx) = node.find_edge(key[consumed]) else {
                break;
            };
            let eoff = node.edges[idx].1;
            let (edge, label) = self.read_edge_checked(&mut lf, eoff)?;
            let common = common_prefix(&label, &key[consumed..]);
            if common < label.len() {
                break;
            }
            consumed += label.len();
            cur = edge.child;
        }
        cursor.done = true;
        Ok(None)
    }

    fn read_edge_checked(&self, lf: &mut u32, eoff: u64) -> MbResult<(EdgeRec, Vec<u8>)> {
        let edge = self.mem.read_edge(eoff)?;
        if edge.flags & EDGE_FLAG_IN_PROGRESS != 0 {
            return Err(MbError::TryAgain);
        }
        self.header.lf_validate(lf, eoff)?;
        let label = self.mem.read_label(&edge)?;
        self.header.lf_validate(lf, eoff)?;
        Ok((edge, label))
    }

    /// Copies a terminal node's payload under one strict lock-free window
    /// that also covers a re-read of the node itself. A mutation that
    /// frees or reuses the payload slot always lands a counter bump inside
    /// the window, so a torn or misdirected copy is never handed back.
    fn read_terminal_value(&self, node_off: u64) -> MbResult<Vec<u8>> {
        let strict = self.header.lf_begin()?;
        let node = self.mem.read_node(node_off)?;
        if !node.terminal {
            return Err(MbError::TryAgain);
        }
        let data_off = node.data_off;
        let mut len_bytes = [0u8; 2];
        self.data
            .read_into(data_off, &mut len_bytes)
            .map_err(crate::trie::reader_err)?;
        let len = u16::from_le_bytes(len_bytes) as usize;
        if len > MAX_DATA_SIZE {
            return Err(MbError::TryAgain);
        }
        let mut value = vec![0u8; len];
        if len > 0 {
            self.data
                .read_into(data_off + 2, &mut value)
                .map_err(crate::trie::reader_err)?;
        }
        self.header.lf_strict(strict)?;
        Ok(value)
    }

    // === mutations ===

    /// Inserts `key` -> `value`. With `overwrite`, replaces an existing
    /// value (journaled, old slot freed); otherwise an existing key fails
    /// with `InDict`.
    pub fn add(&mut self, key: &[u8], value: &[u8], overwrite: bool) -> MbResult<()> {
        self.check_writable()?;
        Self::check_key(key)?;
        self.check_value(value)?;

        let mut cur = self.header.root_offset()?;
        if cur == 0 {
            return Err(MbError::NotInitialized);
        }
        let mut parent_edge: Option<u64> = None;
        let mut consumed = 0usize;
        loop {
            let node = self.mem.read_node(cur)?;
            if consumed == key.len() {
                return if node.terminal {
                    if !overwrite {
                        return Err(MbError::InDict);
                    }
                    self.replace_value(cur, &node, value)
                } else {
                    self.set_terminal(cur, &node, value)
                };
            }
            match node.find_edge(key[consumed]) {
                Err(_) => {
                    return self.add_new_edge(cur, &node, parent_edge, &key[consumed..], value)
                }
                Ok(idx) => {
                    let eoff = node.edges[idx].1;
                    let edge = self.mem.read_edge(eoff)?;
                    let label = self.mem.read_label(&edge)?;
                    let common = common_prefix(&label, &key[consumed..]);
                    if common == label.len() {
                        consumed += label.len();
                        parent_edge = Some(eoff);
                        cur = edge.child;
                    } else {
                        return self.split_edge(eoff, &edge, &label, common, &key[consumed..], value);
                    }
                }
            }
        }
    }

    /// Overwrite of an existing terminal's payload (`ADD_DATA_OFF`).
    fn replace_value(&mut self, node_off: u64, node: &NodeRec, value: &[u8]) -> MbResult<()> {
        let count = self.header.count()?;
        let new_data = self.write_value(value)?;
        let pre = self.mem.read_raw(node_off, NODE_HEADER_SIZE)?;
        self.header
            .journal_begin(ExceptionClass::AddDataOff, node_off, node_off, &pre, count)?;
        self.mem
            .rewrite_node_head(&self.header, node_off, true, new_data, node.edges.len())?;
        self.header.journal_clear()?;
        self.free_value(node.data_off)?;
        Ok(())
    }

    /// Key ends at an existing non-terminal node (`ADD_DATA_OFF`).
    fn set_terminal(&mut self, node_off: u64, node: &NodeRec, value: &[u8]) -> MbResult<()> {
        let count = self.header.count()?;
        let data_off = self.write_value(value)?;
        let pre = self.mem.read_raw(node_off, NODE_HEADER_SIZE)?;
        self.header
            .journal_begin(ExceptionClass::AddDataOff, node_off, node_off, &pre, count)?;
        self.mem
            .rewrite_node_head(&self.header, node_off, true, data_off, node.edges.len())?;
        self.header.set_count(count + 1)?;
        self.header.journal_clear()?;
        Ok(())
    }

    /// No edge starts with the diverging byte: build the suffix chain and
    /// relocate the node with the new edge inserted (`ADD_EDGE`).
    fn add_new_edge(
        &mut self,
        node_off: u64,
        node: &NodeRec,
        parent_edge: Option<u64>,
        rem: &[u8],
        value: &[u8],
    ) -> MbResult<()> {
        let data_off = self.write_value(value)?;
        let (first, chain_edge) = self.mem.build_chain(&self.header, rem, data_off)?;

        let mut relocated = node.clone();
        let pos = relocated
            .find_edge(first)
            .expect_err("edge byte was absent");
        relocated.edges.insert(pos, (first, chain_edge));
        let new_off = self.mem.write_new_node(&self.header, &relocated)?;

        let count = self.header.count()?;
        self.swing_pointer(
            ExceptionClass::AddEdge,
            parent_edge,
            node_off,
            new_off,
            count,
            count + 1,
        )?;
        self.mem
            .free_node(&self.header, node_off, node.edges.len())?;
        Ok(())
    }

    /// Divergence inside an edge label: introduce an intermediate node and
    /// shorten the split edge in place (`ADD_NODE`).
    fn split_edge(
        &mut self,
        eoff: u64,
        edge: &EdgeRec,
        label: &[u8],
        common: usize,
        rem: &[u8],
        value: &[u8],
    ) -> MbResult<()> {
        debug_assert!(common >= 1 && common < label.len());
        let tail_edge = self.mem.new_edge(&self.header, &label[common..], edge.child)?;
        let tail_off = self.mem.write_new_edge(&self.header, &tail_edge)?;
        let mut mid = NodeRec {
            terminal: false,
            data_off: 0,
            edges: vec![(label[common], tail_off)],
        };

        let rem_after = &rem[common..];
        let data_off = self.write_value(value)?;
        if rem_after.is_empty() {
            mid.terminal = true;
            mid.data_off = data_off;
        } else {
            let (first, chain_edge) = self.mem.build_chain(&self.header, rem_after, data_off)?;
            let pos = mid.find_edge(first).expect_err("diverging byte differs");
            mid.edges.insert(pos, (first, chain_edge));
        }
        let mid_off = self.mem.write_new_node(&self.header, &mid)?;

        // Shorten the split edge to the common prefix, repointing at the
        // intermediate node. A still-spilled tail keeps its slot when the
        // size class is unchanged (the prefix is already in place).
        let mut shortened = *edge;
        shortened.label_len = common as u8;
        shortened.child = mid_off;
        let mut free_old_spill = false;
        if edge.has_spill() {
            if common <= INLINE_LABEL_MAX {
                shortened.tail = [0u8; 5];
                shortened.tail[..common - 1].copy_from_slice(&label[1..common]);
                free_old_spill = true;
            } else {
                let old_slot = Arena::slot_size(ArenaKind::Index, label.len() - 1);
                let new_slot = Arena::slot_size(ArenaKind::Index, common - 1);
                if old_slot != new_slot {
                    // Move the tail prefix into a right-sized slot so a
                    // later free threads it onto the correct class.
                    let replacement = self.mem.new_edge(&self.header, &label[..common], mid_off)?;
                    shortened.tail = replacement.tail;
                    free_old_spill = true;
                }
            }
        }

        let count = self.header.count()?;
        self.header
            .journal_begin(ExceptionClass::AddNode, eoff, eoff, &edge.encode(), count)?;
        self.mem.rewrite_edge(&self.header, eoff, &shortened)?;
        self.header.set_count(count + 1)?;
        self.header.journal_clear()?;

        if free_old_spill {
            self.mem
                .arena()
                .free(&self.header, edge.spill_offset(), label.len() - 1)?;
        }
        Ok(())
    }

    /// Removes `key`.
    pub fn remove(&mut self, key: &[u8]) -> MbResult<()> {
        self.check_writable()?;
        Self::check_key(key)?;

        let mut cur = self.header.root_offset()?;
        if cur == 0 {
            return Err(MbError::NotInitialized);
        }
        // Lineage needed to detach a leaf: the edge into the current node,
        // the node holding that edge, and the pointer into that node.
        let mut edge_in: Option<(u64, EdgeRec)> = None;
        let mut parent_off: Option<u64> = None;
        let mut parent_ptr: Option<u64> = None;
        let mut consumed = 0usize;
        let node = loop {
            let node = self.mem.read_node(cur)?;
            if consumed == key.len() {
                break node;
            }
            let Ok(idx) = node.find_edge(key[consumed]) else {
                return Err(MbError::NotExist);
            };
            let eoff = node.edges[idx].1;
            let edge = self.mem.read_edge(eoff)?;
            let label = self.mem.read_label(&edge)?;
            let common = common_prefix(&label, &key[consumed..]);
            if common < label.len() {
                return Err(MbError::NotExist);
            }
            consumed += label.len();
            parent_ptr = edge_in.as_ref().map(|&(off, _)| off);
            parent_off = Some(cur);
            edge_in = Some((eoff, edge));
            cur = edge.child;
        };

        if !node.terminal {
            return Err(MbError::NotExist);
        }

        if !node.edges.is_empty() || edge_in.is_none() {
            return self.clear_terminal(cur, &node);
        }

        let (eoff, edge) = edge_in.expect("leaf below root has an incoming edge");
        let g_off = parent_off.expect("incoming edge has a holder");
        self.detach_leaf(cur, &node, eoff, &edge, g_off, parent_ptr)
    }

    /// Terminal with children: clear the terminal state (`CLEAR_EDGE`).
    /// The journal holds the cleared image, so recovery completes rather
    /// than resurrects the removal.
    fn clear_terminal(&mut self, node_off: u64, node: &NodeRec) -> MbResult<()> {
        let count = self.header.count()?.saturating_sub(1);
        let post = NodeRec {
            terminal: false,
            data_off: 0,
            edges: node.edges.clone(),
        };
        let image = &post.encode()[..NODE_HEADER_SIZE];
        self.header
            .journal_begin(ExceptionClass::ClearEdge, node_off, node_off, image, count)?;
        self.mem
            .rewrite_node_head(&self.header, node_off, false, 0, node.edges.len())?;
        self.header.set_count(count)?;
        self.header.journal_clear()?;
        self.free_value(node.data_off)?;
        Ok(())
    }

    /// Terminal leaf: detach its edge from the parent node, relocating the
    /// parent without the edge (`REMOVE_EDGE`), then merge a single
    /// remaining sibling into the grandparent edge.
    fn detach_leaf(
        &mut self,
        leaf_off: u64,
        leaf: &NodeRec,
        eoff: u64,
        edge: &EdgeRec,
        g_off: u64,
        g_ptr: Option<u64>,
    ) -> MbResult<()> {
        let parent = self.mem.read_node(g_off)?;
        let idx = parent
            .find_edge(edge.first)
            .map_err(|_| MbError::Unknown("detached edge not in parent".into()))?;
        let mut shrunk = parent.clone();
        shrunk.edges.remove(idx);
        let new_g_off = self.mem.write_new_node(&self.header, &shrunk)?;

        let count = self.header.count()?.saturating_sub(1);
        self.swing_pointer(
            ExceptionClass::RemoveEdge,
            g_ptr,
            g_off,
            new_g_off,
            count,
            count,
        )?;

        self.free_value(leaf.data_off)?;
        self.mem.free_node(&self.header, leaf_off, 0)?;
        self.mem.free_edge(&self.header, eoff, edge)?;
        self.mem
            .free_node(&self.header, g_off, parent.edges.len())?;

        if shrunk.edges.len() == 1 && !shrunk.terminal {
            if let Some(ep_off) = g_ptr {
                self.merge_single_child(ep_off, new_g_off, &shrunk)?;
            }
        }
        Ok(())
    }

    /// Folds a node's only remaining edge into the edge above it.
    fn merge_single_child(&mut self, ep_off: u64, g_off: u64, g_node: &NodeRec) -> MbResult<()> {
        let ep = self.mem.read_edge(ep_off)?;
        let ep_label = self.mem.read_label(&ep)?;
        let (_, child_eoff) = g_node.edges[0];
        let child_edge = self.mem.read_edge(child_eoff)?;
        let child_label = self.mem.read_label(&child_edge)?;

        let mut combined = ep_label.clone();
        combined.extend_from_slice(&child_label);
        if combined.len() > MAX_LABEL_LEN {
            // The chain node stays; correctness is unaffected.
            return Ok(());
        }

        let merged = self
            .mem
            .new_edge(&self.header, &combined, child_edge.child)?;
        let count = self.header.count()?;
        self.header.journal_begin(
            ExceptionClass::RemoveEdge,
            ep_off,
            ep_off,
            &merged.encode(),
            count,
        )?;
        self.mem.rewrite_edge(&self.header, ep_off, &merged)?;
        self.header.journal_clear()?;

        if ep.has_spill() {
            self.mem
                .arena()
                .free(&self.header, ep.spill_offset(), ep_label.len() - 1)?;
        }
        self.mem.free_edge(&self.header, child_eoff, &child_edge)?;
        self.mem.free_node(&self.header, g_off, 1)?;
        Ok(())
    }

    /// Swings the single pointer that makes a relocated node reachable.
    ///
    /// For `ADD_*` classes the journal holds the pointer's pre-image
    /// (recovery undoes the mutation); for `REMOVE_EDGE` it holds the
    /// post-image (recovery completes it). `journal_count` is the entry
    /// count recovery installs; `final_count` is installed on success.
    fn swing_pointer(
        &mut self,
        class: ExceptionClass,
        parent_edge: Option<u64>,
        old_child: u64,
        new_child: u64,
        journal_count: u64,
        final_count: u64,
    ) -> MbResult<()> {
        match parent_edge {
            None => {
                let image = match class {
                    ExceptionClass::RemoveEdge => new_child.to_le_bytes(),
                    _ => old_child.to_le_bytes(),
                };
                self.header
                    .journal_begin(class, ROOT_PARENT, ROOT_PARENT, &image, journal_count)?;
                self.header.lf_publish(ROOT_PARENT)?;
                self.header.set_root_offset(new_child)?;
                self.header.lf_done()?;
                self.header.set_count(final_count)?;
                self.header.journal_clear()?;
            }
            Some(eoff) => {
                let current = self.mem.read_edge(eoff)?;
                let mut updated = current;
                updated.child = new_child;
                let image = match class {
                    ExceptionClass::RemoveEdge => updated.encode(),
                    _ => current.encode(),
                };
                self.header
                    .journal_begin(class, eoff, eoff, &image, journal_count)?;
                self.mem.rewrite_edge(&self.header, eoff, &updated)?;
                self.header.set_count(final_count)?;
                self.header.journal_clear()?;
            }
        }
        Ok(())
    }

    /// Reinitializes both arenas and the trie: everything is gone.
    ///
    /// Journaled as a `REMOVE_EDGE` against the root pointer so a crash
    /// mid-reset completes into the empty trie instead of leaving a
    /// half-reset header.
    pub fn remove_all(&mut self) -> MbResult<()> {
        self.check_writable()?;
        use crate::header::ARENA_START;

        // The fresh root lands at the bottom of the index arena.
        let empty = NodeRec::empty().encode();
        self.mem.write_raw(ARENA_START, &empty)?;
        self.header.journal_begin(
            ExceptionClass::RemoveEdge,
            ROOT_PARENT,
            ROOT_PARENT,
            &ARENA_START.to_le_bytes(),
            0,
        )?;

        self.header.clear_free_lists()?;
        self.header
            .set_hwm(ArenaKind::Index, ARENA_START + 16)?;
        self.header.set_hwm(ArenaKind::Data, ARENA_START)?;
        self.header.lf_publish(ROOT_PARENT)?;
        self.header.set_root_offset(ARENA_START)?;
        self.header.set_count(0)?;
        self.header.lf_done()?;
        self.header.journal_clear()?;
        self.header.flush()?;
        info!("removed all entries");
        Ok(())
    }

    // === payload slots ===

    fn write_value(&self, value: &[u8]) -> MbResult<u64> {
        let off = self.data.alloc(&self.header, 2 + value.len())?;
        let mut slot = Vec::with_capacity(2 + value.len());
        slot.extend_from_slice(&(value.len() as u16).to_le_bytes());
        slot.extend_from_slice(value);
        self.data.write(off, &slot)?;
        Ok(off)
    }

    fn free_value(&self, data_off: u64) -> MbResult<()> {
        let mut len_bytes = [0u8; 2];
        self.data.read_into(data_off, &mut len_bytes)?;
        let len = u16::from_le_bytes(len_bytes) as usize;
        self.data.free(&self.header, data_off, 2 + len)
    }

}

/// Length of the shared prefix of two byte strings.
pub(crate) fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}
