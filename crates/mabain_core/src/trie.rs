//! Trie node and edge memory over the index arena.
//!
//! ## Node record (variable size)
//!
//! ```text
//! | flags (1) | edge count k (2, LE) | data offset (5) |
//! | first bytes (k, strictly sorted) | edge offsets (k x 5) |
//! ```
//!
//! The data offset is meaningful only when the terminal flag is set.
//!
//! ## Edge record (13 bytes, fixed)
//!
//! ```text
//! | first byte (1) | label len (1) | tail (5) | child offset (5) | flags (1) |
//! ```
//!
//! A label of up to six bytes is stored inline: its first byte in byte 0
//! and the remainder in the tail field. Longer labels spill the remainder
//! into an index-arena slot whose offset occupies the tail field. Labels
//! longer than 255 bytes cannot exist; inserting a longer key suffix chains
//! intermediate nodes instead.
//!
//! Destructive rewrites of reachable records go through the lock-free
//! publication protocol so concurrent readers can detect them; freshly
//! allocated records are unreachable until a parent pointer is swung and
//! need no protocol.

use crate::arena::Arena;
use crate::error::{MbError, MbResult};
use crate::header::Header;

/// Offsets inside node and edge records are stored in five bytes.
pub const OFFSET_SIZE: usize = 5;

/// Size of an edge record.
pub const EDGE_RECORD_SIZE: usize = 13;

/// Size of the fixed node prefix.
pub const NODE_HEADER_SIZE: usize = 8;

/// Longest label storable inline (first byte plus five tail bytes).
pub const INLINE_LABEL_MAX: usize = 6;

/// Longest label an edge can carry.
pub const MAX_LABEL_LEN: usize = 255;

/// Terminal bit in node flags.
pub const NODE_FLAG_TERMINAL: u8 = 0x01;

/// In-progress bit in edge flags, set by the writer around multi-word
/// edge rewrites.
pub const EDGE_FLAG_IN_PROGRESS: u8 = 0x01;

/// Largest possible node fanout (one edge per first byte).
const MAX_FANOUT: usize = 256;

fn read_off5(bytes: &[u8]) -> u64 {
    let mut v = 0u64;
    for (i, &b) in bytes.iter().take(OFFSET_SIZE).enumerate() {
        v |= (b as u64) << (8 * i);
    }
    v
}

fn write_off5(bytes: &mut [u8], v: u64) {
    for (i, b) in bytes.iter_mut().take(OFFSET_SIZE).enumerate() {
        *b = (v >> (8 * i)) as u8;
    }
}

/// A decoded edge record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeRec {
    /// First byte of the label.
    pub first: u8,
    /// Total label length, 1..=255.
    pub label_len: u8,
    /// Inline label tail, or the spilled tail's arena offset.
    pub tail: [u8; OFFSET_SIZE],
    /// Child node offset.
    pub child: u64,
    /// Edge flags.
    pub flags: u8,
}

impl EdgeRec {
    /// Decodes a 13-byte record.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Self {
        let mut tail = [0u8; OFFSET_SIZE];
        tail.copy_from_slice(&bytes[2..7]);
        Self {
            first: bytes[0],
            label_len: bytes[1],
            tail,
            child: read_off5(&bytes[7..12]),
            flags: bytes[12],
        }
    }

    /// Encodes to the 13-byte wire form.
    #[must_use]
    pub fn encode(&self) -> [u8; EDGE_RECORD_SIZE] {
        let mut out = [0u8; EDGE_RECORD_SIZE];
        out[0] = self.first;
        out[1] = self.label_len;
        out[2..7].copy_from_slice(&self.tail);
        write_off5(&mut out[7..12], self.child);
        out[12] = self.flags;
        out
    }

    /// True when the label tail lives in its own arena slot.
    #[must_use]
    pub fn has_spill(&self) -> bool {
        self.label_len as usize > INLINE_LABEL_MAX
    }

    /// Arena offset of the spilled tail.
    #[must_use]
    pub fn spill_offset(&self) -> u64 {
        read_off5(&self.tail)
    }
}

/// A decoded node record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRec {
    /// True when a key ends at this node.
    pub terminal: bool,
    /// Data-arena offset of the payload; meaningful only when terminal.
    pub data_off: u64,
    /// `(first byte, edge offset)` pairs, strictly sorted by first byte.
    pub edges: Vec<(u8, u64)>,
}

impl NodeRec {
    /// An empty non-terminal node.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            terminal: false,
            data_off: 0,
            edges: Vec::new(),
        }
    }

    /// Size of the encoded record.
    #[must_use]
    pub fn logical_size(&self) -> usize {
        NODE_HEADER_SIZE + self.edges.len() * (1 + OFFSET_SIZE)
    }

    /// Encoded size of a node with `k` edges.
    #[must_use]
    pub fn size_for(k: usize) -> usize {
        NODE_HEADER_SIZE + k * (1 + OFFSET_SIZE)
    }

    /// Encodes to the wire form.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let k = self.edges.len();
        let mut out = vec![0u8; self.logical_size()];
        out[0] = if self.terminal { NODE_FLAG_TERMINAL } else { 0 };
        out[1..3].copy_from_slice(&(k as u16).to_le_bytes());
        write_off5(&mut out[3..8], self.data_off);
        for (i, &(fb, eoff)) in self.edges.iter().enumerate() {
            out[NODE_HEADER_SIZE + i] = fb;
            let pos = NODE_HEADER_SIZE + k + i * OFFSET_SIZE;
            write_off5(&mut out[pos..pos + OFFSET_SIZE], eoff);
        }
        out
    }

    /// Decodes from bytes previously produced by [`NodeRec::encode`].
    ///
    /// Any structural insanity (oversized fanout, unsorted first bytes)
    /// means the snapshot was torn by a concurrent writer: `TryAgain`.
    pub fn decode(bytes: &[u8]) -> MbResult<Self> {
        if bytes.len() < NODE_HEADER_SIZE {
            return Err(MbError::TryAgain);
        }
        let k = u16::from_le_bytes([bytes[1], bytes[2]]) as usize;
        if k > MAX_FANOUT || bytes.len() < Self::size_for(k) {
            return Err(MbError::TryAgain);
        }
        let mut edges: Vec<(u8, u64)> = Vec::with_capacity(k);
        for i in 0..k {
            let fb = bytes[NODE_HEADER_SIZE + i];
            if i > 0 && fb <= edges[i - 1].0 {
                return Err(MbError::TryAgain);
            }
            let pos = NODE_HEADER_SIZE + k + i * OFFSET_SIZE;
            edges.push((fb, read_off5(&bytes[pos..pos + OFFSET_SIZE])));
        }
        Ok(Self {
            terminal: bytes[0] & NODE_FLAG_TERMINAL != 0,
            data_off: read_off5(&bytes[3..8]),
            edges,
        })
    }

    /// Binary-searches the sorted first-byte array.
    ///
    /// Returns the edge index, or the insertion position on a miss.
    pub fn find_edge(&self, first: u8) -> Result<usize, usize> {
        self.edges.binary_search_by_key(&first, |&(fb, _)| fb)
    }
}

/// Trie memory: node/edge allocation, encoding, and in-place rewrites on
/// top of the index arena.
pub struct TrieMem {
    arena: Arena,
}

impl TrieMem {
    /// Wraps the index arena.
    pub fn new(arena: Arena) -> Self {
        Self { arena }
    }

    /// The underlying index arena.
    #[must_use]
    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    /// Replaces the underlying arena (after a resource-collection swap).
    pub fn set_arena(&mut self, arena: Arena) {
        self.arena = arena;
    }

    /// Raw write into the index arena. Used by recovery to restore journal
    /// images, and by the crash-simulation harness to corrupt slots.
    pub fn write_raw(&self, offset: u64, bytes: &[u8]) -> MbResult<()> {
        self.arena.write(offset, bytes)
    }

    /// Raw read from the index arena.
    pub fn read_raw(&self, offset: u64, len: usize) -> MbResult<Vec<u8>> {
        self.arena.read(offset, len)
    }

    /// Reads and decodes the node at `offset`.
    pub fn read_node(&self, offset: u64) -> MbResult<NodeRec> {
        let mut head = [0u8; NODE_HEADER_SIZE];
        self.arena
            .read_into(offset, &mut head)
            .map_err(reader_err)?;
        let k = u16::from_le_bytes([head[1], head[2]]) as usize;
        if k > MAX_FANOUT {
            return Err(MbError::TryAgain);
        }
        let mut bytes = vec![0u8; NodeRec::size_for(k)];
        bytes[..NODE_HEADER_SIZE].copy_from_slice(&head);
        if k > 0 {
            self.arena
                .read_into(
                    offset + NODE_HEADER_SIZE as u64,
                    &mut bytes[NODE_HEADER_SIZE..],
                )
                .map_err(reader_err)?;
        }
        NodeRec::decode(&bytes)
    }

    /// Allocates a fresh slot and writes `node` into it.
    pub fn write_new_node(&self, hdr: &Header, node: &NodeRec) -> MbResult<u64> {
        let bytes = node.encode();
        let off = self.arena.alloc(hdr, bytes.len())?;
        self.arena.write(off, &bytes)?;
        Ok(off)
    }

    /// Frees the slot of a node with `k` edges.
    pub fn free_node(&self, hdr: &Header, offset: u64, k: usize) -> MbResult<()> {
        self.arena.free(hdr, offset, NodeRec::size_for(k))
    }

    /// Reads and decodes the edge record at `offset`.
    pub fn read_edge(&self, offset: u64) -> MbResult<EdgeRec> {
        let mut bytes = [0u8; EDGE_RECORD_SIZE];
        self.arena.read_into(offset, &mut bytes).map_err(reader_err)?;
        let edge = EdgeRec::decode(&bytes);
        if edge.label_len == 0 {
            return Err(MbError::TryAgain);
        }
        Ok(edge)
    }

    /// Builds an edge record for `label`, spilling the tail if needed.
    pub fn new_edge(&self, hdr: &Header, label: &[u8], child: u64) -> MbResult<EdgeRec> {
        debug_assert!(!label.is_empty() && label.len() <= MAX_LABEL_LEN);
        let mut tail = [0u8; OFFSET_SIZE];
        if label.len() <= INLINE_LABEL_MAX {
            tail[..label.len() - 1].copy_from_slice(&label[1..]);
        } else {
            let spill = self.arena.alloc(hdr, label.len() - 1)?;
            self.arena.write(spill, &label[1..])?;
            write_off5(&mut tail, spill);
        }
        Ok(EdgeRec {
            first: label[0],
            label_len: label.len() as u8,
            tail,
            child,
            flags: 0,
        })
    }

    /// Allocates a fresh slot and writes `edge` into it.
    pub fn write_new_edge(&self, hdr: &Header, edge: &EdgeRec) -> MbResult<u64> {
        let off = self.arena.alloc(hdr, EDGE_RECORD_SIZE)?;
        self.arena.write(off, &edge.encode())?;
        Ok(off)
    }

    /// Returns the full label of `edge`.
    pub fn read_label(&self, edge: &EdgeRec) -> MbResult<Vec<u8>> {
        let len = edge.label_len as usize;
        let mut label = Vec::with_capacity(len);
        label.push(edge.first);
        if len > 1 {
            if edge.has_spill() {
                let tail = self
                    .arena
                    .read(edge.spill_offset(), len - 1)
                    .map_err(reader_err)?;
                label.extend_from_slice(&tail);
            } else {
                label.extend_from_slice(&edge.tail[..len - 1]);
            }
        }
        Ok(label)
    }

    /// Frees an edge slot and its spilled tail, if any.
    pub fn free_edge(&self, hdr: &Header, offset: u64, edge: &EdgeRec) -> MbResult<()> {
        if edge.has_spill() {
            self.arena
                .free(hdr, edge.spill_offset(), edge.label_len as usize - 1)?;
        }
        self.arena.free(hdr, offset, EDGE_RECORD_SIZE)
    }

    /// Rewrites a reachable edge in place under the lock-free protocol.
    ///
    /// The in-progress bit goes up first so a reader that catches the
    /// record mid-rewrite backs off; the final image carries clear flags.
    pub fn rewrite_edge(&self, hdr: &Header, offset: u64, edge: &EdgeRec) -> MbResult<()> {
        hdr.lf_publish(offset)?;
        self.arena
            .write(offset + (EDGE_RECORD_SIZE as u64 - 1), &[EDGE_FLAG_IN_PROGRESS])?;
        let mut image = edge.encode();
        image[EDGE_RECORD_SIZE - 1] &= !EDGE_FLAG_IN_PROGRESS;
        self.arena.write(offset, &image)?;
        hdr.lf_done()?;
        Ok(())
    }

    /// Rewrites a reachable node's fixed prefix (flags and data offset) in
    /// place under the lock-free protocol. The edge arrays are untouched.
    pub fn rewrite_node_head(
        &self,
        hdr: &Header,
        offset: u64,
        terminal: bool,
        data_off: u64,
        k: usize,
    ) -> MbResult<()> {
        let mut head = [0u8; NODE_HEADER_SIZE];
        head[0] = if terminal { NODE_FLAG_TERMINAL } else { 0 };
        head[1..3].copy_from_slice(&(k as u16).to_le_bytes());
        write_off5(&mut head[3..8], data_off);
        hdr.lf_publish(offset)?;
        self.arena.write(offset, &head)?;
        hdr.lf_done()?;
        Ok(())
    }

    /// Materializes the suffix `rem` of a key as a chain of edges ending in
    /// a terminal node that points at `data_off`.
    ///
    /// Labels cap at 255 bytes, so a long suffix becomes several stacked
    /// single-edge nodes. Everything written here is unreachable until the
    /// caller links the returned edge into the trie.
    ///
    /// Returns `(first byte, edge offset)` of the chain's head edge.
    pub fn build_chain(&self, hdr: &Header, rem: &[u8], data_off: u64) -> MbResult<(u8, u64)> {
        debug_assert!(!rem.is_empty());
        let segments: Vec<&[u8]> = rem.chunks(MAX_LABEL_LEN).collect();
        let mut child = self.write_new_node(
            hdr,
            &NodeRec {
                terminal: true,
                data_off,
                edges: Vec::new(),
            },
        )?;
        for (i, seg) in segments.iter().enumerate().rev() {
            let edge = self.new_edge(hdr, seg, child)?;
            let eoff = self.write_new_edge(hdr, &edge)?;
            if i == 0 {
                return Ok((seg[0], eoff));
            }
            child = self.write_new_node(
                hdr,
                &NodeRec {
                    terminal: false,
                    data_off: 0,
                    edges: vec![(seg[0], eoff)],
                },
            )?;
        }
        unreachable!("rem is non-empty")
    }
}

/// Out-of-range reads on the lock-free read path mean a torn snapshot
/// handed us a bogus offset; surface them as retries, not corruption.
pub(crate) fn reader_err(err: MbError) -> MbError {
    if Arena::is_out_of_range(&err) {
        MbError::TryAgain
    } else {
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::ArenaKind;
    use mabain_storage::MmapBackend;
    use tempfile::tempdir;

    fn trie_fixture() -> (tempfile::TempDir, Header, TrieMem) {
        let dir = tempdir().unwrap();
        let header = Header::map(&dir.path().join("_mabain_h")).unwrap();
        header.init(0).unwrap();
        let backend = MmapBackend::create(&dir.path().join("_ibfl")).unwrap();
        let arena = Arena::new(Box::new(backend), ArenaKind::Index, 16 << 20);
        (dir, header, TrieMem::new(arena))
    }

    #[test]
    fn offset_codec_round_trip() {
        let mut buf = [0u8; OFFSET_SIZE];
        for v in [0u64, 1, 0xFF, 0x1234_5678, (1 << 40) - 1] {
            write_off5(&mut buf, v);
            assert_eq!(read_off5(&buf), v);
        }
    }

    #[test]
    fn edge_record_round_trip() {
        let edge = EdgeRec {
            first: b'a',
            label_len: 4,
            tail: [b'b', b'c', b'd', 0, 0],
            child: 0x1234_5678_9A,
            flags: 0,
        };
        assert_eq!(EdgeRec::decode(&edge.encode()), edge);
        assert!(!edge.has_spill());
    }

    #[test]
    fn node_record_round_trip() {
        let node = NodeRec {
            terminal: true,
            data_off: 4242,
            edges: vec![(b'a', 100), (b'k', 200), (b'z', 300)],
        };
        let decoded = NodeRec::decode(&node.encode()).unwrap();
        assert_eq!(decoded, node);
        assert_eq!(decoded.find_edge(b'k'), Ok(1));
        assert_eq!(decoded.find_edge(b'b'), Err(1));
    }

    #[test]
    fn unsorted_node_is_torn() {
        // Encoding preserves whatever order the record holds; a decode of
        // out-of-order first bytes means the snapshot was torn.
        let node = NodeRec {
            terminal: false,
            data_off: 0,
            edges: vec![(b'z', 100), (b'a', 200)],
        };
        let bytes = node.encode();
        assert!(matches!(
            NodeRec::decode(&bytes),
            Err(MbError::TryAgain)
        ));
    }

    #[test]
    fn node_write_and_read_back() {
        let (_t, hdr, mem) = trie_fixture();
        let node = NodeRec {
            terminal: true,
            data_off: 99,
            edges: vec![(b'x', 555)],
        };
        let off = mem.write_new_node(&hdr, &node).unwrap();
        assert_eq!(mem.read_node(off).unwrap(), node);
    }

    #[test]
    fn inline_and_spilled_labels() {
        let (_t, hdr, mem) = trie_fixture();

        let short = mem.new_edge(&hdr, b"abcdef", 1).unwrap();
        assert!(!short.has_spill());
        assert_eq!(mem.read_label(&short).unwrap(), b"abcdef");

        let long_label = b"abcdefghijklmnopqrstuvwxyz";
        let long = mem.new_edge(&hdr, long_label, 2).unwrap();
        assert!(long.has_spill());
        assert_eq!(mem.read_label(&long).unwrap(), long_label);
    }

    #[test]
    fn chain_handles_long_suffixes() {
        let (_t, hdr, mem) = trie_fixture();
        let rem = vec![b'q'; 600];
        let (first, eoff) = mem.build_chain(&hdr, &rem, 777).unwrap();
        assert_eq!(first, b'q');

        // Walk the chain back down and verify the label concatenation.
        let mut collected = Vec::new();
        let mut eoff = eoff;
        loop {
            let edge = mem.read_edge(eoff).unwrap();
            collected.extend_from_slice(&mem.read_label(&edge).unwrap());
            let node = mem.read_node(edge.child).unwrap();
            if node.terminal {
                assert_eq!(node.data_off, 777);
                assert!(node.edges.is_empty());
                break;
            }
            assert_eq!(node.edges.len(), 1);
            eoff = node.edges[0].1;
        }
        assert_eq!(collected, rem);
    }

    #[test]
    fn rewrite_edge_clears_in_progress() {
        let (_t, hdr, mem) = trie_fixture();
        let edge = mem.new_edge(&hdr, b"ab", 10).unwrap();
        let off = mem.write_new_edge(&hdr, &edge).unwrap();

        let mut updated = edge;
        updated.child = 20;
        mem.rewrite_edge(&hdr, off, &updated).unwrap();

        let read_back = mem.read_edge(off).unwrap();
        assert_eq!(read_back.child, 20);
        assert_eq!(read_back.flags & EDGE_FLAG_IN_PROGRESS, 0);
    }
}
