//! The persisted header record.
//!
//! A single fixed-size record at `<db_dir>/_mabain_h`, mapped read-write by
//! every handle. It holds the trie root, arena bookkeeping, handle counts,
//! the lock-free publication fields, and the exception descriptor used by
//! crash recovery.
//!
//! ## Record layout
//!
//! ```text
//! | magic (4) | version (4 x u16) | data_size (4) |
//! | index_file_size (8) | data_file_size (8) | index_hwm (8) | data_hwm (8) |
//! | root_offset (8) | count (8) | num_writer (4) | num_reader (4) |
//! | lf_counter (4) | pad (4) | lf_offset (8) | rc_generation (8) |
//! | index_pending_free (8) | data_pending_free (8) |
//! | excep_status (4) | excep_buf_len (4) | excep_offset (8) | excep_lf_offset (8) |
//! | rc_saved_root (8) | rc_saved_index_hwm (8) | rc_saved_data_hwm (8) |
//! | excep_buffer (64) | crc32 (4) | reserved ... |
//! | index free-list heads (256 x u64) | data free-list heads (256 x u64) |
//! ```
//!
//! Counter fields are accessed atomically through the mapped region; all
//! other fields are owned exclusively by the single writer.

use crate::error::{MbError, MbResult};
use mabain_storage::MmapRegion;
use std::fmt;
use std::path::Path;

/// Total size of the header file.
pub const HEADER_SIZE: usize = 8192;

/// Identifies the store format.
pub const MB_MAGIC: u32 = 0x4D41_4249;

/// Format version quartet.
pub const MB_VERSION: [u16; 4] = [1, 1, 0, 0];

/// Capacity of the exception descriptor's restore image.
pub const EXCEP_BUFFER_SIZE: usize = 64;

/// First usable offset in either arena; offset 0 is the null sentinel.
pub const ARENA_START: u64 = 16;

/// Free-list size classes per arena.
pub const NUM_SIZE_CLASSES: usize = 256;

// Field offsets within the header record.
const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_DATA_SIZE: usize = 12;
const OFF_INDEX_FILE_SIZE: usize = 16;
const OFF_DATA_FILE_SIZE: usize = 24;
const OFF_INDEX_HWM: usize = 32;
const OFF_DATA_HWM: usize = 40;
const OFF_ROOT: usize = 48;
const OFF_COUNT: usize = 56;
const OFF_NUM_WRITER: usize = 64;
const OFF_NUM_READER: usize = 68;
const OFF_LF_COUNTER: usize = 72;
const OFF_LF_OFFSET: usize = 80;
const OFF_RC_GENERATION: usize = 88;
const OFF_INDEX_PENDING_FREE: usize = 96;
const OFF_DATA_PENDING_FREE: usize = 104;
const OFF_EXCEP_STATUS: usize = 112;
const OFF_EXCEP_BUF_LEN: usize = 116;
const OFF_EXCEP_OFFSET: usize = 120;
const OFF_EXCEP_LF_OFFSET: usize = 128;
const OFF_RC_SAVED_ROOT: usize = 136;
const OFF_RC_SAVED_INDEX_HWM: usize = 144;
const OFF_RC_SAVED_DATA_HWM: usize = 152;
const OFF_EXCEP_BUFFER: usize = 160;
const OFF_CRC: usize = 224;
const OFF_EXCEP_LAST: usize = 228;
const OFF_EXCEP_COUNT: usize = 240;
const OFF_FREE_INDEX: usize = 256;
const OFF_FREE_DATA: usize = OFF_FREE_INDEX + NUM_SIZE_CLASSES * 8;

/// Which arena a bookkeeping field belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaKind {
    /// Trie nodes, edges, and spilled edge labels.
    Index,
    /// Leaf payload slots.
    Data,
}

impl ArenaKind {
    /// Slot granularity: every slot size is a multiple of this.
    #[must_use]
    pub const fn granularity(self) -> usize {
        match self {
            ArenaKind::Index => 16,
            ArenaKind::Data => 128,
        }
    }

    /// Largest slot size representable by a size class.
    #[must_use]
    pub const fn max_slot_size(self) -> usize {
        self.granularity() * NUM_SIZE_CLASSES
    }
}

/// Discriminator for the exception descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ExceptionClass {
    /// No mutation in flight.
    None = 0,
    /// A fresh edge is being installed into a node's edge array.
    AddEdge = 1,
    /// A terminal node's data offset is being overwritten.
    AddDataOff = 2,
    /// A new intermediate node is being introduced by a split.
    AddNode = 3,
    /// An edge is being detached from a node.
    RemoveEdge = 4,
    /// An edge's terminal state is being cleared as part of removal.
    ClearEdge = 5,
    /// Resource collection is swapping arena files.
    RcSwap = 6,
}

impl ExceptionClass {
    /// Decodes the on-disk discriminator.
    #[must_use]
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            1 => Some(Self::AddEdge),
            2 => Some(Self::AddDataOff),
            3 => Some(Self::AddNode),
            4 => Some(Self::RemoveEdge),
            5 => Some(Self::ClearEdge),
            6 => Some(Self::RcSwap),
            _ => None,
        }
    }
}

/// Journal target meaning "the header's root offset field".
pub const ROOT_PARENT: u64 = u64::MAX;

/// The mapped header record.
pub struct Header {
    region: MmapRegion,
}

impl Header {
    /// Maps the header file, creating it zero-filled if missing.
    pub fn map(path: &Path) -> MbResult<Self> {
        let region = MmapRegion::open(path, HEADER_SIZE)?;
        Ok(Self { region })
    }

    /// Initializes a brand-new header (first writer open, or `remove_all`).
    pub fn init(&self, data_size: u32) -> MbResult<()> {
        let zero = vec![0u8; HEADER_SIZE];
        self.region.write_bytes(0, &zero)?;
        self.region.store_u32(OFF_MAGIC, MB_MAGIC)?;
        let mut ver = [0u8; 8];
        for (i, v) in MB_VERSION.iter().enumerate() {
            ver[i * 2..i * 2 + 2].copy_from_slice(&v.to_le_bytes());
        }
        self.region.write_bytes(OFF_VERSION, &ver)?;
        self.region.store_u32(OFF_DATA_SIZE, data_size)?;
        self.set_index_hwm(ARENA_START)?;
        self.set_data_hwm(ARENA_START)?;
        let crc = self.identity_crc()?;
        self.region.store_u32(OFF_CRC, crc)?;
        self.region.flush()?;
        Ok(())
    }

    fn identity_crc(&self) -> MbResult<u32> {
        let mut ident = [0u8; 16];
        self.region.read_bytes(0, &mut ident)?;
        Ok(crc32(&ident))
    }

    /// Validates magic, version, and identity checksum.
    ///
    /// # Errors
    ///
    /// Returns `NoDb` on any mismatch; the store must not be used.
    pub fn validate(&self) -> MbResult<()> {
        if self.region.load_u32(OFF_MAGIC)? != MB_MAGIC {
            return Err(MbError::NoDb("bad header magic".into()));
        }
        let mut ver = [0u8; 8];
        self.region.read_bytes(OFF_VERSION, &mut ver)?;
        let major = u16::from_le_bytes([ver[0], ver[1]]);
        if major != MB_VERSION[0] {
            return Err(MbError::NoDb(format!(
                "unsupported header version {major}"
            )));
        }
        let stored = self.region.load_u32(OFF_CRC)?;
        if stored != self.identity_crc()? {
            return Err(MbError::NoDb("header checksum mismatch".into()));
        }
        let root = self.root_offset()?;
        if root != 0 && root >= self.index_file_size()?.max(ARENA_START + 1) {
            return Err(MbError::NoDb(format!("root offset {root} out of range")));
        }
        Ok(())
    }

    /// Flushes the header to its backing file.
    pub fn flush(&self) -> MbResult<()> {
        self.region.flush()?;
        Ok(())
    }

    // === plain fields (writer-owned) ===

    /// Fixed per-entry value size; 0 means variable.
    pub fn data_size(&self) -> MbResult<u32> {
        self.region.load_u32(OFF_DATA_SIZE)
            .map_err(MbError::from)
    }

    /// Current size of an arena's backing file.
    pub fn file_size(&self, kind: ArenaKind) -> MbResult<u64> {
        let off = match kind {
            ArenaKind::Index => OFF_INDEX_FILE_SIZE,
            ArenaKind::Data => OFF_DATA_FILE_SIZE,
        };
        Ok(self.region.load_u64(off)?)
    }

    /// Records an arena's backing file size.
    pub fn set_file_size(&self, kind: ArenaKind, size: u64) -> MbResult<()> {
        let off = match kind {
            ArenaKind::Index => OFF_INDEX_FILE_SIZE,
            ArenaKind::Data => OFF_DATA_FILE_SIZE,
        };
        Ok(self.region.store_u64(off, size)?)
    }

    /// Index arena file size.
    pub fn index_file_size(&self) -> MbResult<u64> {
        self.file_size(ArenaKind::Index)
    }

    /// An arena's high-water mark (next bump-allocation offset).
    pub fn hwm(&self, kind: ArenaKind) -> MbResult<u64> {
        let off = match kind {
            ArenaKind::Index => OFF_INDEX_HWM,
            ArenaKind::Data => OFF_DATA_HWM,
        };
        Ok(self.region.load_u64(off)?)
    }

    /// Sets an arena's high-water mark.
    pub fn set_hwm(&self, kind: ArenaKind, hwm: u64) -> MbResult<()> {
        let off = match kind {
            ArenaKind::Index => OFF_INDEX_HWM,
            ArenaKind::Data => OFF_DATA_HWM,
        };
        Ok(self.region.store_u64(off, hwm)?)
    }

    fn set_index_hwm(&self, hwm: u64) -> MbResult<()> {
        self.set_hwm(ArenaKind::Index, hwm)
    }

    fn set_data_hwm(&self, hwm: u64) -> MbResult<()> {
        self.set_hwm(ArenaKind::Data, hwm)
    }

    /// Root trie-node offset (atomic: readers chase it lock-free).
    pub fn root_offset(&self) -> MbResult<u64> {
        Ok(self.region.load_u64(OFF_ROOT)?)
    }

    /// Publishes a new root trie-node offset.
    pub fn set_root_offset(&self, off: u64) -> MbResult<()> {
        Ok(self.region.store_u64(OFF_ROOT, off)?)
    }

    /// Number of present keys.
    pub fn count(&self) -> MbResult<u64> {
        Ok(self.region.load_u64(OFF_COUNT)?)
    }

    /// Sets the entry count.
    pub fn set_count(&self, count: u64) -> MbResult<()> {
        Ok(self.region.store_u64(OFF_COUNT, count)?)
    }

    /// Bytes freed in an arena since the last resource collection.
    pub fn pending_free(&self, kind: ArenaKind) -> MbResult<u64> {
        let off = match kind {
            ArenaKind::Index => OFF_INDEX_PENDING_FREE,
            ArenaKind::Data => OFF_DATA_PENDING_FREE,
        };
        Ok(self.region.load_u64(off)?)
    }

    /// Adjusts the freed-bytes total for an arena.
    pub fn set_pending_free(&self, kind: ArenaKind, bytes: u64) -> MbResult<()> {
        let off = match kind {
            ArenaKind::Index => OFF_INDEX_PENDING_FREE,
            ArenaKind::Data => OFF_DATA_PENDING_FREE,
        };
        Ok(self.region.store_u64(off, bytes)?)
    }

    // === handle counters (atomic, multi-process) ===

    /// Number of live writer handles (0 or 1 outside of crashes).
    pub fn num_writer(&self) -> MbResult<u32> {
        Ok(self.region.load_u32(OFF_NUM_WRITER)?)
    }

    /// Sets the writer handle count.
    pub fn set_num_writer(&self, n: u32) -> MbResult<()> {
        Ok(self.region.store_u32(OFF_NUM_WRITER, n)?)
    }

    /// Number of live reader handles across all processes.
    pub fn num_reader(&self) -> MbResult<u32> {
        Ok(self.region.load_u32(OFF_NUM_READER)?)
    }

    /// Adjusts the reader handle count; returns the previous value.
    pub fn update_num_reader(&self, delta: i32) -> MbResult<u32> {
        if delta >= 0 {
            Ok(self.region.fetch_add_u32(OFF_NUM_READER, delta as u32)?)
        } else {
            Ok(self.region.fetch_sub_u32(OFF_NUM_READER, (-delta) as u32)?)
        }
    }

    // === lock-free publication (atomic, multi-process) ===

    /// Reader side: snapshots the modification counter before a traversal.
    pub fn lf_begin(&self) -> MbResult<u32> {
        Ok(self.region.load_u32(OFF_LF_COUNTER)?)
    }

    /// Writer side: publishes the slot about to be mutated.
    pub fn lf_publish(&self, offset: u64) -> MbResult<()> {
        self.region.store_u64(OFF_LF_OFFSET, offset)?;
        self.region.fetch_add_u32(OFF_LF_COUNTER, 1)?;
        Ok(())
    }

    /// Writer side: marks the in-flight mutation complete.
    pub fn lf_done(&self) -> MbResult<()> {
        self.region.fetch_add_u32(OFF_LF_COUNTER, 1)?;
        Ok(())
    }

    /// The slot offset most recently published by the writer.
    pub fn lf_offset(&self) -> MbResult<u64> {
        Ok(self.region.load_u64(OFF_LF_OFFSET)?)
    }

    /// Reader side: validates a snapshot of `offset` taken since `start`.
    ///
    /// If the counter moved and the writer's published offset matches the
    /// slot we just read, the snapshot may be torn: `TryAgain`. A counter
    /// move against an unrelated slot is absorbed into `start`.
    pub fn lf_validate(&self, start: &mut u32, offset: u64) -> MbResult<()> {
        let now = self.lf_begin()?;
        if now != *start {
            if self.lf_offset()? == offset {
                return Err(MbError::TryAgain);
            }
            *start = now;
        }
        Ok(())
    }

    /// Reader side: strict window check - any counter movement fails.
    ///
    /// Used around the final payload copy, where a concurrent slot reuse
    /// could otherwise hand back torn bytes.
    pub fn lf_strict(&self, start: u32) -> MbResult<()> {
        if self.lf_begin()? != start {
            return Err(MbError::TryAgain);
        }
        Ok(())
    }

    // === resource collection (writer-owned) ===

    /// Generation counter bumped by every completed resource collection.
    pub fn rc_generation(&self) -> MbResult<u64> {
        Ok(self.region.load_u64(OFF_RC_GENERATION)?)
    }

    /// Bumps the resource-collection generation.
    pub fn bump_rc_generation(&self) -> MbResult<()> {
        let g = self.rc_generation()?;
        Ok(self.region.store_u64(OFF_RC_GENERATION, g + 1)?)
    }

    /// Saved target state for an in-flight arena swap.
    pub fn rc_saved(&self) -> MbResult<(u64, u64, u64)> {
        Ok((
            self.region.load_u64(OFF_RC_SAVED_ROOT)?,
            self.region.load_u64(OFF_RC_SAVED_INDEX_HWM)?,
            self.region.load_u64(OFF_RC_SAVED_DATA_HWM)?,
        ))
    }

    /// Records target state before an arena swap begins.
    pub fn set_rc_saved(&self, root: u64, index_hwm: u64, data_hwm: u64) -> MbResult<()> {
        self.region.store_u64(OFF_RC_SAVED_ROOT, root)?;
        self.region.store_u64(OFF_RC_SAVED_INDEX_HWM, index_hwm)?;
        self.region.store_u64(OFF_RC_SAVED_DATA_HWM, data_hwm)?;
        Ok(())
    }

    // === exception descriptor ===

    /// The in-flight mutation class, or `None`.
    pub fn excep_status(&self) -> MbResult<ExceptionClass> {
        let raw = self.region.load_u32(OFF_EXCEP_STATUS)?;
        ExceptionClass::from_u32(raw)
            .ok_or_else(|| MbError::NoDb(format!("bad exception status {raw}")))
    }

    /// Sets the exception discriminator. Public for the crash-simulation
    /// harness; engine code goes through `journal_begin`/`journal_clear`.
    pub fn set_excep_status(&self, class: ExceptionClass) -> MbResult<()> {
        Ok(self.region.store_u32(OFF_EXCEP_STATUS, class as u32)?)
    }

    /// Captures a journal record: restore image, target, class, and the
    /// entry count recovery should install.
    ///
    /// The descriptor is fully written and fenced before the status store
    /// makes it observable, so a crash at any point leaves either no record
    /// or a complete one.
    pub fn journal_begin(
        &self,
        class: ExceptionClass,
        target: u64,
        lf_offset: u64,
        image: &[u8],
        count_after: u64,
    ) -> MbResult<()> {
        debug_assert!(image.len() <= EXCEP_BUFFER_SIZE);
        self.region.write_bytes(OFF_EXCEP_BUFFER, image)?;
        self.region.store_u32(OFF_EXCEP_BUF_LEN, image.len() as u32)?;
        self.region.store_u64(OFF_EXCEP_OFFSET, target)?;
        self.region.store_u64(OFF_EXCEP_LF_OFFSET, lf_offset)?;
        self.region.store_u32(OFF_EXCEP_LAST, class as u32)?;
        self.region.store_u64(OFF_EXCEP_COUNT, count_after)?;
        // Release-store of the status publishes the whole record.
        self.set_excep_status(class)?;
        Ok(())
    }

    /// The entry count the journaled mutation's recovery installs.
    pub fn excep_saved_count(&self) -> MbResult<u64> {
        Ok(self.region.load_u64(OFF_EXCEP_COUNT)?)
    }

    /// The class of the most recently captured journal record. Unlike the
    /// status, this survives `journal_clear`; the crash-simulation harness
    /// uses it to re-arm a completed mutation's descriptor.
    pub fn excep_last_class(&self) -> MbResult<ExceptionClass> {
        let raw = self.region.load_u32(OFF_EXCEP_LAST)?;
        ExceptionClass::from_u32(raw)
            .ok_or_else(|| MbError::NoDb(format!("bad journal class {raw}")))
    }

    /// Clears the in-flight status. The rest of the descriptor is left in
    /// place; only the status byte decides whether recovery runs.
    pub fn journal_clear(&self) -> MbResult<()> {
        self.set_excep_status(ExceptionClass::None)
    }

    /// The journal's target slot offset.
    pub fn excep_offset(&self) -> MbResult<u64> {
        Ok(self.region.load_u64(OFF_EXCEP_OFFSET)?)
    }

    /// The slot offset published for the lock-free protocol at capture time.
    pub fn excep_lf_offset(&self) -> MbResult<u64> {
        Ok(self.region.load_u64(OFF_EXCEP_LF_OFFSET)?)
    }

    /// Copies out the journal's restore image.
    pub fn excep_image(&self) -> MbResult<Vec<u8>> {
        let len = self.region.load_u32(OFF_EXCEP_BUF_LEN)? as usize;
        if len > EXCEP_BUFFER_SIZE {
            return Err(MbError::NoDb(format!("bad exception buffer length {len}")));
        }
        let mut buf = vec![0u8; len];
        self.region.read_bytes(OFF_EXCEP_BUFFER, &mut buf)?;
        Ok(buf)
    }

    // === free lists ===

    fn free_head_off(kind: ArenaKind, class: usize) -> usize {
        let base = match kind {
            ArenaKind::Index => OFF_FREE_INDEX,
            ArenaKind::Data => OFF_FREE_DATA,
        };
        base + class * 8
    }

    /// Head of a size-class free list (0 = empty).
    pub fn free_head(&self, kind: ArenaKind, class: usize) -> MbResult<u64> {
        debug_assert!(class < NUM_SIZE_CLASSES);
        Ok(self.region.load_u64(Self::free_head_off(kind, class))?)
    }

    /// Sets the head of a size-class free list.
    pub fn set_free_head(&self, kind: ArenaKind, class: usize, head: u64) -> MbResult<()> {
        debug_assert!(class < NUM_SIZE_CLASSES);
        Ok(self
            .region
            .store_u64(Self::free_head_off(kind, class), head)?)
    }

    /// Empties every free list of both arenas.
    ///
    /// Recovery abandons freed slots rather than trust list links that may
    /// reference slots resurrected by an undo; the next resource collection
    /// reclaims the leak.
    pub fn clear_free_lists(&self) -> MbResult<()> {
        for class in 0..NUM_SIZE_CLASSES {
            self.set_free_head(ArenaKind::Index, class, 0)?;
            self.set_free_head(ArenaKind::Data, class, 0)?;
        }
        self.set_pending_free(ArenaKind::Index, 0)?;
        self.set_pending_free(ArenaKind::Data, 0)?;
        Ok(())
    }

    /// Point-in-time copy of every reportable field.
    pub fn snapshot(&self) -> MbResult<HeaderSnapshot> {
        Ok(HeaderSnapshot {
            data_size: self.data_size()?,
            index_file_size: self.file_size(ArenaKind::Index)?,
            data_file_size: self.file_size(ArenaKind::Data)?,
            index_hwm: self.hwm(ArenaKind::Index)?,
            data_hwm: self.hwm(ArenaKind::Data)?,
            root_offset: self.root_offset()?,
            count: self.count()?,
            num_writer: self.num_writer()?,
            num_reader: self.num_reader()?,
            lf_counter: self.lf_begin()?,
            rc_generation: self.rc_generation()?,
            index_pending_free: self.pending_free(ArenaKind::Index)?,
            data_pending_free: self.pending_free(ArenaKind::Data)?,
            excep_status: self.excep_status().unwrap_or(ExceptionClass::None),
        })
    }
}

/// A copy of the header fields for diagnostics.
#[derive(Debug, Clone)]
pub struct HeaderSnapshot {
    /// Fixed value size option (0 = variable).
    pub data_size: u32,
    /// Index arena file size.
    pub index_file_size: u64,
    /// Data arena file size.
    pub data_file_size: u64,
    /// Index arena high-water mark.
    pub index_hwm: u64,
    /// Data arena high-water mark.
    pub data_hwm: u64,
    /// Root trie-node offset.
    pub root_offset: u64,
    /// Entry count.
    pub count: u64,
    /// Writer handle count.
    pub num_writer: u32,
    /// Reader handle count.
    pub num_reader: u32,
    /// Lock-free modification counter.
    pub lf_counter: u32,
    /// Resource-collection generation.
    pub rc_generation: u64,
    /// Index bytes freed since last collection.
    pub index_pending_free: u64,
    /// Data bytes freed since last collection.
    pub data_pending_free: u64,
    /// In-flight exception class.
    pub excep_status: ExceptionClass,
}

impl fmt::Display for HeaderSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "data size option:    {}", self.data_size)?;
        writeln!(f, "index file size:     {}", self.index_file_size)?;
        writeln!(f, "data file size:      {}", self.data_file_size)?;
        writeln!(f, "index high water:    {}", self.index_hwm)?;
        writeln!(f, "data high water:     {}", self.data_hwm)?;
        writeln!(f, "root offset:         {}", self.root_offset)?;
        writeln!(f, "entry count:         {}", self.count)?;
        writeln!(f, "writer handles:      {}", self.num_writer)?;
        writeln!(f, "reader handles:      {}", self.num_reader)?;
        writeln!(f, "lock-free counter:   {}", self.lf_counter)?;
        writeln!(f, "rc generation:       {}", self.rc_generation)?;
        writeln!(f, "index pending free:  {}", self.index_pending_free)?;
        writeln!(f, "data pending free:   {}", self.data_pending_free)?;
        writeln!(f, "exception status:    {:?}", self.excep_status)
    }
}

/// Table-driven CRC32 (IEEE polynomial).
pub fn crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFFu32;
    for &b in data {
        crc = (crc >> 8) ^ TABLE[((crc ^ b as u32) & 0xFF) as usize];
    }
    crc ^ 0xFFFF_FFFF
}
