//! Substrate memory layout constants.
//!
//! Every party attaching to the shared buffer — kernel, modules, observers —
//! compiles against these offsets, so they are normative: a module built
//! against one implementation must be servable by another.

use crate::error::{Error, Result};

/// Total substrate size configurations
pub const SUBSTRATE_SIZE_DEFAULT: usize = 16 * 1024 * 1024; // 16MB
pub const SUBSTRATE_SIZE_MIN: usize = 2 * 1024 * 1024; // 2MB
pub const SUBSTRATE_SIZE_MAX: usize = 2 * 1024 * 1024 * 1024; // 2GB

// ========== SYSTEM REGIONS (0x000000 - 0x150000) ==========
// Static layout for core kernel operations

/// Flag Table (32 x i32 used, rest of the 256 bytes reserved)
pub const OFFSET_FLAG_TABLE: usize = 0x000000;
pub const SIZE_FLAG_TABLE: usize = 0x000100;
pub const FLAG_COUNT: usize = 32;

/// Module Registry (64 entries x 96 bytes)
pub const OFFSET_MODULE_REGISTRY: usize = 0x000100;
pub const SIZE_MODULE_REGISTRY: usize = 0x001800;
pub const MODULE_ENTRY_SIZE: usize = 96;
pub const MAX_MODULES_INLINE: usize = 64;

/// Pattern Exchange (reserved, not operated on by this core)
pub const OFFSET_PATTERN_EXCHANGE: usize = 0x001900;
pub const SIZE_PATTERN_EXCHANGE: usize = 0x000700;

/// Coordination / Knowledge Graph (64-byte nodes)
pub const OFFSET_COORDINATION: usize = 0x002000;
pub const SIZE_COORDINATION: usize = 0x002000;
pub const KG_NODE_SIZE: usize = 64;

/// Identity Registry (128-byte DID records)
pub const OFFSET_IDENTITY_REGISTRY: usize = 0x004000;
pub const SIZE_IDENTITY_REGISTRY: usize = 0x00C000;
pub const IDENTITY_ENTRY_SIZE: usize = 128;
pub const MAX_IDENTITIES: usize = SIZE_IDENTITY_REGISTRY / IDENTITY_ENTRY_SIZE;

/// Social Graph (16-byte header + 144-byte append-only edges)
pub const OFFSET_SOCIAL_GRAPH: usize = 0x010000;
pub const SIZE_SOCIAL_GRAPH: usize = 0x010000;
pub const SOCIAL_HEADER_SIZE: usize = 16;
pub const SOCIAL_EDGE_SIZE: usize = 144;
pub const MAX_SOCIAL_EDGES: usize = (SIZE_SOCIAL_GRAPH - SOCIAL_HEADER_SIZE) / SOCIAL_EDGE_SIZE;

/// Economics Ledger: account slots then the settlement journal ring
pub const OFFSET_ECONOMICS: usize = 0x020000;
pub const SIZE_ECONOMICS: usize = 0x010000;
pub const OFFSET_ECONOMY_ACCOUNTS: usize = OFFSET_ECONOMICS;
pub const SIZE_ECONOMY_ACCOUNTS: usize = 0x008000;
pub const ECONOMY_ACCOUNT_SIZE: usize = 64;
pub const MAX_ECONOMY_ACCOUNTS: usize = SIZE_ECONOMY_ACCOUNTS / ECONOMY_ACCOUNT_SIZE;
pub const OFFSET_ECONOMY_JOURNAL: usize = OFFSET_ECONOMICS + SIZE_ECONOMY_ACCOUNTS;
pub const SIZE_ECONOMY_JOURNAL: usize = 0x008000;
pub const JOURNAL_HEADER_SIZE: usize = 16;
pub const JOURNAL_RECORD_SIZE: usize = 64;
pub const MAX_JOURNAL_RECORDS: usize = (SIZE_ECONOMY_JOURNAL - JOURNAL_HEADER_SIZE) / JOURNAL_RECORD_SIZE;

/// Inbox / Outbox rings: one slot per module registry slot
pub const OFFSET_INBOX_RINGS: usize = 0x030000;
pub const SIZE_INBOX_RINGS: usize = 0x010000;
pub const OFFSET_OUTBOX_RINGS: usize = 0x040000;
pub const SIZE_OUTBOX_RINGS: usize = 0x010000;
pub const RING_SLOT_SIZE: usize = 1024;
pub const RING_HEADER_SIZE: usize = 16;
pub const RING_DATA_CAPACITY: usize = RING_SLOT_SIZE - RING_HEADER_SIZE;

/// Job History / Diagnostics (kernel metrics snapshots)
pub const OFFSET_JOB_HISTORY: usize = 0x050000;
pub const SIZE_JOB_HISTORY: usize = 0x100000;
pub const METRICS_RECORD_SIZE: usize = 64;

// ========== ARENA (0x150000 - end) ==========
// Payload slab: capability tables, chunk staging, bump allocations.

pub const ARENA_BASE: usize = 0x150000;

// ========== FLAG TABLE INDEX ALLOCATION ==========

pub const IDX_SYSTEM_EPOCH: u32 = 0;
pub const IDX_REGISTRY_EPOCH: u32 = 1;
/// Sole waker for the kernel signal listener.
pub const IDX_OUTBOX_DIRTY: u32 = 2;
pub const IDX_ECONOMY_EPOCH: u32 = 3;
pub const IDX_PATTERN_EPOCH: u32 = 4;
pub const IDX_MATRIX_EPOCH: u32 = 5;
pub const IDX_METRICS_EPOCH: u32 = 6;
pub const IDX_KERNEL_READY: u32 = 7;
pub const IDX_PANIC_STATE: u32 = 8;
/// Arena bump pointer (bytes used past ARENA_BASE)
pub const IDX_ARENA_CURSOR: u32 = 9;
/// Holds `SUBSTRATE_MAGIC`; a mismatch condemns the substrate.
pub const IDX_SUBSTRATE_MAGIC: u32 = 15;

/// Per-module ingress wakers, banked: bank = module_slot % INBOX_DIRTY_BANKS.
/// Spurious wakes are part of the wait contract; a woken module re-reads its
/// own ring.
pub const IDX_INBOX_DIRTY_BASE: u32 = 16;
pub const INBOX_DIRTY_BANKS: u32 = 16;

/// "INOS" little-endian, stored in the flag table at IDX_SUBSTRATE_MAGIC.
pub const SUBSTRATE_MAGIC: i32 = 0x494E4F53;

/// Flag index waking a module parked on its inbox.
pub const fn inbox_dirty_index(module_slot: u16) -> u32 {
    IDX_INBOX_DIRTY_BASE + (module_slot as u32 % INBOX_DIRTY_BANKS)
}

// ========== ALIGNMENT ==========

pub const ALIGNMENT_WORD: usize = 4;
pub const ALIGNMENT_SLOT: usize = 8;
pub const ALIGNMENT_CACHE_LINE: usize = 64;

/// Align offset up to the given power-of-two alignment.
pub const fn align_offset(offset: usize, alignment: usize) -> usize {
    (offset + alignment - 1) & !(alignment - 1)
}

/// Validated layout over a configured buffer.
///
/// The region offsets are compile-time constants; `Layout` pins them to a
/// concrete buffer size and base offset so a host can place the substrate
/// inside a larger shared buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    /// Offset of the substrate inside the host buffer.
    pub base_offset: usize,
    /// Substrate size in bytes (flag table through arena end).
    pub size: usize,
}

impl Layout {
    pub fn new(size: usize) -> Result<Self> {
        Self::with_base(0, size)
    }

    pub fn with_base(base_offset: usize, size: usize) -> Result<Self> {
        let layout = Self { base_offset, size };
        layout.validate()?;
        Ok(layout)
    }

    /// Asserts region alignment, ordering and fit. Regions are fixed at
    /// compile time, so most of this is belt-and-braces against constant
    /// edits; the size checks are the live ones.
    fn validate(&self) -> Result<()> {
        if self.size < SUBSTRATE_SIZE_MIN {
            return Err(Error::LayoutInvalid(format!(
                "substrate size {} below minimum {}",
                self.size, SUBSTRATE_SIZE_MIN
            )));
        }
        if self.size > SUBSTRATE_SIZE_MAX {
            return Err(Error::LayoutInvalid(format!(
                "substrate size {} above maximum {}",
                self.size, SUBSTRATE_SIZE_MAX
            )));
        }
        if self.base_offset % ALIGNMENT_SLOT != 0 {
            return Err(Error::LayoutInvalid(format!(
                "base offset {} is not 8-byte aligned",
                self.base_offset
            )));
        }
        if self.size % ALIGNMENT_SLOT != 0 {
            return Err(Error::LayoutInvalid(format!(
                "substrate size {} is not 8-byte aligned",
                self.size
            )));
        }

        // Region table: (name, offset, size). Must be 8-byte aligned,
        // non-overlapping and in ascending order.
        let regions: &[(&str, usize, usize)] = &[
            ("flag_table", OFFSET_FLAG_TABLE, SIZE_FLAG_TABLE),
            ("module_registry", OFFSET_MODULE_REGISTRY, SIZE_MODULE_REGISTRY),
            ("pattern_exchange", OFFSET_PATTERN_EXCHANGE, SIZE_PATTERN_EXCHANGE),
            ("coordination", OFFSET_COORDINATION, SIZE_COORDINATION),
            ("identity_registry", OFFSET_IDENTITY_REGISTRY, SIZE_IDENTITY_REGISTRY),
            ("social_graph", OFFSET_SOCIAL_GRAPH, SIZE_SOCIAL_GRAPH),
            ("economics", OFFSET_ECONOMICS, SIZE_ECONOMICS),
            ("inbox_rings", OFFSET_INBOX_RINGS, SIZE_INBOX_RINGS),
            ("outbox_rings", OFFSET_OUTBOX_RINGS, SIZE_OUTBOX_RINGS),
            ("job_history", OFFSET_JOB_HISTORY, SIZE_JOB_HISTORY),
        ];

        let mut cursor = 0usize;
        for &(name, offset, size) in regions {
            if offset % ALIGNMENT_SLOT != 0 {
                return Err(Error::LayoutInvalid(format!(
                    "region {} offset {:#x} is not 8-byte aligned",
                    name, offset
                )));
            }
            if offset < cursor {
                return Err(Error::LayoutInvalid(format!(
                    "region {} at {:#x} overlaps the previous region ending at {:#x}",
                    name, offset, cursor
                )));
            }
            cursor = offset + size;
        }
        if cursor > ARENA_BASE {
            return Err(Error::LayoutInvalid(format!(
                "system regions end at {:#x}, past the arena base {:#x}",
                cursor, ARENA_BASE
            )));
        }
        if ARENA_BASE >= self.size {
            return Err(Error::LayoutInvalid(format!(
                "substrate size {:#x} leaves no arena past {:#x}",
                self.size, ARENA_BASE
            )));
        }
        Ok(())
    }

    /// Bytes available for bump allocation past the arena base.
    pub const fn arena_size(&self) -> usize {
        self.size - ARENA_BASE
    }

    /// Region name for an offset, for diagnostics.
    pub fn region_name(offset: usize) -> &'static str {
        match offset {
            o if o < OFFSET_MODULE_REGISTRY => "FlagTable",
            o if o < OFFSET_PATTERN_EXCHANGE => "ModuleRegistry",
            o if o < OFFSET_COORDINATION => "PatternExchange",
            o if o < OFFSET_IDENTITY_REGISTRY => "Coordination",
            o if o < OFFSET_SOCIAL_GRAPH => "IdentityRegistry",
            o if o < OFFSET_ECONOMICS => "SocialGraph",
            o if o < OFFSET_INBOX_RINGS => "Economics",
            o if o < OFFSET_OUTBOX_RINGS => "InboxRings",
            o if o < OFFSET_JOB_HISTORY => "OutboxRings",
            o if o < ARENA_BASE => "JobHistory",
            _ => "Arena",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_region_overlaps() {
        const { assert!(OFFSET_MODULE_REGISTRY >= OFFSET_FLAG_TABLE + SIZE_FLAG_TABLE) };
        const { assert!(OFFSET_PATTERN_EXCHANGE >= OFFSET_MODULE_REGISTRY + SIZE_MODULE_REGISTRY) };
        const { assert!(OFFSET_COORDINATION >= OFFSET_PATTERN_EXCHANGE + SIZE_PATTERN_EXCHANGE) };
        const { assert!(OFFSET_IDENTITY_REGISTRY >= OFFSET_COORDINATION + SIZE_COORDINATION) };
        const { assert!(OFFSET_SOCIAL_GRAPH >= OFFSET_IDENTITY_REGISTRY + SIZE_IDENTITY_REGISTRY) };
        const { assert!(OFFSET_ECONOMICS >= OFFSET_SOCIAL_GRAPH + SIZE_SOCIAL_GRAPH) };
        const { assert!(OFFSET_INBOX_RINGS >= OFFSET_ECONOMICS + SIZE_ECONOMICS) };
        const { assert!(OFFSET_OUTBOX_RINGS >= OFFSET_INBOX_RINGS + SIZE_INBOX_RINGS) };
        const { assert!(OFFSET_JOB_HISTORY >= OFFSET_OUTBOX_RINGS + SIZE_OUTBOX_RINGS) };
        const { assert!(ARENA_BASE >= OFFSET_JOB_HISTORY + SIZE_JOB_HISTORY) };
    }

    #[test]
    fn test_registry_region_holds_all_slots() {
        const { assert!(SIZE_MODULE_REGISTRY >= MAX_MODULES_INLINE * MODULE_ENTRY_SIZE) };
    }

    #[test]
    fn test_ring_regions_hold_all_slots() {
        const { assert!(SIZE_INBOX_RINGS >= MAX_MODULES_INLINE * RING_SLOT_SIZE) };
        const { assert!(SIZE_OUTBOX_RINGS >= MAX_MODULES_INLINE * RING_SLOT_SIZE) };
    }

    #[test]
    fn test_alignment() {
        assert_eq!(align_offset(0, 64), 0);
        assert_eq!(align_offset(1, 64), 64);
        assert_eq!(align_offset(63, 64), 64);
        assert_eq!(align_offset(64, 64), 64);
        assert_eq!(align_offset(65, 64), 128);
    }

    #[test]
    fn test_layout_validation() {
        assert!(Layout::new(SUBSTRATE_SIZE_DEFAULT).is_ok());
        assert!(Layout::new(SUBSTRATE_SIZE_MIN).is_ok());
        assert!(matches!(
            Layout::new(1024),
            Err(Error::LayoutInvalid(_))
        ));
        assert!(matches!(
            Layout::new(SUBSTRATE_SIZE_MAX + 8),
            Err(Error::LayoutInvalid(_))
        ));
        assert!(matches!(
            Layout::with_base(3, SUBSTRATE_SIZE_DEFAULT),
            Err(Error::LayoutInvalid(_))
        ));
    }

    #[test]
    fn test_arena_size() {
        let layout = Layout::new(SUBSTRATE_SIZE_DEFAULT).unwrap();
        assert_eq!(layout.arena_size(), SUBSTRATE_SIZE_DEFAULT - ARENA_BASE);
    }

    #[test]
    fn test_region_names() {
        assert_eq!(Layout::region_name(0x000000), "FlagTable");
        assert_eq!(Layout::region_name(0x000100), "ModuleRegistry");
        assert_eq!(Layout::region_name(0x004000), "IdentityRegistry");
        assert_eq!(Layout::region_name(0x030000), "InboxRings");
        assert_eq!(Layout::region_name(0x150000), "Arena");
    }

    #[test]
    fn test_inbox_dirty_banking() {
        assert_eq!(inbox_dirty_index(0), 16);
        assert_eq!(inbox_dirty_index(15), 31);
        assert_eq!(inbox_dirty_index(16), 16);
        assert_eq!(inbox_dirty_index(63), 31);
    }
}
