//! Arena bump allocator.
//!
//! The slab past `ARENA_BASE` is handed out in aligned chunks by a wait-free
//! `fetch_add` on the cursor flag. There is no free; a region lives as long
//! as the substrate (capability tables) or until its owner stops caring
//! (chunk staging). Allocation failure cannot roll the cursor back, it just
//! reports exhaustion.

use crate::bridge::SabBridge;
use crate::error::{Error, Result};
use crate::layout::{align_offset, ALIGNMENT_SLOT, ARENA_BASE, IDX_ARENA_CURSOR};

/// Allocate `size` bytes in the arena, 8-byte aligned. Returns the absolute
/// substrate offset of the allocation.
pub fn alloc(bridge: &SabBridge, size: usize) -> Result<u64> {
    if size == 0 {
        return Err(Error::InvalidParams("zero-byte arena allocation".into()));
    }
    let aligned = align_offset(size, ALIGNMENT_SLOT);
    let arena_size = bridge.layout().arena_size();

    let old = bridge.add_atomic_i32(IDX_ARENA_CURSOR, aligned as i32) - aligned as i32;
    let old = old as u32 as usize;
    if old + aligned > arena_size {
        return Err(Error::ArenaExhausted {
            requested: aligned as u64,
            available: arena_size.saturating_sub(old) as u64,
        });
    }
    Ok((ARENA_BASE + old) as u64)
}

/// Bytes currently bump-allocated past the arena base.
pub fn used(bridge: &SabBridge) -> usize {
    bridge.read_atomic_i32(IDX_ARENA_CURSOR).max(0) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::SUBSTRATE_SIZE_MIN;

    #[test]
    fn test_alloc_is_aligned_and_monotonic() {
        let b = SabBridge::create_owned(SUBSTRATE_SIZE_MIN).unwrap();
        let a = alloc(&b, 5).unwrap();
        let c = alloc(&b, 64).unwrap();
        assert_eq!(a, ARENA_BASE as u64);
        assert_eq!(c, ARENA_BASE as u64 + 8);
        assert_eq!(used(&b), 8 + 64);
        assert_eq!(a % ALIGNMENT_SLOT as u64, 0);
        assert_eq!(c % ALIGNMENT_SLOT as u64, 0);
    }

    #[test]
    fn test_allocations_validate_as_arena_refs() {
        let b = SabBridge::create_owned(SUBSTRATE_SIZE_MIN).unwrap();
        let off = alloc(&b, 4096).unwrap();
        assert!(b.validate_arena_offset(off, 4096).is_ok());
    }

    #[test]
    fn test_exhaustion() {
        let b = SabBridge::create_owned(SUBSTRATE_SIZE_MIN).unwrap();
        let arena = b.layout().arena_size();
        alloc(&b, arena - 16).unwrap();
        assert!(matches!(
            alloc(&b, 64),
            Err(Error::ArenaExhausted { .. })
        ));
    }

    #[test]
    fn test_zero_alloc_rejected() {
        let b = SabBridge::create_owned(SUBSTRATE_SIZE_MIN).unwrap();
        assert!(alloc(&b, 0).is_err());
    }
}
