//! The SAB bridge: sole owner of all unsafe access to the substrate.
//!
//! Everything else in the workspace sees the shared buffer through this
//! handle. Flag-table traffic goes through ordered atomics; bulk traffic goes
//! through bounds-checked raw copies bracketed by fences, mirroring the
//! acquire/release barrier discipline the rings and registry rely on.

use std::sync::atomic::{fence, AtomicI32, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::layout::{
    Layout, ALIGNMENT_WORD, ARENA_BASE, FLAG_COUNT, IDX_SUBSTRATE_MAGIC, OFFSET_FLAG_TABLE,
    SUBSTRATE_MAGIC,
};

/// Outcome of a blocking epoch wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The counter moved; carries the freshly read value.
    Changed(i32),
    TimedOut,
}

/// Bridge-level counters, written into the job-history region by the kernel
/// metrics loop.
#[derive(Default)]
pub struct BridgeMetrics {
    pub raw_reads: AtomicU64,
    pub raw_writes: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub frames_pushed: AtomicU64,
    pub frames_popped: AtomicU64,
    pub epoch_waits: AtomicU64,
    pub epoch_wakes: AtomicU64,
    pub backpressure_events: AtomicU64,
}

/// Point-in-time copy of the bridge counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub raw_reads: u64,
    pub raw_writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub frames_pushed: u64,
    pub frames_popped: u64,
    pub epoch_waits: u64,
    pub epoch_wakes: u64,
    pub backpressure_events: u64,
}

pub const METRICS_RECORD_MAGIC: u64 = u64::from_le_bytes(*b"INOSMETR");

impl MetricsSnapshot {
    /// Fixed 64-byte little-endian record for the job-history region.
    pub fn encode_record(&self, system_epoch: i32) -> [u8; 64] {
        let mut rec = [0u8; 64];
        rec[0..8].copy_from_slice(&METRICS_RECORD_MAGIC.to_le_bytes());
        rec[8..16].copy_from_slice(&(system_epoch as i64).to_le_bytes());
        rec[16..24].copy_from_slice(&self.bytes_read.to_le_bytes());
        rec[24..32].copy_from_slice(&self.bytes_written.to_le_bytes());
        rec[32..40].copy_from_slice(&self.frames_pushed.to_le_bytes());
        rec[40..48].copy_from_slice(&self.frames_popped.to_le_bytes());
        rec[48..56].copy_from_slice(&self.epoch_waits.to_le_bytes());
        rec[56..64].copy_from_slice(&self.backpressure_events.to_le_bytes());
        rec
    }
}

impl BridgeMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            raw_reads: self.raw_reads.load(Ordering::Relaxed),
            raw_writes: self.raw_writes.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            frames_pushed: self.frames_pushed.load(Ordering::Relaxed),
            frames_popped: self.frames_popped.load(Ordering::Relaxed),
            epoch_waits: self.epoch_waits.load(Ordering::Relaxed),
            epoch_wakes: self.epoch_wakes.load(Ordering::Relaxed),
            backpressure_events: self.backpressure_events.load(Ordering::Relaxed),
        }
    }
}

/// Backing memory: either owned by this process (host-created substrate) or a
/// raw mapping handed over by the host runtime.
struct Memory {
    ptr: *mut u8,
    len: usize,
    /// Keeps owned allocations alive; `u64` words guarantee 8-byte alignment.
    _owned: Option<Box<[u64]>>,
}

pub(crate) struct BridgeInner {
    mem: Memory,
    layout: Layout,
    /// In-process epoch wakers, one per flag slot. Cross-process changes are
    /// picked up by the short poll in the wait loops.
    notify: Vec<Notify>,
    metrics: BridgeMetrics,
    /// Round-robin position for `outbox_read_one`.
    pub(crate) scan_pos: AtomicUsize,
}

// SAFETY: the buffer is designed to be shared across threads and processes.
// All cross-party access is mediated by atomic operations on the flag table
// and ring cursors, and raw copies are bracketed by fences; the pointer
// itself is never reallocated for the life of the bridge.
unsafe impl Send for BridgeInner {}
unsafe impl Sync for BridgeInner {}

/// Cheaply clonable handle to the substrate.
#[derive(Clone)]
pub struct SabBridge {
    pub(crate) inner: Arc<BridgeInner>,
}

/// Poll interval backing the futex-style waits where no in-process notify
/// fires (e.g. the producer lives in another worker).
const WAIT_POLL: Duration = Duration::from_millis(1);

impl SabBridge {
    /// Create a substrate owned by this process and initialize its flag table.
    pub fn create_owned(size: usize) -> Result<Self> {
        let layout = Layout::new(size)?;
        let words = vec![0u64; size / 8].into_boxed_slice();
        let mut owned = words;
        let ptr = owned.as_mut_ptr() as *mut u8;
        let bridge = Self::build(
            Memory {
                ptr,
                len: size,
                _owned: Some(owned),
            },
            layout,
        );
        bridge.flag(IDX_SUBSTRATE_MAGIC).store(SUBSTRATE_MAGIC, Ordering::Release);
        Ok(bridge)
    }

    /// Attach to a substrate created elsewhere.
    ///
    /// # Safety
    /// `ptr..ptr+len` must be a live mapping for the life of the bridge, and
    /// `base_offset..base_offset+layout.size` must lie within it. The region
    /// must only ever be accessed through `SabBridge` handles (or foreign
    /// parties honoring the same protocol).
    pub unsafe fn attach_raw(ptr: *mut u8, len: usize, base_offset: usize, size: usize) -> Result<Self> {
        let layout = Layout::with_base(base_offset, size)?;
        if base_offset + size > len {
            return Err(Error::LayoutInvalid(format!(
                "substrate {}+{} exceeds mapping of {} bytes",
                base_offset, size, len
            )));
        }
        if ptr.align_offset(8) != 0 {
            return Err(Error::LayoutInvalid("mapping is not 8-byte aligned".into()));
        }
        Ok(Self::build(
            Memory {
                ptr,
                len,
                _owned: None,
            },
            layout,
        ))
    }

    fn build(mem: Memory, layout: Layout) -> Self {
        let notify = (0..FLAG_COUNT).map(|_| Notify::new()).collect();
        Self {
            inner: Arc::new(BridgeInner {
                mem,
                layout,
                notify,
                metrics: BridgeMetrics::default(),
                scan_pos: AtomicUsize::new(0),
            }),
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.inner.layout
    }

    pub fn size(&self) -> usize {
        self.inner.layout.size
    }

    pub fn metrics(&self) -> &BridgeMetrics {
        &self.inner.metrics
    }

    /// Absolute pointer for a substrate-relative offset. Callers must have
    /// bounds-checked already.
    #[inline]
    fn abs_ptr(&self, offset: usize) -> *mut u8 {
        // SAFETY: callers validate offset < layout.size; base_offset + size
        // was checked against the mapping at construction.
        unsafe { self.inner.mem.ptr.add(self.inner.layout.base_offset + offset) }
    }

    #[inline]
    fn bounds_check(&self, offset: usize, len: usize) -> Result<()> {
        let end = offset.checked_add(len).ok_or(Error::OutOfBounds {
            offset: offset as u64,
            size: len as u64,
            limit: self.inner.layout.size as u64,
        })?;
        if end > self.inner.layout.size {
            return Err(Error::OutOfBounds {
                offset: offset as u64,
                size: len as u64,
                limit: self.inner.layout.size as u64,
            });
        }
        Ok(())
    }

    // ========== FLAG TABLE ATOMICS ==========

    pub(crate) fn flag(&self, index: u32) -> &AtomicI32 {
        assert!((index as usize) < FLAG_COUNT, "flag index out of range");
        let off = OFFSET_FLAG_TABLE + index as usize * 4;
        // SAFETY: within the flag table, 4-byte aligned, only ever accessed
        // atomically.
        unsafe { AtomicI32::from_ptr(self.abs_ptr(off) as *mut i32) }
    }

    /// Word-sized atomic anywhere in the substrate (ring cursors, region
    /// headers). `offset` must be 4-byte aligned and in bounds.
    pub fn atomic_u32_at(&self, offset: usize) -> &AtomicU32 {
        assert_eq!(offset % ALIGNMENT_WORD, 0, "unaligned atomic word");
        assert!(offset + 4 <= self.inner.layout.size, "atomic word out of bounds");
        // SAFETY: alignment and bounds asserted; cross-party access to these
        // words is atomic by protocol.
        unsafe { AtomicU32::from_ptr(self.abs_ptr(offset) as *mut u32) }
    }

    /// Byte-sized atomic anywhere in the substrate (publish flags). `offset`
    /// must be in bounds.
    pub fn atomic_u8_at(&self, offset: usize) -> &AtomicU8 {
        assert!(offset < self.inner.layout.size, "atomic byte out of bounds");
        // SAFETY: bounds asserted; byte atomics carry no alignment demands.
        unsafe { AtomicU8::from_ptr(self.abs_ptr(offset)) }
    }

    pub fn read_atomic_i32(&self, index: u32) -> i32 {
        self.flag(index).load(Ordering::Acquire)
    }

    /// Returns the new value.
    pub fn add_atomic_i32(&self, index: u32, delta: i32) -> i32 {
        self.flag(index).fetch_add(delta, Ordering::AcqRel) + delta
    }

    /// Returns the previously stored value (the CAS succeeded iff it equals
    /// `expected`).
    pub fn cas_i32(&self, index: u32, expected: i32, new: i32) -> i32 {
        match self
            .flag(index)
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(prev) => prev,
            Err(prev) => prev,
        }
    }

    /// Increment an epoch counter and wake its waiters. Returns the new value.
    pub fn bump_epoch(&self, index: u32) -> i32 {
        let new = self.add_atomic_i32(index, 1);
        self.inner.metrics.epoch_wakes.fetch_add(1, Ordering::Relaxed);
        self.inner.notify[index as usize].notify_waiters();
        new
    }

    /// Stamp the substrate magic into a fresh (all-zero) flag table. A buffer
    /// already carrying the magic is left alone; anything else is corrupt.
    pub fn ensure_magic(&self) -> Result<()> {
        let prev = self.cas_i32(IDX_SUBSTRATE_MAGIC, 0, SUBSTRATE_MAGIC);
        if prev == 0 || prev == SUBSTRATE_MAGIC {
            return Ok(());
        }
        self.check_magic()
    }

    /// Validate the substrate magic in the flag table. A mismatch means the
    /// mapping was torn down or scribbled over and the substrate is condemned.
    pub fn check_magic(&self) -> Result<()> {
        let found = self.read_atomic_i32(IDX_SUBSTRATE_MAGIC);
        if found != SUBSTRATE_MAGIC {
            return Err(Error::SubstrateCorrupt(format!(
                "flag table magic {:#010x}, expected {:#010x}",
                found, SUBSTRATE_MAGIC
            )));
        }
        Ok(())
    }

    // ========== EPOCH WAITS ==========

    /// Blocking futex-style wait: parks until `flags[index] != last` or the
    /// timeout elapses. Spurious wakes are allowed; callers re-read.
    pub fn wait_for_epoch_change(&self, index: u32, last: i32, timeout_ms: u64) -> WaitOutcome {
        self.inner.metrics.epoch_waits.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let current = self.read_atomic_i32(index);
            if current != last {
                return WaitOutcome::Changed(current);
            }
            if Instant::now() >= deadline {
                return WaitOutcome::TimedOut;
            }
            // Short spin before parking; most changes land within a few
            // hundred nanoseconds of the signal.
            for _ in 0..64 {
                std::hint::spin_loop();
            }
            if self.read_atomic_i32(index) != last {
                continue;
            }
            std::thread::sleep(WAIT_POLL.min(deadline.saturating_duration_since(Instant::now())));
        }
    }

    /// Cooperative wait: resolves once `flags[index] != last`, returning the
    /// freshly read value. In-process bumps wake immediately through the
    /// notifier; foreign writers are covered by the poll tick.
    pub async fn wait_for_epoch_async(&self, index: u32, last: i32) -> i32 {
        self.inner.metrics.epoch_waits.fetch_add(1, Ordering::Relaxed);
        let notify = &self.inner.notify[index as usize];
        loop {
            let notified = notify.notified();
            let current = self.read_atomic_i32(index);
            if current != last {
                return current;
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(WAIT_POLL) => {}
            }
        }
    }

    // ========== RAW ACCESS ==========

    pub fn read_raw(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_raw_into(offset, &mut buf)?;
        Ok(buf)
    }

    pub fn read_raw_into(&self, offset: usize, dest: &mut [u8]) -> Result<()> {
        self.bounds_check(offset, dest.len())?;
        fence(Ordering::Acquire);
        // SAFETY: bounds checked above; the fence pairs with the writer's
        // release fence so published bytes are visible.
        unsafe {
            std::ptr::copy_nonoverlapping(self.abs_ptr(offset), dest.as_mut_ptr(), dest.len());
        }
        self.inner.metrics.raw_reads.fetch_add(1, Ordering::Relaxed);
        self.inner
            .metrics
            .bytes_read
            .fetch_add(dest.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    pub fn write_raw(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.bounds_check(offset, data.len())?;
        // SAFETY: bounds checked above; the release fence publishes the bytes
        // before any subsequent epoch bump.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.abs_ptr(offset), data.len());
        }
        fence(Ordering::Release);
        self.inner.metrics.raw_writes.fetch_add(1, Ordering::Relaxed);
        self.inner
            .metrics
            .bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Validate a caller-nominated arena reference before any raw access.
    ///
    /// Accepts only word-aligned ranges lying entirely inside the arena.
    pub fn validate_arena_offset(&self, offset: u64, size: u64) -> Result<()> {
        if offset % ALIGNMENT_WORD as u64 != 0 {
            return Err(Error::Misaligned {
                offset,
                align: ALIGNMENT_WORD as u64,
            });
        }
        if offset < ARENA_BASE as u64 {
            return Err(Error::NonArena {
                offset,
                arena_base: ARENA_BASE as u64,
            });
        }
        let limit = self.inner.layout.size as u64;
        if offset.checked_add(size).map_or(true, |end| end > limit) {
            return Err(Error::OutOfBounds {
                offset,
                size,
                limit,
            });
        }
        Ok(())
    }
}
