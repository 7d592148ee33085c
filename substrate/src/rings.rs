//! Inbox/outbox ring transport.
//!
//! Each registered module owns one inbox slot (kernel -> module) and one
//! outbox slot (module -> kernel). A slot is a tiny ring:
//!
//! ```text
//! [ tail u32 ][ ack u32 ][ seq u32 ][ reserved u32 ]  then 1008 data bytes
//! ```
//!
//! `tail` and `ack` are monotonic byte cursors (positions are taken modulo
//! the data capacity), so `tail - ack` is exactly the unconsumed span and a
//! completely full ring is unambiguous. Frames are:
//!
//! ```text
//! [ len u32 ][ seq u32 ][ kind u16 ][ flags u16 ][ len payload bytes ]
//! ```
//!
//! Producers reserve space with a single CAS on `tail`, write the frame body,
//! and commit by storing the length word last (release). Consumers treat a
//! zero length word as not-yet-committed, drain frames in order, zero the
//! length word behind them and publish `ack`. An unacked frame is never
//! overwritten; the producer gets `BackPressure` instead.

use std::sync::atomic::Ordering;

use rand::Rng;

use crate::bridge::SabBridge;
use crate::error::{Error, Result};
use crate::layout::{
    inbox_dirty_index, IDX_OUTBOX_DIRTY, MAX_MODULES_INLINE, OFFSET_INBOX_RINGS,
    OFFSET_OUTBOX_RINGS, RING_DATA_CAPACITY, RING_HEADER_SIZE, RING_SLOT_SIZE,
};

pub const FRAME_HEADER_SIZE: usize = 12;
/// Largest payload a single frame can carry. Bulk payloads go through the
/// arena as `sabRef` resources instead.
pub const MAX_FRAME_PAYLOAD: usize = RING_DATA_CAPACITY - FRAME_HEADER_SIZE;

/// Frame kinds carried in the `kind` field.
pub const FRAME_KIND_SYSCALL_REQUEST: u16 = 1;
pub const FRAME_KIND_SYSCALL_RESPONSE: u16 = 2;
pub const FRAME_KIND_JOB_RESULT: u16 = 3;

/// Bounded CAS retries on a contended write cursor before giving up.
const MAX_RESERVE_RETRIES: u32 = 16;

/// A frame drained from a ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub seq: u32,
    pub kind: u16,
    pub flags: u16,
    pub payload: Vec<u8>,
}

const TAIL: usize = 0;
const ACK: usize = 4;
const SEQ: usize = 8;

#[inline]
const fn padded(frame_bytes: usize) -> usize {
    (frame_bytes + 3) & !3
}

impl SabBridge {
    #[inline]
    fn ring_base(region: usize, slot: u16) -> usize {
        region + slot as usize * RING_SLOT_SIZE
    }

    fn check_slot(slot: u16) -> Result<()> {
        if slot as usize >= MAX_MODULES_INLINE {
            return Err(Error::InvalidParams(format!(
                "ring slot {} out of range",
                slot
            )));
        }
        Ok(())
    }

    // ---- two-chunk data copies (positions wrap modulo the data capacity) ----

    fn ring_data_write(&self, base: usize, pos: usize, data: &[u8]) -> Result<()> {
        let data_base = base + RING_HEADER_SIZE;
        let first = data.len().min(RING_DATA_CAPACITY - pos);
        self.write_raw(data_base + pos, &data[..first])?;
        if first < data.len() {
            self.write_raw(data_base, &data[first..])?;
        }
        Ok(())
    }

    fn ring_data_read(&self, base: usize, pos: usize, dest: &mut [u8]) -> Result<()> {
        let data_base = base + RING_HEADER_SIZE;
        let first = dest.len().min(RING_DATA_CAPACITY - pos);
        let len = dest.len();
        self.read_raw_into(data_base + pos, &mut dest[..first])?;
        if first < len {
            let mut rest = vec![0u8; len - first];
            self.read_raw_into(data_base, &mut rest)?;
            dest[first..].copy_from_slice(&rest);
        }
        Ok(())
    }

    /// Reserve `need` bytes in the ring with a single CAS on the tail cursor.
    /// Returns the monotonic start cursor of the reservation.
    fn ring_reserve(&self, base: usize, slot: u16, need: usize) -> Result<u32> {
        let tail_word = self.atomic_u32_at(base + TAIL);
        let ack_word = self.atomic_u32_at(base + ACK);
        let mut rng = rand::thread_rng();

        for attempt in 0..MAX_RESERVE_RETRIES {
            let tail = tail_word.load(Ordering::Acquire);
            let ack = ack_word.load(Ordering::Acquire);
            let used = tail.wrapping_sub(ack) as usize;
            if RING_DATA_CAPACITY.saturating_sub(used) < need {
                // The oldest frame has not been acked; overwriting it is
                // forbidden, so this is immediate backpressure.
                self.metrics()
                    .backpressure_events
                    .fetch_add(1, Ordering::Relaxed);
                return Err(Error::BackPressure(slot));
            }
            let new_tail = tail.wrapping_add(need as u32);
            if tail_word
                .compare_exchange(tail, new_tail, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(tail);
            }
            // Another producer moved the cursor; back off briefly.
            let spins = (1u32 << attempt.min(6)) + rng.gen_range(0..8);
            for _ in 0..spins {
                std::hint::spin_loop();
            }
        }
        self.metrics()
            .backpressure_events
            .fetch_add(1, Ordering::Relaxed);
        Err(Error::BackPressure(slot))
    }

    fn ring_push(&self, base: usize, slot: u16, kind: u16, flags: u16, payload: &[u8]) -> Result<u32> {
        if payload.is_empty() {
            // A zero length word is the not-yet-committed marker.
            return Err(Error::InvalidParams("empty ring frame".into()));
        }
        if payload.len() > MAX_FRAME_PAYLOAD {
            return Err(Error::InvalidParams(format!(
                "frame payload of {} bytes exceeds ring capacity {}; use a sabRef",
                payload.len(),
                MAX_FRAME_PAYLOAD
            )));
        }
        let need = padded(FRAME_HEADER_SIZE + payload.len());
        let start = self.ring_reserve(base, slot, need)?;
        let seq = self.atomic_u32_at(base + SEQ).fetch_add(1, Ordering::AcqRel);

        let pos = start as usize % RING_DATA_CAPACITY;

        // Body first: [seq][kind][flags] + payload after the length word.
        let mut body = Vec::with_capacity(8 + payload.len());
        body.extend_from_slice(&seq.to_le_bytes());
        body.extend_from_slice(&kind.to_le_bytes());
        body.extend_from_slice(&flags.to_le_bytes());
        body.extend_from_slice(payload);
        self.ring_data_write(base, (pos + 4) % RING_DATA_CAPACITY, &body)?;

        // Commit: the length word is written last. Word cursors stay 4-byte
        // aligned (capacity is a multiple of 4) so the word never wraps.
        let len_word = self.atomic_u32_at(base + RING_HEADER_SIZE + pos);
        len_word.store(payload.len() as u32, Ordering::Release);

        self.metrics().frames_pushed.fetch_add(1, Ordering::Relaxed);
        Ok(seq)
    }

    fn ring_pop(&self, base: usize) -> Result<Option<Frame>> {
        let tail_word = self.atomic_u32_at(base + TAIL);
        let ack_word = self.atomic_u32_at(base + ACK);

        let ack = ack_word.load(Ordering::Acquire);
        let tail = tail_word.load(Ordering::Acquire);
        if ack == tail {
            return Ok(None);
        }

        let pos = ack as usize % RING_DATA_CAPACITY;
        let len_word = self.atomic_u32_at(base + RING_HEADER_SIZE + pos);
        let len = len_word.load(Ordering::Acquire) as usize;
        if len == 0 {
            // Reserved but not yet committed by the producer.
            return Ok(None);
        }
        if len > MAX_FRAME_PAYLOAD {
            // A producer scribbled a nonsensical length; drop everything up
            // to the write cursor so the ring recovers.
            ack_word.store(tail, Ordering::Release);
            return Err(Error::SchemaError {
                position: pos,
                message: format!("ring frame length {} exceeds capacity", len),
            });
        }

        let mut body = vec![0u8; 8 + len];
        self.ring_data_read(base, (pos + 4) % RING_DATA_CAPACITY, &mut body)?;
        let seq = u32::from_le_bytes(body[0..4].try_into().unwrap());
        let kind = u16::from_le_bytes(body[4..6].try_into().unwrap());
        let flags = u16::from_le_bytes(body[6..8].try_into().unwrap());
        let payload = body.split_off(8);

        // Clear the commit word behind us so a wrapped reservation is never
        // mistaken for a committed frame.
        len_word.store(0, Ordering::Release);
        ack_word.store(
            ack.wrapping_add(padded(FRAME_HEADER_SIZE + len) as u32),
            Ordering::Release,
        );

        self.metrics().frames_popped.fetch_add(1, Ordering::Relaxed);
        Ok(Some(Frame {
            seq,
            kind,
            flags,
            payload,
        }))
    }

    // ========== PUBLIC RING OPS ==========

    /// Push a frame into a module's outbox and wake the kernel listener.
    pub fn outbox_push(&self, slot: u16, kind: u16, flags: u16, payload: &[u8]) -> Result<u32> {
        Self::check_slot(slot)?;
        let seq = self.ring_push(Self::ring_base(OFFSET_OUTBOX_RINGS, slot), slot, kind, flags, payload)?;
        self.bump_epoch(IDX_OUTBOX_DIRTY);
        Ok(seq)
    }

    /// Drain one frame from any module outbox, scanning round-robin from the
    /// position after the last hit.
    pub fn outbox_read_one(&self) -> Result<Option<(u16, Frame)>> {
        let start = self.inner.scan_pos.load(Ordering::Relaxed);
        for i in 0..MAX_MODULES_INLINE {
            let slot = ((start + i) % MAX_MODULES_INLINE) as u16;
            match self.ring_pop(Self::ring_base(OFFSET_OUTBOX_RINGS, slot)) {
                Ok(Some(frame)) => {
                    self.inner
                        .scan_pos
                        .store((slot as usize + 1) % MAX_MODULES_INLINE, Ordering::Relaxed);
                    return Ok(Some((slot, frame)));
                }
                Ok(None) => {}
                Err(e) => {
                    log::warn!("outbox slot {} corrupt frame dropped: {}", slot, e);
                }
            }
        }
        Ok(None)
    }

    /// Push a frame into a module's inbox and wake the module.
    pub fn inbox_push(&self, slot: u16, kind: u16, flags: u16, payload: &[u8]) -> Result<u32> {
        Self::check_slot(slot)?;
        let seq = self.ring_push(Self::ring_base(OFFSET_INBOX_RINGS, slot), slot, kind, flags, payload)?;
        self.bump_epoch(inbox_dirty_index(slot));
        Ok(seq)
    }

    /// Pop the next frame from a module's inbox, if any.
    pub fn inbox_pop(&self, slot: u16) -> Result<Option<Frame>> {
        Self::check_slot(slot)?;
        self.ring_pop(Self::ring_base(OFFSET_INBOX_RINGS, slot))
    }

    /// Current value of the global outbox dirty counter; the signal listener
    /// compares this against its last observed value before parking.
    pub fn read_outbox_sequence(&self) -> i32 {
        self.read_atomic_i32(IDX_OUTBOX_DIRTY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::SUBSTRATE_SIZE_MIN;

    fn bridge() -> SabBridge {
        SabBridge::create_owned(SUBSTRATE_SIZE_MIN).unwrap()
    }

    #[test]
    fn test_push_pop_roundtrip() {
        let b = bridge();
        let seq = b
            .outbox_push(3, FRAME_KIND_SYSCALL_REQUEST, 0, b"hello kernel")
            .unwrap();
        let (slot, frame) = b.outbox_read_one().unwrap().unwrap();
        assert_eq!(slot, 3);
        assert_eq!(frame.seq, seq);
        assert_eq!(frame.kind, FRAME_KIND_SYSCALL_REQUEST);
        assert_eq!(frame.payload, b"hello kernel");
        assert!(b.outbox_read_one().unwrap().is_none());
    }

    #[test]
    fn test_fifo_and_monotonic_seq() {
        let b = bridge();
        for i in 0u8..5 {
            b.inbox_push(0, FRAME_KIND_SYSCALL_RESPONSE, 0, &[i]).unwrap();
        }
        let mut last_seq = None;
        for i in 0u8..5 {
            let frame = b.inbox_pop(0).unwrap().unwrap();
            assert_eq!(frame.payload, vec![i]);
            if let Some(prev) = last_seq {
                assert!(frame.seq > prev);
            }
            last_seq = Some(frame.seq);
        }
        assert!(b.inbox_pop(0).unwrap().is_none());
    }

    #[test]
    fn test_outbox_bumps_dirty_epoch() {
        let b = bridge();
        let before = b.read_outbox_sequence();
        b.outbox_push(0, FRAME_KIND_SYSCALL_REQUEST, 0, b"x").unwrap();
        assert_eq!(b.read_outbox_sequence(), before + 1);
    }

    #[test]
    fn test_inbox_bumps_banked_dirty_flag() {
        let b = bridge();
        let idx = inbox_dirty_index(21);
        let before = b.read_atomic_i32(idx);
        b.inbox_push(21, FRAME_KIND_SYSCALL_RESPONSE, 0, b"y").unwrap();
        assert_eq!(b.read_atomic_i32(idx), before + 1);
    }

    #[test]
    fn test_backpressure_with_lagging_consumer() {
        let b = bridge();
        // 100-byte payloads pad to 112 bytes per frame; 9 fit in 1008.
        let payload = [7u8; 100];
        let per_frame = padded(FRAME_HEADER_SIZE + payload.len());
        let fit = RING_DATA_CAPACITY / per_frame;
        for _ in 0..fit {
            b.outbox_push(1, FRAME_KIND_SYSCALL_REQUEST, 0, &payload).unwrap();
        }
        // The +1th frame hits an unacked oldest frame.
        assert!(matches!(
            b.outbox_push(1, FRAME_KIND_SYSCALL_REQUEST, 0, &payload),
            Err(Error::BackPressure(1))
        ));
        assert!(b.metrics().snapshot().backpressure_events >= 1);

        // After the consumer catches up, the producer may continue.
        let (_, _frame) = b.outbox_read_one().unwrap().unwrap();
        b.outbox_push(1, FRAME_KIND_SYSCALL_REQUEST, 0, &payload).unwrap();
    }

    #[test]
    fn test_wraparound_preserves_frames() {
        let b = bridge();
        let payload = [9u8; 200];
        // Push/pop enough volume to wrap the 1008-byte ring several times.
        for round in 0u32..20 {
            b.inbox_push(5, FRAME_KIND_SYSCALL_RESPONSE, round as u16, &payload).unwrap();
            let frame = b.inbox_pop(5).unwrap().unwrap();
            assert_eq!(frame.flags, round as u16);
            assert_eq!(frame.payload.len(), 200);
            assert!(frame.payload.iter().all(|&v| v == 9));
        }
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let b = bridge();
        let huge = vec![0u8; MAX_FRAME_PAYLOAD + 1];
        assert!(matches!(
            b.outbox_push(0, FRAME_KIND_SYSCALL_REQUEST, 0, &huge),
            Err(Error::InvalidParams(_))
        ));
    }

    #[test]
    fn test_round_robin_scan_across_slots() {
        let b = bridge();
        b.outbox_push(10, FRAME_KIND_SYSCALL_REQUEST, 0, b"ten").unwrap();
        b.outbox_push(2, FRAME_KIND_SYSCALL_REQUEST, 0, b"two").unwrap();
        let mut seen = Vec::new();
        while let Some((slot, _)) = b.outbox_read_one().unwrap() {
            seen.push(slot);
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![2, 10]);
    }

    #[test]
    fn test_bad_slot_rejected() {
        let b = bridge();
        assert!(b.outbox_push(64, FRAME_KIND_SYSCALL_REQUEST, 0, b"").is_err());
        assert!(b.inbox_pop(200).is_err());
    }
}
