use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chirp_protocol::layout::{
    SharedLayout, RING_CTRL_HEAD, RING_CTRL_LOCK, RING_CTRL_SEQ, RING_CTRL_TAIL,
};
use chirp_protocol::types::{frame_stride, FrameHeader, SourceId, FRAME_HEADER_SIZE};
use chirp_protocol::{DEBUG_MAX_PAYLOAD, IN_MAX_PAYLOAD, OUT_MAX_PAYLOAD};
use thiserror::Error;

use crate::region::SharedRegion;

/// Gaps larger than this are treated as counter corruption rather than
/// drops, and are not added to the drop accounting.
pub const MAX_SANE_GAP: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingKind {
    In,
    Out,
    Debug,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WriteError {
    #[error("ring full")]
    Full,
    #[error("payload too large: {len} bytes, max {max}")]
    TooLarge { len: usize, max: usize },
}

/// One framed byte ring over the shared region.
///
/// head and tail are byte offsets modulo the ring size. A write is
/// refused unless it leaves at least one maximum frame of free space,
/// which keeps head from ever catching tail from behind, so
/// `head == tail` always means empty.
#[derive(Clone)]
pub struct Ring {
    region: Arc<SharedRegion>,
    ctrl: usize,
    data: usize,
    size: usize,
    max_payload: usize,
    locked: bool,
}

impl Ring {
    pub fn new(
        region: Arc<SharedRegion>,
        ctrl: usize,
        data: usize,
        size: usize,
        max_payload: usize,
        locked: bool,
    ) -> Ring {
        assert!(size % 8 == 0 && size > 2 * frame_stride(max_payload));
        Ring { region, ctrl, data, size, max_payload, locked }
    }

    /// Bind one of the three well-known rings of a layout. Only the IN
    /// ring takes the write lock; the engine-side rings have a single
    /// producer.
    pub fn from_layout(region: Arc<SharedRegion>, layout: &SharedLayout, kind: RingKind) -> Ring {
        let (data, ctrl, max_payload, locked) = match kind {
            RingKind::In => (layout.ring_in, layout.ctrl_in, IN_MAX_PAYLOAD, true),
            RingKind::Out => (layout.ring_out, layout.ctrl_out, OUT_MAX_PAYLOAD, false),
            RingKind::Debug => (layout.ring_debug, layout.ctrl_debug, DEBUG_MAX_PAYLOAD, false),
        };

        Ring::new(region, ctrl.offset, data.offset, data.size, max_payload, locked)
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    fn head(&self) -> &AtomicU32 {
        self.region.atomic_u32(self.ctrl + RING_CTRL_HEAD)
    }

    fn tail(&self) -> &AtomicU32 {
        self.region.atomic_u32(self.ctrl + RING_CTRL_TAIL)
    }

    fn seq(&self) -> &AtomicU32 {
        self.region.atomic_u32(self.ctrl + RING_CTRL_SEQ)
    }

    fn lock(&self) -> &AtomicU32 {
        self.region.atomic_u32(self.ctrl + RING_CTRL_LOCK)
    }

    #[cfg(test)]
    pub(crate) fn lock_for_test(&self) -> &AtomicU32 {
        self.lock()
    }

    /// Zero all control words. Only safe while no other executor touches
    /// the ring, i.e. during init and reload.
    pub fn reset(&self) {
        self.head().store(0, Ordering::Release);
        self.tail().store(0, Ordering::Release);
        self.seq().store(0, Ordering::Release);
        self.lock().store(0, Ordering::Release);
    }

    /// Bytes currently buffered. Racy snapshot, for stats only.
    pub fn used(&self) -> usize {
        let head = self.head().load(Ordering::Acquire) as usize;
        let tail = self.tail().load(Ordering::Acquire) as usize;
        (head + self.size - tail) % self.size
    }

    fn copy_in(&self, pos: usize, src: &[u8]) {
        let first = src.len().min(self.size - pos);
        self.region.write_from(self.data + pos, &src[..first]);
        if first < src.len() {
            self.region.write_from(self.data, &src[first..]);
        }
    }

    fn copy_out(&self, pos: usize, dst: &mut [u8]) {
        let first = dst.len().min(self.size - pos);
        self.region.read_into(self.data + pos, &mut dst[..first]);
        if first < dst.len() {
            let rest = first..dst.len();
            self.region.read_into(self.data, &mut dst[rest]);
        }
    }

    fn try_acquire_lock(&self, max_spins: u32) -> bool {
        let lock = self.lock();
        let mut spins = 0;

        loop {
            if lock.compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed).is_ok() {
                return true;
            }
            if spins >= max_spins {
                return false;
            }
            spins += 1;
            std::hint::spin_loop();
        }
    }

    fn release_lock(&self) {
        self.lock().store(0, Ordering::Release);
    }

    /// Append one frame. On the locked ring, contention beyond
    /// `max_spins` reports as full rather than blocking the caller.
    pub fn write(&self, source: SourceId, payload: &[u8], max_spins: u32) -> Result<u32, WriteError> {
        if payload.len() > self.max_payload {
            return Err(WriteError::TooLarge { len: payload.len(), max: self.max_payload });
        }

        if self.locked && !self.try_acquire_lock(max_spins) {
            return Err(WriteError::Full);
        }

        let result = self.write_locked(source, payload);

        if self.locked {
            self.release_lock();
        }

        result
    }

    fn write_locked(&self, source: SourceId, payload: &[u8]) -> Result<u32, WriteError> {
        let stride = frame_stride(payload.len());
        let max_stride = frame_stride(self.max_payload);

        let head = self.head().load(Ordering::Relaxed) as usize;
        let tail = self.tail().load(Ordering::Acquire) as usize;
        let used = (head + self.size - tail) % self.size;

        // keep one maximum frame of slack so head never reaches tail
        if used + stride + max_stride > self.size {
            return Err(WriteError::Full);
        }

        let sequence = self.seq().fetch_add(1, Ordering::Relaxed);

        let header = FrameHeader {
            length: payload.len() as u32,
            source,
            sequence,
            reserved: 0,
        };

        self.copy_in(head, bytemuck::bytes_of(&header));
        self.copy_in((head + FRAME_HEADER_SIZE) % self.size, payload);

        // body is fully written; only now does the frame become visible
        let new_head = ((head + stride) % self.size) as u32;
        self.head().store(new_head, Ordering::Release);

        Ok(sequence)
    }

    /// Burn one sequence number without writing a frame. A producer that
    /// drops a frame (full ring) marks it this way so the consumer's gap
    /// accounting can see the loss.
    pub fn skip_sequence(&self) -> u32 {
        self.seq().fetch_add(1, Ordering::Relaxed)
    }

    /// Pop the next frame, if any. Single consumer only.
    pub fn read(&self) -> Option<Frame> {
        let head = self.head().load(Ordering::Acquire) as usize;
        let tail = self.tail().load(Ordering::Relaxed) as usize;

        if head == tail {
            return None;
        }

        let mut header_bytes = [0u8; FRAME_HEADER_SIZE];
        self.copy_out(tail, &mut header_bytes);
        let header: FrameHeader = bytemuck::pod_read_unaligned(&header_bytes);

        let used = (head + self.size - tail) % self.size;
        let length = header.length as usize;

        if length > self.max_payload || frame_stride(length) > used {
            // mis-framed header; drop everything buffered and resync
            log::error!(
                "mis-framed ring header at tail {tail}: length {length}, {used} bytes buffered",
            );
            self.tail().store(head as u32, Ordering::Release);
            return None;
        }

        let mut payload = vec![0u8; length];
        self.copy_out((tail + FRAME_HEADER_SIZE) % self.size, &mut payload);

        let new_tail = ((tail + frame_stride(length)) % self.size) as u32;
        self.tail().store(new_tail, Ordering::Release);

        Some(Frame {
            source: header.source,
            sequence: header.sequence,
            payload,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub source: SourceId,
    pub sequence: u32,
    pub payload: Vec<u8>,
}

/// Consumer-side sequence accounting. Sequences are globally monotonic
/// per ring; a jump means frames were dropped upstream.
#[derive(Debug, Default)]
pub struct SeqTracker {
    next: Option<u32>,
}

impl SeqTracker {
    pub fn new() -> SeqTracker {
        SeqTracker::default()
    }

    /// Returns how many frames went missing before this one.
    pub fn observe(&mut self, sequence: u32) -> u32 {
        let expected = self.next;
        self.next = Some(sequence.wrapping_add(1));

        let Some(expected) = expected else {
            return 0;
        };

        let gap = sequence.wrapping_sub(expected);

        if gap == 0 {
            0
        } else if gap <= MAX_SANE_GAP {
            gap
        } else {
            log::warn!("implausible sequence gap of {gap} at sequence {sequence}, ignoring");
            0
        }
    }
}
