use core::mem::size_of;

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;

/// Framing header preceding every ring payload.
///
/// `length` counts payload bytes only; the frame occupies
/// `frame_stride(length)` bytes in the ring, padded up to 8. Host
/// endianness throughout: producers and consumers share one machine. The
/// NTP words inside OSC payloads stay big-endian per the OSC spec.
#[derive(Debug, Clone, Copy, Zeroable, Pod)]
#[repr(C)]
pub struct FrameHeader {
    pub length: u32,
    pub source: SourceId,
    pub sequence: u32,
    pub reserved: u32,
}

pub const FRAME_HEADER_SIZE: usize = size_of::<FrameHeader>();
pub const FRAME_ALIGN: usize = 8;

const_assert_eq!(FRAME_HEADER_SIZE, 16);

/// Total ring bytes a frame occupies: header plus payload, padded up to
/// the frame alignment.
pub const fn frame_stride(payload_len: usize) -> usize {
    (FRAME_HEADER_SIZE + payload_len + FRAME_ALIGN - 1) & !(FRAME_ALIGN - 1)
}

/// Numeric identity of a producer, stamped into every frame header for
/// log attribution. 0 is the main thread; workers count up from 1.
#[derive(Debug, Clone, Copy, Zeroable, Pod, PartialEq, Eq, Hash, derive_more::Display)]
#[display(fmt = "{_0}")]
#[repr(transparent)]
pub struct SourceId(pub u32);

impl SourceId {
    pub const MAIN: SourceId = SourceId(0);

    /// Synthetic producer id for frames the engine side emits on the
    /// reply and debug rings.
    pub const ENGINE: SourceId = SourceId(u32::MAX);
}

/// User-supplied label attached to scheduled bundles for selective
/// cancellation, alongside a run tag.
#[derive(Debug, Clone, Copy, Default, Zeroable, Pod, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display)]
#[display(fmt = "{_0}")]
#[repr(transparent)]
pub struct SessionId(pub u32);

/// The two NTP words the timing component publishes for the engine.
/// Written host-endian into the anchor region; the engine reconstructs
/// its wall clock as anchor + elapsed audio time.
#[derive(Debug, Clone, Copy, Zeroable, Pod)]
#[repr(C)]
pub struct AnchorWords {
    pub seconds: u32,
    pub fraction: u32,
}

pub const ANCHOR_SIZE: usize = size_of::<AnchorWords>();

const_assert_eq!(ANCHOR_SIZE, 8);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_strides() {
        assert_eq!(frame_stride(0), 16);
        assert_eq!(frame_stride(1), 24);
        assert_eq!(frame_stride(8), 24);
        assert_eq!(frame_stride(9), 32);
        assert_eq!(frame_stride(16), 32);
    }
}
