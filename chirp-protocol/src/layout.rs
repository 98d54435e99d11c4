use core::fmt;

use crate::metrics::METRICS_REGION_SIZE;
use crate::mirror::mirror_region_size;
use crate::types::ANCHOR_SIZE;
use crate::{DEBUG_RING_SIZE, IN_RING_SIZE, OUT_RING_SIZE, WASM_PAGE_SIZE};

// Per-ring control block. head and tail live on separate cache lines so
// producer and consumer stores don't false-share; the sequence counter and
// write lock share the third line.
pub const RING_CTRL_HEAD: usize = 0;
pub const RING_CTRL_TAIL: usize = 64;
pub const RING_CTRL_SEQ: usize = 128;
pub const RING_CTRL_LOCK: usize = 132;
pub const RING_CTRL_SIZE: usize = 192;

/// The engine never uses fewer bytes than this for its own heap; a layout
/// that leaves less is a configuration error, not a tight fit.
pub const ENGINE_HEAP_MIN: usize = 16 * WASM_PAGE_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub offset: usize,
    pub size: usize,
}

impl Region {
    pub const fn end(self) -> usize {
        self.offset + self.size
    }
}

/// Partition of the shared buffer, fixed at init time.
///
/// The engine heap sits at offset 0 so the engine's own pointers stay
/// small; the transport block and the sample pool stack above it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedLayout {
    pub total_size: usize,
    pub engine_heap: Region,
    pub ring_in: Region,
    pub ring_out: Region,
    pub ring_debug: Region,
    pub ctrl_in: Region,
    pub ctrl_out: Region,
    pub ctrl_debug: Region,
    pub metrics: Region,
    pub ntp_anchor: Region,
    pub mirror: Region,
    pub capture: Region,
    pub buffer_pool: Region,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutConfig {
    /// Whole shared buffer; must be a multiple of the wasm page size.
    pub total_size: usize,
    pub buffer_pool_size: usize,
    /// Node capacity of the tree mirror.
    pub mirror_capacity: usize,
    pub capture_size: usize,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        LayoutConfig {
            total_size: 64 * 1024 * 1024,
            buffer_pool_size: 32 * 1024 * 1024,
            mirror_capacity: 1024,
            capture_size: 256 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutError {
    TotalNotPageAligned { total: usize },
    Unaligned { what: &'static str, size: usize },
    EngineHeapTooSmall { available: usize, required: usize },
}

impl fmt::Display for LayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayoutError::TotalNotPageAligned { total } => {
                write!(f, "total memory {total} is not a multiple of the {WASM_PAGE_SIZE} byte wasm page size")
            }
            LayoutError::Unaligned { what, size } => {
                write!(f, "{what} size {size} is not 8-byte aligned")
            }
            LayoutError::EngineHeapTooSmall { available, required } => {
                write!(f, "engine heap would be {available} bytes, needs at least {required}")
            }
        }
    }
}

impl SharedLayout {
    pub fn compute(config: &LayoutConfig) -> Result<SharedLayout, LayoutError> {
        if config.total_size % WASM_PAGE_SIZE != 0 {
            return Err(LayoutError::TotalNotPageAligned { total: config.total_size });
        }
        if config.buffer_pool_size % 8 != 0 {
            return Err(LayoutError::Unaligned { what: "buffer pool", size: config.buffer_pool_size });
        }
        if config.capture_size % 8 != 0 {
            return Err(LayoutError::Unaligned { what: "capture region", size: config.capture_size });
        }

        let mirror_size = mirror_region_size(config.mirror_capacity);
        let transport_size = IN_RING_SIZE
            + OUT_RING_SIZE
            + DEBUG_RING_SIZE
            + 3 * RING_CTRL_SIZE
            + METRICS_REGION_SIZE
            + ANCHOR_SIZE
            + mirror_size
            + config.capture_size;

        let reserved = transport_size + config.buffer_pool_size;
        let engine_heap_size = config.total_size.saturating_sub(reserved);

        if engine_heap_size < ENGINE_HEAP_MIN {
            return Err(LayoutError::EngineHeapTooSmall {
                available: engine_heap_size,
                required: ENGINE_HEAP_MIN,
            });
        }

        let mut cursor = engine_heap_size;
        let mut take = |size: usize| {
            let region = Region { offset: cursor, size };
            cursor += size;
            region
        };

        let ring_in = take(IN_RING_SIZE);
        let ring_out = take(OUT_RING_SIZE);
        let ring_debug = take(DEBUG_RING_SIZE);
        let ctrl_in = take(RING_CTRL_SIZE);
        let ctrl_out = take(RING_CTRL_SIZE);
        let ctrl_debug = take(RING_CTRL_SIZE);
        let metrics = take(METRICS_REGION_SIZE);
        let ntp_anchor = take(ANCHOR_SIZE);
        let mirror = take(mirror_size);
        let capture = take(config.capture_size);
        let buffer_pool = take(config.buffer_pool_size);

        debug_assert_eq!(cursor, config.total_size);

        Ok(SharedLayout {
            total_size: config.total_size,
            engine_heap: Region { offset: 0, size: engine_heap_size },
            ring_in,
            ring_out,
            ring_debug,
            ctrl_in,
            ctrl_out,
            ctrl_debug,
            metrics,
            ntp_anchor,
            mirror,
            capture,
            buffer_pool,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_partitions_cleanly() {
        let layout = SharedLayout::compute(&LayoutConfig::default()).unwrap();

        let regions = [
            layout.engine_heap,
            layout.ring_in,
            layout.ring_out,
            layout.ring_debug,
            layout.ctrl_in,
            layout.ctrl_out,
            layout.ctrl_debug,
            layout.metrics,
            layout.ntp_anchor,
            layout.mirror,
            layout.capture,
            layout.buffer_pool,
        ];

        // contiguous, in order, no gaps or overlap
        let mut cursor = 0;
        for region in regions {
            assert_eq!(region.offset, cursor);
            assert_eq!(region.offset % 8, 0);
            cursor = region.end();
        }
        assert_eq!(cursor, layout.total_size);
    }

    #[test]
    fn rejects_unaligned_total() {
        let config = LayoutConfig { total_size: 64 * 1024 * 1024 + 1, ..LayoutConfig::default() };
        assert!(matches!(
            SharedLayout::compute(&config),
            Err(LayoutError::TotalNotPageAligned { .. }),
        ));
    }

    #[test]
    fn rejects_oversized_pool() {
        let config = LayoutConfig {
            total_size: 4 * 1024 * 1024,
            buffer_pool_size: 4 * 1024 * 1024,
            ..LayoutConfig::default()
        };
        assert!(matches!(
            SharedLayout::compute(&config),
            Err(LayoutError::EngineHeapTooSmall { .. }),
        ));
    }
}
