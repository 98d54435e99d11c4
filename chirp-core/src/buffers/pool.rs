use serde::Serialize;
use thiserror::Error;

/// First-fit byte allocator over the sample pool region. Offsets are
/// relative to the pool base; alignment is 8 bytes throughout.
pub struct Pool {
    free: Vec<Block>,
    total: usize,
    used: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Block {
    offset: usize,
    size: usize,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("sample pool exhausted: requested {requested} bytes, largest free block {largest}, {available} free of {total}")]
pub struct PoolExhausted {
    pub requested: usize,
    pub largest: usize,
    pub available: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub used: usize,
    pub available: usize,
    pub largest_free: usize,
    pub free_blocks: usize,
}

const ALIGN: usize = 8;

fn align_up(size: usize) -> usize {
    (size + ALIGN - 1) & !(ALIGN - 1)
}

impl Pool {
    pub fn new(total: usize) -> Pool {
        assert!(total % ALIGN == 0);

        Pool {
            free: vec![Block { offset: 0, size: total }],
            total,
            used: 0,
        }
    }

    /// Allocate `size` bytes (rounded up to alignment). Exhaustion does
    /// not mutate any state.
    pub fn alloc(&mut self, size: usize) -> Result<usize, PoolExhausted> {
        let size = align_up(size.max(ALIGN));

        let slot = self.free.iter().position(|block| block.size >= size);

        let Some(slot) = slot else {
            return Err(PoolExhausted {
                requested: size,
                largest: self.free.iter().map(|b| b.size).max().unwrap_or(0),
                available: self.total - self.used,
                total: self.total,
            });
        };

        let block = self.free[slot];
        if block.size == size {
            self.free.remove(slot);
        } else {
            self.free[slot] = Block { offset: block.offset + size, size: block.size - size };
        }

        self.used += size;
        Ok(block.offset)
    }

    /// Return a block. `size` must be the value originally requested; it
    /// is re-rounded the same way alloc rounded it.
    pub fn free(&mut self, offset: usize, size: usize) {
        let size = align_up(size.max(ALIGN));
        debug_assert!(offset + size <= self.total);

        self.used -= size;

        // insert sorted by offset, then coalesce with both neighbours
        let index = self.free.partition_point(|block| block.offset < offset);
        self.free.insert(index, Block { offset, size });

        if index + 1 < self.free.len() {
            let next = self.free[index + 1];
            if self.free[index].offset + self.free[index].size == next.offset {
                self.free[index].size += next.size;
                self.free.remove(index + 1);
            }
        }

        if index > 0 {
            let prev = self.free[index - 1];
            if prev.offset + prev.size == self.free[index].offset {
                self.free[index - 1].size += self.free[index].size;
                self.free.remove(index);
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            total: self.total,
            used: self.used,
            available: self.total - self.used,
            largest_free: self.free.iter().map(|b| b.size).max().unwrap_or(0),
            free_blocks: self.free.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_fit_and_alignment() {
        let mut pool = Pool::new(1024);

        let a = pool.alloc(100).unwrap();
        let b = pool.alloc(1).unwrap();
        assert_eq!(a, 0);
        // 100 rounds to 104
        assert_eq!(b, 104);
        assert_eq!(pool.stats().used, 112);
    }

    #[test]
    fn free_coalesces_both_ways() {
        let mut pool = Pool::new(1024);

        let a = pool.alloc(128).unwrap();
        let b = pool.alloc(128).unwrap();
        let c = pool.alloc(128).unwrap();
        let _d = pool.alloc(128).unwrap();

        pool.free(a, 128);
        pool.free(c, 128);
        assert_eq!(pool.stats().free_blocks, 3);

        // freeing b merges a+b+c into one block
        pool.free(b, 128);
        assert_eq!(pool.stats().free_blocks, 2);
        assert_eq!(pool.stats().largest_free, 3 * 128);
    }

    #[test]
    fn exhaustion_reports_sizes_and_keeps_state() {
        let mut pool = Pool::new(256);
        pool.alloc(192).unwrap();

        let before = pool.stats();
        let err = pool.alloc(128).unwrap_err();

        assert_eq!(err.requested, 128);
        assert_eq!(err.available, 64);
        assert_eq!(err.largest, 64);
        assert_eq!(err.total, 256);
        assert_eq!(pool.stats(), before);
    }

    #[test]
    fn full_lifecycle_returns_every_byte() {
        let mut pool = Pool::new(4096);
        let mut held = Vec::new();

        for size in [64usize, 200, 8, 1000, 24] {
            held.push((pool.alloc(size).unwrap(), size));
        }
        for (offset, size) in held {
            pool.free(offset, size);
        }

        let stats = pool.stats();
        assert_eq!(stats.used, 0);
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.largest_free, 4096);
    }
}
