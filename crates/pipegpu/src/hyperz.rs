//! On-chip zmask RAM allocator.
//!
//! Fast depth clears only work for a depth buffer that owns a block of zmask RAM. Blocks are
//! handed out first-fit and coalesced on release.

use std::ops::Range;

use crate::error::ContextError;

/// Pixels covered by one zmask unit along each axis.
pub const ZMASK_TILE: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZmaskBlock {
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug)]
pub struct ZmaskAllocator {
    total: u32,
    free: Vec<Range<u32>>,
}

impl ZmaskAllocator {
    pub fn new(total: u32) -> Result<Self, ContextError> {
        if total == 0 {
            return Err(ContextError::Allocation("zmask memory manager"));
        }
        Ok(Self {
            total,
            free: vec![0..total],
        })
    }

    /// Units needed to cover a `width` x `height` surface.
    pub fn units_for(width: u32, height: u32) -> u32 {
        width.div_ceil(ZMASK_TILE) * height.div_ceil(ZMASK_TILE)
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn free_units(&self) -> u32 {
        self.free.iter().map(|r| r.end - r.start).sum()
    }

    pub fn alloc(&mut self, size: u32) -> Option<ZmaskBlock> {
        if size == 0 {
            return None;
        }
        let index = self.free.iter().position(|r| r.end - r.start >= size)?;
        let range = &mut self.free[index];
        let block = ZmaskBlock {
            offset: range.start,
            size,
        };
        range.start += size;
        if range.is_empty() {
            self.free.remove(index);
        }
        Some(block)
    }

    pub fn release(&mut self, block: ZmaskBlock) {
        let start = block.offset;
        let end = block.offset + block.size;
        debug_assert!(end <= self.total);
        let index = self.free.partition_point(|r| r.start < start);
        self.free.insert(index, start..end);

        // Coalesce with neighbours.
        if index + 1 < self.free.len() && self.free[index].end == self.free[index + 1].start {
            let next = self.free.remove(index + 1);
            self.free[index].end = next.end;
        }
        if index > 0 && self.free[index - 1].end == self.free[index].start {
            let cur = self.free.remove(index);
            self.free[index - 1].end = cur.end;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_sized_ram_cannot_be_managed() {
        assert!(matches!(
            ZmaskAllocator::new(0),
            Err(ContextError::Allocation(_))
        ));
    }

    #[test]
    fn first_fit_and_coalescing() {
        let mut mm = ZmaskAllocator::new(100).unwrap();
        let a = mm.alloc(40).unwrap();
        let b = mm.alloc(40).unwrap();
        assert_eq!((a.offset, b.offset), (0, 40));
        assert!(mm.alloc(30).is_none());

        mm.release(a);
        assert_eq!(mm.alloc(10).unwrap().offset, 0);
        mm.release(b);
        assert_eq!(mm.free_units(), 90);
        // 10..100 is one contiguous range again.
        assert_eq!(mm.alloc(90).unwrap().offset, 10);
    }

    #[test]
    fn units_round_up_to_tiles() {
        assert_eq!(ZmaskAllocator::units_for(64, 32), 8 * 4);
        assert_eq!(ZmaskAllocator::units_for(1, 1), 1);
    }
}
