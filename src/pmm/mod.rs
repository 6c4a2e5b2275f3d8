//! Physical frame allocator
//!
//! Power-of-two buddy allocator over physical memory. A block of
//! order k is 2^k contiguous 4 KiB frames, naturally aligned on
//! 2^k * 4 KiB; the buddy of a block is found by XORing its base with
//! the block size. The allocator is pure bookkeeping: free lists hold
//! block base addresses and the frames themselves are never touched,
//! so ownership of a block transfers wholly to the caller on alloc
//! and back on free.
//!
//! Free-list invariants:
//! - every free block is on exactly one list, at its fully-coalesced
//!   order
//! - no two free buddies of the same order coexist
//!
//! One lock covers the whole free-list array and the counters; it is
//! held only across the bounded split/coalesce walks.

use alloc::vec::Vec;
use spin::Mutex;

use crate::boot::MemoryRegion;
use crate::error::{KernError, KernResult};
use crate::{log_info, log_warn};
use crate::types::PhysAddr;

/// Frame size in bytes
pub const PAGE_SIZE: usize = 4096;

/// log2 of the frame size
pub const PAGE_SHIFT: usize = 12;

/// Maximum allocation order (2^20 frames = 4 GiB)
pub const MAX_ORDER: usize = 20;

/// Cap on any single allocation
const MAX_SINGLE_ALLOC: u64 = 100 * 1024 * 1024;

/// Frames in a block of the given order
pub const fn frames_for_order(order: usize) -> u64 {
    1 << order
}

/// Bytes in a block of the given order
pub const fn bytes_for_order(order: usize) -> u64 {
    (PAGE_SIZE as u64) << order
}

/// Smallest order whose block holds at least `pages` frames
pub fn order_for_pages(pages: u64) -> usize {
    let mut order = 0;
    while frames_for_order(order) < pages && order < MAX_ORDER {
        order += 1;
    }
    order
}

/// Allocator statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub total_frames: u64,
    pub free_frames: u64,
    pub used_frames: u64,
}

/// The buddy allocator state
pub struct FrameAllocator {
    /// One free list per order; entries are block base addresses
    free_lists: [Vec<PhysAddr>; MAX_ORDER + 1],
    total_frames: u64,
    free_frames: u64,
}

impl FrameAllocator {
    /// Create an empty allocator
    pub const fn new() -> Self {
        const EMPTY: Vec<PhysAddr> = Vec::new();
        Self {
            free_lists: [EMPTY; MAX_ORDER + 1],
            total_frames: 0,
            free_frames: 0,
        }
    }

    /// Seed the free lists from the boot memory map
    ///
    /// Only Available regions contribute. Each region is aligned
    /// inward to frame boundaries and carved into the largest
    /// naturally-aligned power-of-two blocks that fit.
    pub fn set_memory_map(&mut self, regions: &[MemoryRegion]) {
        for region in regions {
            if !region.is_available() {
                continue;
            }

            let start = (region.base + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1);
            let end = region.end() & !(PAGE_SIZE as u64 - 1);
            if start >= end {
                continue;
            }

            let mut addr = start;
            while addr < end {
                let align_order = if addr == 0 {
                    MAX_ORDER
                } else {
                    ((addr.trailing_zeros() as usize).saturating_sub(PAGE_SHIFT)).min(MAX_ORDER)
                };

                let mut order = align_order;
                while order > 0 && addr + bytes_for_order(order) > end {
                    order -= 1;
                }

                self.free_lists[order].push(addr);
                self.total_frames += frames_for_order(order);
                self.free_frames += frames_for_order(order);
                addr += bytes_for_order(order);
            }
        }

        log_info!(
            "pmm",
            "memory map seeded: {} frames total, {} free",
            self.total_frames,
            self.free_frames
        );
    }

    /// Admission rules applied before any list search
    fn admit(&self, order: usize) -> KernResult<()> {
        let requested = frames_for_order(order);

        if requested > self.total_frames {
            log_warn!(
                "pmm",
                "rejected allocation: {} frames requested, {} exist",
                requested,
                self.total_frames
            );
            return Err(KernError::OutOfRange);
        }

        // A single allocation may not reach half of physical memory
        if requested * 2 >= self.total_frames {
            log_warn!(
                "pmm",
                "rejected large allocation: {} of {} frames",
                requested,
                self.total_frames
            );
            return Err(KernError::OutOfRange);
        }

        if bytes_for_order(order) > MAX_SINGLE_ALLOC {
            log_warn!("pmm", "rejected massive allocation: order {}", order);
            return Err(KernError::OutOfRange);
        }

        Ok(())
    }

    /// Allocate a block of exactly 2^order frames, naturally aligned
    pub fn alloc(&mut self, order: usize) -> KernResult<PhysAddr> {
        if order > MAX_ORDER {
            return Err(KernError::InvalidArgument);
        }
        self.admit(order)?;

        // Find the smallest populated order at or above the request
        let mut current = order;
        while current <= MAX_ORDER && self.free_lists[current].is_empty() {
            current += 1;
        }
        if current > MAX_ORDER {
            log_warn!("pmm", "out of memory at order {}", order);
            return Err(KernError::OutOfMemory);
        }

        let mut block = self.free_lists[current].pop().ok_or(KernError::OutOfMemory)?;

        // Split down, keeping the lower half each time
        while current > order {
            current -= 1;
            let upper = block + bytes_for_order(current);
            self.free_lists[current].push(upper);
        }

        self.free_frames -= frames_for_order(order);
        Ok(block)
    }

    /// Free a block previously returned by `alloc` with the same order
    ///
    /// Freeing the null address is a no-op. The allocator records no
    /// per-block order; a wrong order corrupts the free lists.
    pub fn free(&mut self, block: PhysAddr, order: usize) {
        if block == 0 || order > MAX_ORDER {
            return;
        }

        // Only the frames being returned become free; absorbed buddies
        // were already in the free count.
        self.free_frames += frames_for_order(order);

        let mut block = block;
        let mut order = order;

        // Coalesce with the buddy while it is free at the same order
        while order < MAX_ORDER {
            let buddy = block ^ bytes_for_order(order);
            let list = &mut self.free_lists[order];
            match list.iter().position(|&b| b == buddy) {
                Some(idx) => {
                    list.swap_remove(idx);
                    block = block.min(buddy);
                    order += 1;
                }
                None => break,
            }
        }

        self.free_lists[order].push(block);
    }

    /// Allocate at least `bytes`, rounded up to a whole block
    pub fn alloc_bytes(&mut self, bytes: u64) -> KernResult<PhysAddr> {
        if bytes == 0 {
            return Err(KernError::InvalidArgument);
        }
        let pages = (bytes + PAGE_SIZE as u64 - 1) / PAGE_SIZE as u64;
        self.alloc(order_for_pages(pages))
    }

    /// Free a block allocated with `alloc_bytes` of the same size
    pub fn free_bytes(&mut self, block: PhysAddr, bytes: u64) {
        if block == 0 || bytes == 0 {
            return;
        }
        let pages = (bytes + PAGE_SIZE as u64 - 1) / PAGE_SIZE as u64;
        self.free(block, order_for_pages(pages));
    }

    /// Statistics snapshot
    pub fn stats(&self) -> FrameStats {
        FrameStats {
            total_frames: self.total_frames,
            free_frames: self.free_frames,
            used_frames: self.total_frames - self.free_frames,
        }
    }

    /// Free block count at a single order (debugging)
    pub fn free_blocks_at(&self, order: usize) -> usize {
        if order > MAX_ORDER {
            return 0;
        }
        self.free_lists[order].len()
    }

    /// Log current usage at Info level
    pub fn log_stats(&self) {
        let stats = self.stats();
        log_info!(
            "pmm",
            "frames: total {}, free {}, used {}",
            stats.total_frames,
            stats.free_frames,
            stats.used_frames
        );
    }
}

/// Global allocator instance
static FRAME_ALLOCATOR: Mutex<FrameAllocator> = Mutex::new(FrameAllocator::new());

/// Seed the global allocator from the boot memory map
pub fn set_memory_map(regions: &[MemoryRegion]) {
    FRAME_ALLOCATOR.lock().set_memory_map(regions);
}

/// Allocate a block of 2^order frames
pub fn alloc(order: usize) -> KernResult<PhysAddr> {
    FRAME_ALLOCATOR.lock().alloc(order)
}

/// Free a block of 2^order frames
pub fn free(block: PhysAddr, order: usize) {
    FRAME_ALLOCATOR.lock().free(block, order)
}

/// Allocate at least `bytes`
pub fn alloc_bytes(bytes: u64) -> KernResult<PhysAddr> {
    FRAME_ALLOCATOR.lock().alloc_bytes(bytes)
}

/// Free a block allocated with `alloc_bytes`
pub fn free_bytes(block: PhysAddr, bytes: u64) {
    FRAME_ALLOCATOR.lock().free_bytes(block, bytes)
}

/// Global statistics snapshot
pub fn stats() -> FrameStats {
    FRAME_ALLOCATOR.lock().stats()
}

/// Log global usage
pub fn log_stats() {
    FRAME_ALLOCATOR.lock().log_stats()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::RegionKind;

    fn region(base: u64, length: u64) -> MemoryRegion {
        MemoryRegion {
            base,
            length,
            kind: RegionKind::Available,
        }
    }

    fn allocator_with(mb: u64) -> FrameAllocator {
        let mut pfa = FrameAllocator::new();
        pfa.set_memory_map(&[region(0x100_0000, mb * 1024 * 1024)]);
        pfa
    }

    /// Sum of 2^k * |list[k]| across all orders
    fn free_frames_by_lists(pfa: &FrameAllocator) -> u64 {
        (0..=MAX_ORDER)
            .map(|k| frames_for_order(k) * pfa.free_blocks_at(k) as u64)
            .sum()
    }

    #[test]
    fn test_seed_counts() {
        let pfa = allocator_with(64);
        let stats = pfa.stats();
        assert_eq!(stats.total_frames, 64 * 1024 * 1024 / PAGE_SIZE as u64);
        assert_eq!(stats.free_frames, stats.total_frames);
        assert_eq!(stats.used_frames, 0);
    }

    #[test]
    fn test_reserved_regions_ignored() {
        let mut pfa = FrameAllocator::new();
        pfa.set_memory_map(&[
            region(0x100_0000, 4 * 1024 * 1024),
            MemoryRegion {
                base: 0x800_0000,
                length: 1024 * 1024,
                kind: RegionKind::Reserved,
            },
        ]);
        assert_eq!(pfa.stats().total_frames, 1024);
    }

    #[test]
    fn test_alloc_is_aligned() {
        let mut pfa = allocator_with(64);
        for order in [0usize, 1, 3, 5] {
            let block = pfa.alloc(order).unwrap();
            assert_eq!(block % bytes_for_order(order), 0, "order {}", order);
        }
    }

    #[test]
    fn test_split_hands_out_buddies() {
        // Spec scenario: two order-0 allocations from one region are
        // buddies of each other.
        let mut pfa = allocator_with(64);
        let p0 = pfa.alloc(0).unwrap();
        let p1 = pfa.alloc(0).unwrap();
        assert_eq!(p1, p0 ^ PAGE_SIZE as u64);
    }

    #[test]
    fn test_free_coalesces_buddies() {
        let mut pfa = allocator_with(64);
        let total = pfa.stats().total_frames;

        let p0 = pfa.alloc(0).unwrap();
        let p1 = pfa.alloc(0).unwrap();
        pfa.free(p0, 0);
        pfa.free(p1, 0);

        assert_eq!(pfa.stats().free_frames, total);
        // The pair must have merged: nothing left at order 0
        assert_eq!(pfa.free_blocks_at(0), 0);
    }

    #[test]
    fn test_alloc_free_restores_stats() {
        let mut pfa = allocator_with(64);
        let before = pfa.stats();

        for order in [0usize, 2, 4] {
            let block = pfa.alloc(order).unwrap();
            assert_eq!(
                pfa.stats().free_frames,
                before.free_frames - frames_for_order(order)
            );
            pfa.free(block, order);
            assert_eq!(pfa.stats(), before);
        }
    }

    #[test]
    fn test_frame_accounting_invariant() {
        let mut pfa = allocator_with(64);
        let total = pfa.stats().total_frames;

        let a = pfa.alloc(3).unwrap();
        let b = pfa.alloc(0).unwrap();
        let stats = pfa.stats();
        assert_eq!(free_frames_by_lists(&pfa) + stats.used_frames, total);

        pfa.free(a, 3);
        pfa.free(b, 0);
        let stats = pfa.stats();
        assert_eq!(free_frames_by_lists(&pfa) + stats.used_frames, total);
        assert_eq!(stats.used_frames, 0);
    }

    #[test]
    fn test_admission_rejects_half_of_memory() {
        // 128 MiB total; a block of exactly half of it is rejected
        let mut pfa = allocator_with(128);
        let half_order = order_for_pages(pfa.stats().total_frames / 2);
        assert_eq!(pfa.alloc(half_order), Err(KernError::OutOfRange));
    }

    #[test]
    fn test_admission_rejects_oversize() {
        let mut pfa = allocator_with(128);
        // 200 MiB exceeds both total memory and the single-allocation cap
        assert_eq!(pfa.alloc_bytes(200 * 1024 * 1024), Err(KernError::OutOfRange));
        // MAX_ORDER is 4 GiB; never a panic, always a rejection
        assert!(pfa.alloc(MAX_ORDER).is_err());
        assert_eq!(pfa.alloc(MAX_ORDER + 1), Err(KernError::InvalidArgument));
    }

    #[test]
    fn test_out_of_memory_when_exhausted() {
        let mut pfa = FrameAllocator::new();
        // 32 frames total so order 3 (8 frames) passes admission
        pfa.set_memory_map(&[region(0x100_0000, 32 * PAGE_SIZE as u64)]);

        let mut blocks = Vec::new();
        loop {
            match pfa.alloc(2) {
                Ok(b) => blocks.push(b),
                Err(e) => {
                    assert_eq!(e, KernError::OutOfMemory);
                    break;
                }
            }
        }
        assert!(!blocks.is_empty());
        assert_eq!(pfa.stats().free_frames, 0);

        for b in blocks {
            pfa.free(b, 2);
        }
        assert_eq!(pfa.stats().used_frames, 0);
    }

    #[test]
    fn test_free_null_is_noop() {
        let mut pfa = allocator_with(64);
        let before = pfa.stats();
        pfa.free(0, 0);
        assert_eq!(pfa.stats(), before);
    }

    #[test]
    fn test_alloc_bytes_rounds_up() {
        let mut pfa = allocator_with(64);
        let before = pfa.stats().free_frames;
        // 3 pages round up to an order-2 block
        let block = pfa.alloc_bytes(3 * PAGE_SIZE as u64).unwrap();
        assert_eq!(pfa.stats().free_frames, before - 4);
        pfa.free_bytes(block, 3 * PAGE_SIZE as u64);
        assert_eq!(pfa.stats().free_frames, before);
    }

    #[test]
    fn test_unaligned_region_is_trimmed() {
        let mut pfa = FrameAllocator::new();
        pfa.set_memory_map(&[region(0x100_0800, 8 * PAGE_SIZE as u64)]);
        // Base rounds up, end rounds down: one frame is lost
        assert_eq!(pfa.stats().total_frames, 7);
    }

    #[test]
    fn test_order_for_pages() {
        assert_eq!(order_for_pages(1), 0);
        assert_eq!(order_for_pages(2), 1);
        assert_eq!(order_for_pages(3), 2);
        assert_eq!(order_for_pages(4), 2);
        assert_eq!(order_for_pages(5), 3);
    }
}
