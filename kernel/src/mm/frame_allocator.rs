//! Physical frame allocator
//!
//! Owns the set of free physical frames as a sorted, coalesced list of
//! ranges. Allocation prefers the highest suitable range so low memory
//! stays available for callers that need it (32-bit table roots for SMP
//! trampolines, ISA-style DMA).

use alloc::vec::Vec;

use spin::Mutex;

use crate::bootinfo::MemoryType;
use crate::error::{KernelError, Result};
use crate::mm::{MemoryMap, PhysicalAddress, PAGE_SHIFT, PAGE_SIZE};

/// Address ceiling used by `allocate_below` callers that do not supply
/// their own (4 GiB).
pub const DEFAULT_BELOW_LIMIT: u64 = 1 << 32;

/// Physical frame number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameNumber(u64);

impl FrameNumber {
    pub const fn new(num: u64) -> Self {
        Self(num)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn as_addr(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 << PAGE_SHIFT)
    }

    pub const fn from_addr(addr: PhysicalAddress) -> Self {
        Self(addr.as_u64() >> PAGE_SHIFT)
    }
}

/// A contiguous run of free frames `[start, start + count)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameRange {
    start: u64,
    count: u64,
}

impl FrameRange {
    const fn end(&self) -> u64 {
        self.start + self.count
    }
}

/// Allocator statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameAllocatorStats {
    pub total_frames: u64,
    pub free_frames: u64,
    /// Highest physical frame ever donated (exclusive)
    pub highest_frame: u64,
}

/// The physical memory manager.
///
/// The free set is a disjoint union of ranges sorted by start frame.
/// Ranges never cross what was originally a non-`Available` region
/// because donation happens per sanitized region.
pub struct FrameAllocator {
    free: Vec<FrameRange>,
    total_frames: u64,
    free_frames: u64,
    highest_frame: u64,
}

impl FrameAllocator {
    pub const fn new() -> Self {
        Self {
            free: Vec::new(),
            total_frames: 0,
            free_frames: 0,
            highest_frame: 0,
        }
    }

    /// Donate the frames of an `Available` region.
    pub fn donate(&mut self, start: PhysicalAddress, bytes: u64) {
        debug_assert!(start.is_page_aligned());
        let count = bytes >> PAGE_SHIFT;
        if count == 0 {
            return;
        }
        let start = start.as_u64() >> PAGE_SHIFT;
        self.total_frames += count;
        self.free_frames += count;
        if start + count > self.highest_frame {
            self.highest_frame = start + count;
        }
        self.insert(FrameRange { start, count });
    }

    /// Allocate `count` physically contiguous frames, preferring the
    /// highest suitable range.
    pub fn allocate(&mut self, count: usize) -> Result<FrameNumber> {
        self.allocate_below(count, u64::MAX)
    }

    /// Allocate `count` contiguous frames entirely below `max_address`.
    pub fn allocate_below(&mut self, count: usize, max_address: u64) -> Result<FrameNumber> {
        if count == 0 {
            return Err(KernelError::InvalidArguments);
        }
        let count = count as u64;
        let frame_limit = max_address >> PAGE_SHIFT;

        // Scan from the top: the first fit from the back is the highest.
        for i in (0..self.free.len()).rev() {
            let range = self.free[i];
            let usable_end = range.end().min(frame_limit);
            if usable_end <= range.start || usable_end - range.start < count {
                continue;
            }

            // Take from the top of the usable part.
            let alloc_start = usable_end - count;
            self.remove_span(i, alloc_start, count);
            self.free_frames -= count;
            return Ok(FrameNumber::new(alloc_start));
        }

        Err(KernelError::OutOfMemory)
    }

    /// Return `count` frames starting at `frame` to the free set.
    ///
    /// Double-freeing is a programming error; detection is best-effort
    /// (overlap with an existing free range is rejected).
    pub fn free(&mut self, frame: FrameNumber, count: usize) -> Result<()> {
        if count == 0 {
            return Err(KernelError::InvalidArguments);
        }
        let range = FrameRange {
            start: frame.as_u64(),
            count: count as u64,
        };
        // Overlap with the free set means the caller freed something
        // it did not own.
        for r in &self.free {
            if range.start < r.end() && range.end() > r.start {
                log::error!(
                    "pmm: double free of frames {:#x}..{:#x}",
                    range.start,
                    range.end()
                );
                return Err(KernelError::InvalidArguments);
            }
        }
        self.free_frames += range.count;
        self.insert(range);
        Ok(())
    }

    pub fn stats(&self) -> FrameAllocatorStats {
        FrameAllocatorStats {
            total_frames: self.total_frames,
            free_frames: self.free_frames,
            highest_frame: self.highest_frame,
        }
    }

    /// Insert a range keeping the list sorted and coalesced.
    fn insert(&mut self, range: FrameRange) {
        let pos = self
            .free
            .iter()
            .position(|r| r.start > range.start)
            .unwrap_or(self.free.len());
        self.free.insert(pos, range);

        // Coalesce with the successor first, then the predecessor.
        if pos + 1 < self.free.len() && self.free[pos].end() == self.free[pos + 1].start {
            self.free[pos].count += self.free[pos + 1].count;
            self.free.remove(pos + 1);
        }
        if pos > 0 && self.free[pos - 1].end() == self.free[pos].start {
            self.free[pos - 1].count += self.free[pos].count;
            self.free.remove(pos);
        }
    }

    /// Carve `[start, start + count)` out of `self.free[index]`.
    fn remove_span(&mut self, index: usize, start: u64, count: u64) {
        let range = self.free[index];
        debug_assert!(start >= range.start && start + count <= range.end());

        let before = start - range.start;
        let after = range.end() - (start + count);

        match (before, after) {
            (0, 0) => {
                self.free.remove(index);
            }
            (0, _) => {
                self.free[index].start = start + count;
                self.free[index].count = after;
            }
            (_, 0) => {
                self.free[index].count = before;
            }
            (_, _) => {
                self.free[index].count = before;
                self.free.insert(
                    index + 1,
                    FrameRange {
                        start: start + count,
                        count: after,
                    },
                );
            }
        }
    }
}

impl Default for FrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Global frame allocator
pub static FRAME_ALLOCATOR: Mutex<FrameAllocator> = Mutex::new(FrameAllocator::new());

/// Build the global allocator from a sanitized memory map.
pub fn init(map: &MemoryMap) {
    let mut pmm = FRAME_ALLOCATOR.lock();
    for region in map.regions() {
        if region.mem_type == MemoryType::Available {
            pmm.donate(PhysicalAddress::new(region.start), region.size);
        }
    }
    let stats = pmm.stats();
    log::info!(
        "pmm: {} MiB free in {} frames",
        (stats.free_frames as usize * PAGE_SIZE) / (1024 * 1024),
        stats.free_frames
    );
}

/// Allocate frames from the global allocator.
pub fn allocate_frames(count: usize) -> Result<FrameNumber> {
    FRAME_ALLOCATOR.lock().allocate(count)
}

/// Free frames to the global allocator.
pub fn free_frames(frame: FrameNumber, count: usize) -> Result<()> {
    FRAME_ALLOCATOR.lock().free(frame, count)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn pmm_with(ranges: &[(u64, u64)]) -> FrameAllocator {
        let mut pmm = FrameAllocator::new();
        for &(start, bytes) in ranges {
            pmm.donate(PhysicalAddress::new(start), bytes);
        }
        pmm
    }

    #[test]
    fn test_zero_count_is_invalid() {
        let mut pmm = pmm_with(&[(0x10_0000, 0x10_0000)]);
        assert_eq!(pmm.allocate(0), Err(KernelError::InvalidArguments));
        assert_eq!(
            pmm.free(FrameNumber::new(0x100), 0),
            Err(KernelError::InvalidArguments)
        );
    }

    #[test]
    fn test_round_trip_restores_free_set() {
        let mut pmm = pmm_with(&[(0x10_0000, 0x40_0000)]);
        let before = pmm.free.clone();
        for count in [1usize, 2, 7, 64] {
            let frame = pmm.allocate(count).unwrap();
            pmm.free(frame, count).unwrap();
            assert_eq!(pmm.free, before);
            assert_eq!(pmm.stats().free_frames, 0x400);
        }
    }

    #[test]
    fn test_no_double_allocate() {
        let mut pmm = pmm_with(&[(0x10_0000, 0x10_0000)]);
        let a = pmm.allocate(4).unwrap().as_u64();
        let b = pmm.allocate(4).unwrap().as_u64();
        assert!(a + 4 <= b || b + 4 <= a);
    }

    #[test]
    fn test_highest_range_preferred() {
        let mut pmm = pmm_with(&[(0x10_0000, 0x1000), (0x100_0000, 0x1000)]);
        let frame = pmm.allocate(1).unwrap();
        assert_eq!(frame.as_addr().as_u64(), 0x100_0000);
    }

    #[test]
    fn test_allocate_below_respects_limit() {
        // One range below 4 GiB, one above.
        let mut pmm = pmm_with(&[(0x10_0000, 0x1000), (0x1_0000_0000, 0x10_0000)]);
        let frame = pmm.allocate_below(1, DEFAULT_BELOW_LIMIT).unwrap();
        assert!(frame.as_addr().as_u64() < DEFAULT_BELOW_LIMIT);
        assert_eq!(frame.as_addr().as_u64(), 0x10_0000);
    }

    #[test]
    fn test_allocate_below_straddling_range() {
        // A single range straddling the limit: only the part below is
        // usable.
        let mut pmm = pmm_with(&[(0xFFFF_F000, 0x3000)]);
        let frame = pmm.allocate_below(1, DEFAULT_BELOW_LIMIT).unwrap();
        assert_eq!(frame.as_addr().as_u64(), 0xFFFF_F000);
    }

    #[test]
    fn test_pressure_until_out_of_memory() {
        let mut pmm = pmm_with(&[(0x10_0000, 16 * 0x1000)]);
        let mut allocated = Vec::new();
        loop {
            match pmm.allocate(1) {
                Ok(frame) => allocated.push(frame),
                Err(err) => {
                    assert_eq!(err, KernelError::OutOfMemory);
                    break;
                }
            }
        }
        assert_eq!(allocated.len(), 16);

        // Freeing any single frame makes the next allocation succeed
        // with that exact frame.
        let victim = allocated[7];
        pmm.free(victim, 1).unwrap();
        assert_eq!(pmm.allocate(1).unwrap(), victim);
    }

    #[test]
    fn test_double_free_detected() {
        let mut pmm = pmm_with(&[(0x10_0000, 0x10_0000)]);
        let frame = pmm.allocate(4).unwrap();
        pmm.free(frame, 4).unwrap();
        assert_eq!(pmm.free(frame, 4), Err(KernelError::InvalidArguments));
    }

    #[test]
    fn test_contiguous_requirement() {
        // Two one-page islands cannot satisfy a two-page request.
        let mut pmm = pmm_with(&[(0x10_0000, 0x1000), (0x30_0000, 0x1000)]);
        assert_eq!(pmm.allocate(2), Err(KernelError::OutOfMemory));
    }

    #[test]
    fn test_free_coalesces_ranges() {
        let mut pmm = pmm_with(&[(0x10_0000, 0x4000)]);
        let a = pmm.allocate(2).unwrap();
        let b = pmm.allocate(2).unwrap();
        pmm.free(a, 2).unwrap();
        pmm.free(b, 2).unwrap();
        assert_eq!(pmm.free.len(), 1);
        assert_eq!(pmm.stats().free_frames, 4);
    }
}
