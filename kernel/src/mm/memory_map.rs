//! Physical memory map
//!
//! Collects the ranges reported by the firmware (via the boot handoff)
//! into a normalized map. Overlapping reports are common; the ordered
//! `MemoryType` enum decides who wins the overlap.

use alloc::vec::Vec;

use crate::bootinfo::{MemoryFlags, MemoryType};
use crate::mm::{align_down, align_up, PAGE_SIZE};

/// One normalized memory range, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub mem_type: MemoryType,
    pub flags: MemoryFlags,
    pub start: u64,
    pub size: u64,
}

impl MemoryRegion {
    pub const fn end(&self) -> u64 {
        self.start + self.size
    }
}

/// The sanitized memory map.
///
/// Invariants after `sanitize()`: regions are sorted by start, non-empty,
/// page-aligned at both endpoints, non-overlapping, and adjacent regions
/// of the same `(type, flags)` are coalesced.
#[derive(Debug, Default)]
pub struct MemoryMap {
    regions: Vec<MemoryRegion>,
}

impl MemoryMap {
    pub const fn new() -> Self {
        Self { regions: Vec::new() }
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Add a range as reported by the firmware.
    ///
    /// Page rounding is conservative: `Available` memory shrinks inward
    /// to whole pages (we must not hand out partial pages), every other
    /// type expands outward (we must not hand out memory the firmware
    /// said is not ours).
    pub fn add(&mut self, mem_type: MemoryType, flags: MemoryFlags, start: u64, size: u64) {
        if size == 0 {
            return;
        }

        let page = PAGE_SIZE as u64;
        let (start, end) = match mem_type {
            MemoryType::Available => {
                let s = align_up(start, page);
                let e = align_down(start.saturating_add(size), page);
                (s, e)
            }
            _ => {
                let s = align_down(start, page);
                let e = align_up(start.saturating_add(size), page);
                (s, e)
            }
        };
        if start >= end {
            return;
        }

        self.regions.push(MemoryRegion {
            mem_type,
            flags,
            start,
            size: end - start,
        });
    }

    /// Normalize the map: resolve overlaps by type precedence, drop
    /// empty ranges, sort, and coalesce. Idempotent.
    pub fn sanitize(&mut self) {
        if self.regions.is_empty() {
            return;
        }

        // Every region start/end is a boundary; between two consecutive
        // boundaries the winning region is the one with the highest type.
        let mut bounds: Vec<u64> = Vec::with_capacity(self.regions.len() * 2);
        for r in &self.regions {
            bounds.push(r.start);
            bounds.push(r.end());
        }
        bounds.sort_unstable();
        bounds.dedup();

        let mut result: Vec<MemoryRegion> = Vec::with_capacity(self.regions.len());
        for window in bounds.windows(2) {
            let (lo, hi) = (window[0], window[1]);
            let winner = self
                .regions
                .iter()
                .filter(|r| r.start < hi && r.end() > lo)
                .max_by_key(|r| r.mem_type);

            let Some(winner) = winner else { continue };

            let piece = MemoryRegion {
                mem_type: winner.mem_type,
                flags: winner.flags,
                start: lo,
                size: hi - lo,
            };

            match result.last_mut() {
                Some(last)
                    if last.end() == piece.start
                        && last.mem_type == piece.mem_type
                        && last.flags == piece.flags =>
                {
                    last.size += piece.size;
                }
                _ => result.push(piece),
            }
        }

        self.regions = result;
    }

    /// Total bytes of a given type (post-sanitize)
    pub fn total_bytes(&self, mem_type: MemoryType) -> u64 {
        self.regions
            .iter()
            .filter(|r| r.mem_type == mem_type)
            .map(|r| r.size)
            .sum()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn region(mem_type: MemoryType, start: u64, size: u64) -> MemoryRegion {
        MemoryRegion {
            mem_type,
            flags: MemoryFlags::empty(),
            start,
            size,
        }
    }

    #[test]
    fn test_sanitize_resolves_overlap_by_precedence() {
        // [0..0x1000 Available), [0x2000..0x3000 Reserved),
        // [0x2800..0x4000 Available) -> the Reserved range wins the
        // overlap, Available keeps the remainder.
        let mut map = MemoryMap::new();
        map.add(MemoryType::Available, MemoryFlags::empty(), 0, 0x1000);
        map.add(MemoryType::Reserved, MemoryFlags::empty(), 0x2000, 0x1000);
        map.add(MemoryType::Available, MemoryFlags::empty(), 0x2800, 0x1800);
        map.sanitize();

        assert_eq!(
            map.regions(),
            &[
                region(MemoryType::Available, 0, 0x1000),
                region(MemoryType::Reserved, 0x2000, 0x1000),
                region(MemoryType::Available, 0x3000, 0x1000),
            ]
        );
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        let mut map = MemoryMap::new();
        map.add(MemoryType::Available, MemoryFlags::empty(), 0x10_0000, 0x40_0000);
        map.add(MemoryType::Kernel, MemoryFlags::empty(), 0x20_0000, 0x10_0000);
        map.add(MemoryType::Bootloader, MemoryFlags::empty(), 0x28_0000, 0x20_0000);
        map.sanitize();
        let once: Vec<_> = map.regions().to_vec();
        map.sanitize();
        assert_eq!(map.regions(), &once[..]);
    }

    #[test]
    fn test_adjacent_equal_regions_coalesce() {
        let mut map = MemoryMap::new();
        map.add(MemoryType::Available, MemoryFlags::empty(), 0x1000, 0x1000);
        map.add(MemoryType::Available, MemoryFlags::empty(), 0x2000, 0x1000);
        map.sanitize();
        assert_eq!(map.regions(), &[region(MemoryType::Available, 0x1000, 0x2000)]);
    }

    #[test]
    fn test_adjacent_different_flags_do_not_coalesce() {
        let mut map = MemoryMap::new();
        map.add(MemoryType::Available, MemoryFlags::empty(), 0x1000, 0x1000);
        map.add(MemoryType::Available, MemoryFlags::WB, 0x2000, 0x1000);
        map.sanitize();
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_available_rounds_inward() {
        let mut map = MemoryMap::new();
        map.add(MemoryType::Available, MemoryFlags::empty(), 0x1001, 0x2000);
        map.sanitize();
        assert_eq!(map.regions(), &[region(MemoryType::Available, 0x2000, 0x1000)]);
    }

    #[test]
    fn test_reserved_rounds_outward() {
        let mut map = MemoryMap::new();
        map.add(MemoryType::Reserved, MemoryFlags::empty(), 0x1001, 0x10);
        map.sanitize();
        assert_eq!(map.regions(), &[region(MemoryType::Reserved, 0x1000, 0x1000)]);
    }

    #[test]
    fn test_zero_and_subpage_available_dropped() {
        let mut map = MemoryMap::new();
        map.add(MemoryType::Available, MemoryFlags::empty(), 0x1800, 0x200);
        map.add(MemoryType::Available, MemoryFlags::empty(), 0x9000, 0);
        map.sanitize();
        assert!(map.is_empty());
    }

    #[test]
    fn test_higher_type_fully_covers_lower() {
        let mut map = MemoryMap::new();
        map.add(MemoryType::Available, MemoryFlags::empty(), 0x1000, 0x4000);
        map.add(MemoryType::AcpiNvs, MemoryFlags::empty(), 0x2000, 0x1000);
        map.sanitize();
        assert_eq!(
            map.regions(),
            &[
                region(MemoryType::Available, 0x1000, 0x1000),
                region(MemoryType::AcpiNvs, 0x2000, 0x1000),
                region(MemoryType::Available, 0x3000, 0x2000),
            ]
        );
    }
}
