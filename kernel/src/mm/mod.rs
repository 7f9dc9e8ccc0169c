//! Memory management
//!
//! Physical addresses, the virtual-address-space layout contract shared
//! with the bootloader, the physical frame allocator, and per-task
//! address spaces.

pub mod address_space;
pub mod frame_allocator;
pub mod heap;
pub mod memory_map;
pub mod page_fault;

pub use address_space::AddressSpace;
pub use frame_allocator::{FrameAllocator, FrameNumber, FRAME_ALLOCATOR};
pub use memory_map::{MemoryMap, MemoryRegion};

use crate::bootinfo::BootInfo;
use crate::error::{KernelError, Result};

/// Size of a page / physical frame
pub const PAGE_SIZE: usize = 4096;

/// log2(PAGE_SIZE)
pub const PAGE_SHIFT: usize = 12;

/// Size of a large (level 2) page on both architectures
pub const LARGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// Size of a huge (level 3) page
pub const HUGE_PAGE_SIZE: usize = 1024 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Virtual address space layout (shared contract with the bootloader)
// ---------------------------------------------------------------------------
//
//  0x00000000_00000000 - 0x00007FFF_FFFFFFFF   User space
//  0xFFFF8000_00000000 - ...                   Direct map of physical RAM
//  0xFFFFFF00_00000000 - 0xFFFFFF7F_FFFFFFFF   Recursive PML1 window
//  0xFFFFFF7F_80000000 - 0xFFFFFF7F_BFFFFFFF   Recursive PML2 window
//  0xFFFFFF7F_BFC00000 - 0xFFFFFF7F_BFDFFFFF   Recursive PML3 window
//  0xFFFFFF7F_BFDFE000 - 0xFFFFFF7F_BFDFEFFF   Recursive PML4 page
//  0xFFFFFFFF_80000000 - 0xFFFFFFFF_FFFFFFFF   Kernel image and heap

/// First address past user space
pub const USER_SPACE_END: u64 = 0x0000_8000_0000_0000;

/// Base of the direct map of all physical memory
pub const PHYS_MAP_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Base of the kernel image mapping
pub const KERNEL_BASE: u64 = 0xFFFF_FFFF_8000_0000;

/// Kernel heap placement
pub const KERNEL_HEAP_BASE: u64 = 0xFFFF_FFFF_C000_0000;
pub const KERNEL_HEAP_SIZE: usize = 16 * 1024 * 1024;

/// Kernel stack area: one 4 KiB stack frame per slot, with an unmapped
/// guard slot between consecutive stacks.
pub const KERNEL_STACKS_BASE: u64 = 0xFFFF_FFFF_D000_0000;

/// Fixed user-space address of the VDSO page
pub const VDSO_BASE: u64 = 0x0000_7FFF_FFE0_0000;

/// Default user stack placement: `[top, bottom)`, the page at `top` is
/// the guard page.
pub const USER_STACK_TOP: u64 = 0x0000_7FFF_FFF0_0000;
pub const USER_STACK_BOTTOM: u64 = USER_SPACE_END;

/// Physical memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysicalAddress(pub u64);

impl PhysicalAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.0 & (PAGE_SIZE as u64 - 1) == 0
    }

    pub const fn offset(&self, offset: u64) -> Self {
        Self(self.0 + offset)
    }
}

/// Virtual memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtualAddress(pub u64);

impl VirtualAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }

    pub const fn as_ptr<T>(&self) -> *const T {
        self.0 as usize as *const T
    }

    pub const fn as_mut_ptr<T>(&self) -> *mut T {
        self.0 as usize as *mut T
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.0 & (PAGE_SIZE as u64 - 1) == 0
    }

    pub const fn offset(&self, offset: u64) -> Self {
        Self(self.0 + offset)
    }

    /// Is this address in the user half?
    pub const fn is_user(&self) -> bool {
        self.0 < USER_SPACE_END
    }

    /// Is this address in the kernel half?
    pub const fn is_kernel(&self) -> bool {
        self.0 >= PHYS_MAP_BASE
    }
}

/// The closed set of page mapping types. The architecture layer maps
/// each to its native flag mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    KernelCode,
    KernelDataRo,
    KernelDataRw,
    UserCode,
    UserDataRo,
    UserDataRw,
    Mmio,
    VideoFramebuffer,
}

impl PageType {
    /// Does this type produce user-accessible mappings?
    pub const fn is_user(&self) -> bool {
        matches!(self, PageType::UserCode | PageType::UserDataRo | PageType::UserDataRw)
    }
}

/// Round `value` up to the next multiple of `align` (a power of two).
pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// Round `value` down to a multiple of `align` (a power of two).
pub const fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

/// Number of whole pages needed to hold `bytes` bytes.
pub const fn page_count(bytes: u64) -> u64 {
    align_up(bytes, PAGE_SIZE as u64) >> PAGE_SHIFT
}

/// Translate a physical address through the direct map.
pub const fn phys_to_virt(phys: PhysicalAddress) -> VirtualAddress {
    VirtualAddress::new(PHYS_MAP_BASE + phys.as_u64())
}

/// Initialize memory management from the boot handoff: sanitize the
/// memory map, donate `Available` ranges to the frame allocator, and
/// bring up the kernel heap.
pub fn init(boot_info: &BootInfo) {
    // The heap arena lives in the kernel image, so it can (and must)
    // come up before the PMM: the memory map and free-range bookkeeping
    // below already allocate.
    heap::init().expect("failed to initialize kernel heap");

    // SAFETY: the descriptors were validated and bootloader memory has
    // not been reclaimed this early in boot.
    let descriptors = unsafe { boot_info.memory_descriptors() };

    let mut map = MemoryMap::new();
    for desc in descriptors {
        map.add(
            crate::bootinfo::MemoryType::from_raw(desc.mem_type),
            crate::bootinfo::MemoryFlags::from_bits_truncate(desc.flags),
            desc.address,
            desc.size,
        );
    }
    map.sanitize();

    for region in map.regions() {
        log::debug!(
            "memory: {:#018x}..{:#018x} {:?}",
            region.start,
            region.start + region.size,
            region.mem_type
        );
    }

    frame_allocator::init(&map);
}

/// Validate a user-supplied buffer: entirely in the user half and not
/// wrapping around.
pub fn check_user_range(addr: u64, len: u64) -> Result<()> {
    let end = addr.checked_add(len).ok_or(KernelError::InvalidArguments)?;
    if end > USER_SPACE_END {
        return Err(KernelError::InvalidArguments);
    }
    Ok(())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_align_helpers() {
        assert_eq!(align_up(0, 4096), 0);
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_down(4097, 4096), 4096);
        assert_eq!(page_count(0), 0);
        assert_eq!(page_count(1), 1);
        assert_eq!(page_count(4096), 1);
        assert_eq!(page_count(4097), 2);
    }

    #[test]
    fn test_address_halves() {
        assert!(VirtualAddress::new(0x1000).is_user());
        assert!(!VirtualAddress::new(USER_SPACE_END).is_user());
        assert!(VirtualAddress::new(KERNEL_BASE).is_kernel());
        assert!(VirtualAddress::new(PHYS_MAP_BASE).is_kernel());
    }

    #[test]
    fn test_check_user_range() {
        assert!(check_user_range(0x1000, 0x1000).is_ok());
        assert!(check_user_range(USER_SPACE_END - 0x1000, 0x1000).is_ok());
        assert!(check_user_range(USER_SPACE_END - 0x1000, 0x1001).is_err());
        assert!(check_user_range(u64::MAX, 2).is_err());
    }
}
