//! aarch64 Stage 1 page-table plumbing
//!
//! The same recursive self-map as on x86_64: level-0 slot 510 points
//! back at the level-0 table, exposing every level of the hierarchy
//! through fixed windows. The window addresses are identical to the
//! x86_64 ones because both architectures use 48-bit, 4-level, 9-bit
//! translation with 4 KiB granules.

use core::arch::asm;

use bitflags::bitflags;

use crate::error::{KernelError, Result};
use crate::mm::frame_allocator;
use crate::mm::{
    phys_to_virt, PageType, PhysicalAddress, VirtualAddress, LARGE_PAGE_SIZE, PAGE_SIZE,
    PHYS_MAP_BASE,
};

/// The level-0 slot used for the recursive self-map
pub const RECURSIVE_SLOT: usize = 510;

/// First level-0 slot belonging to the kernel half
pub const KERNEL_FIRST_SLOT: usize = 256;

bitflags! {
    /// Stage 1 descriptor attributes (ARM ARM, 4 KiB granule)
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u64 {
        /// Descriptor is valid
        const VALID       = 1 << 0;
        /// Table descriptor (non-leaf) or page descriptor (level 3);
        /// clear in a block (large page) descriptor
        const PAGE        = 1 << 1;
        /// MAIR index 1 (device memory)
        const DEVICE      = 1 << 2;
        /// MAIR index 2 (normal non-cacheable, framebuffers)
        const NON_CACHE   = 2 << 2;
        /// EL0 accessible
        const USER        = 1 << 6;
        /// Read-only
        const READ_ONLY   = 1 << 7;
        /// Inner shareable
        const INNER_SHARE = 3 << 8;
        /// Access flag; a clear AF faults on first access
        const ACCESS_FLAG = 1 << 10;
        /// Not global (user mappings; kernel entries stay global)
        const NOT_GLOBAL  = 1 << 11;
        /// Privileged execute-never
        const PXN         = 1 << 53;
        /// Unprivileged execute-never
        const UXN         = 1 << 54;
    }
}

/// Mask extracting the physical address from a descriptor
pub const ADDRESS_MASK: u64 = 0x0000_FFFF_FFFF_F000;

// The four recursive windows, shared layout with x86_64.
const PML4: *mut u64 = 0xFFFF_FF7F_BFDF_E000usize as *mut u64;
const PML3: *mut u64 = 0xFFFF_FF7F_BFC0_0000usize as *mut u64;
const PML2: *mut u64 = 0xFFFF_FF7F_8000_0000usize as *mut u64;
const PML1: *mut u64 = 0xFFFF_FF00_0000_0000usize as *mut u64;

#[inline]
pub const fn pml4_index(va: u64) -> usize {
    ((va >> 39) & 0x1FF) as usize
}

#[inline]
pub const fn pml3_index(va: u64) -> usize {
    ((va >> 30) & 0x3_FFFF) as usize
}

#[inline]
pub const fn pml2_index(va: u64) -> usize {
    ((va >> 21) & 0x7FF_FFFF) as usize
}

#[inline]
pub const fn pml1_index(va: u64) -> usize {
    ((va >> 12) & 0xF_FFFF_FFFF) as usize
}

/// Baseline for every valid leaf: `AccessFlag | WriteBack | Page | Valid`
/// (write-back normal memory is MAIR index 0, encoded as attribute 0).
fn baseline() -> EntryFlags {
    EntryFlags::VALID | EntryFlags::PAGE | EntryFlags::ACCESS_FLAG | EntryFlags::INNER_SHARE
}

/// Native attributes for each page type
pub fn entry_flags(page_type: PageType) -> EntryFlags {
    match page_type {
        PageType::KernelCode => baseline() | EntryFlags::READ_ONLY | EntryFlags::UXN,
        PageType::KernelDataRo => {
            baseline() | EntryFlags::READ_ONLY | EntryFlags::PXN | EntryFlags::UXN
        }
        PageType::KernelDataRw => baseline() | EntryFlags::PXN | EntryFlags::UXN,
        PageType::UserCode => {
            baseline()
                | EntryFlags::USER
                | EntryFlags::READ_ONLY
                | EntryFlags::NOT_GLOBAL
                | EntryFlags::PXN
        }
        PageType::UserDataRo => {
            baseline()
                | EntryFlags::USER
                | EntryFlags::READ_ONLY
                | EntryFlags::NOT_GLOBAL
                | EntryFlags::PXN
                | EntryFlags::UXN
        }
        PageType::UserDataRw => {
            baseline() | EntryFlags::USER | EntryFlags::NOT_GLOBAL | EntryFlags::PXN | EntryFlags::UXN
        }
        PageType::Mmio => {
            EntryFlags::VALID
                | EntryFlags::PAGE
                | EntryFlags::ACCESS_FLAG
                | EntryFlags::DEVICE
                | EntryFlags::PXN
                | EntryFlags::UXN
        }
        PageType::VideoFramebuffer => {
            EntryFlags::VALID
                | EntryFlags::PAGE
                | EntryFlags::ACCESS_FLAG
                | EntryFlags::NON_CACHE
                | EntryFlags::PXN
                | EntryFlags::UXN
        }
    }
}

#[inline]
fn invalidate(va: u64) {
    // SAFETY: TLB maintenance for one page; no memory is touched.
    unsafe {
        asm!(
            "dsb ishst",
            "tlbi vaae1, {page}",
            "dsb ish",
            "isb",
            page = in(reg) (va >> 12),
            options(nostack, preserves_flags)
        );
    }
}

unsafe fn ensure_table(entry: *mut u64, window_page: u64) -> Result<()> {
    // SAFETY: caller guarantees `entry` points into a live window.
    if unsafe { entry.read_volatile() } & EntryFlags::VALID.bits() == 0 {
        let frame = frame_allocator::allocate_frames(1)?;
        let descriptor =
            frame.as_addr().as_u64() | (EntryFlags::VALID | EntryFlags::PAGE).bits();
        // SAFETY: as above.
        unsafe { entry.write_volatile(descriptor) };
        invalidate(window_page);
        // SAFETY: the window page now exposes the fresh table.
        unsafe { core::ptr::write_bytes(window_page as usize as *mut u8, 0, PAGE_SIZE) };
    }
    Ok(())
}

/// Map `page_count` pages at `virt` in the active address space. 2 MiB
/// block descriptors are used when both addresses are block-aligned and
/// the count divides evenly.
///
/// # Safety
///
/// The recursive mapping must be live and the kernel lock held.
pub unsafe fn map_pages(
    phys: PhysicalAddress,
    virt: VirtualAddress,
    page_count: usize,
    page_type: PageType,
) -> Result<()> {
    if !phys.is_page_aligned() || !virt.is_page_aligned() || page_count == 0 {
        return Err(KernelError::InvalidArguments);
    }

    let flags = entry_flags(page_type);
    let use_block = page_count % (LARGE_PAGE_SIZE / PAGE_SIZE) == 0
        && phys.as_u64() % LARGE_PAGE_SIZE as u64 == 0
        && virt.as_u64() % LARGE_PAGE_SIZE as u64 == 0;

    let count = if use_block {
        page_count / (LARGE_PAGE_SIZE / PAGE_SIZE)
    } else {
        page_count
    };

    let mut phys = phys.as_u64();
    let mut virt = virt.as_u64();

    for _ in 0..count {
        let i4 = pml4_index(virt);
        let i3 = pml3_index(virt);
        let i2 = pml2_index(virt);
        let i1 = pml1_index(virt);

        // SAFETY: windows are live per the function contract.
        unsafe {
            ensure_table(PML4.add(i4), PML3 as u64 + ((i4 as u64) << 12))?;
            ensure_table(PML3.add(i3), PML2 as u64 + ((i3 as u64) << 12))?;

            if use_block {
                // A block descriptor clears bit 1.
                let descriptor = phys | (flags - EntryFlags::PAGE).bits();
                write_leaf(PML2.add(i2), descriptor, virt)?;
                phys += LARGE_PAGE_SIZE as u64;
                virt += LARGE_PAGE_SIZE as u64;
                continue;
            }
            ensure_table(PML2.add(i2), PML1 as u64 + ((i2 as u64) << 12))?;
            write_leaf(PML1.add(i1), phys | flags.bits(), virt)?;
        }

        phys += PAGE_SIZE as u64;
        virt += PAGE_SIZE as u64;
    }

    Ok(())
}

unsafe fn write_leaf(entry: *mut u64, new_entry: u64, va: u64) -> Result<()> {
    // SAFETY: per the caller's contract.
    let old = unsafe { entry.read_volatile() };
    if old & EntryFlags::VALID.bits() != 0 {
        if old == new_entry {
            return Ok(());
        }
        log::error!(
            "mmu: remap of {:#x} with different descriptor (old {:#x}, new {:#x})",
            va,
            old,
            new_entry
        );
        return Err(KernelError::AlreadyMapped);
    }
    // SAFETY: per the caller's contract.
    unsafe { entry.write_volatile(new_entry) };
    invalidate(va);
    Ok(())
}

/// Unmap `page_count` pages at `virt`, optionally freeing the frames.
///
/// # Safety
///
/// Same contract as [`map_pages`].
pub unsafe fn unmap_pages(virt: VirtualAddress, page_count: usize, free_frames: bool) -> Result<()> {
    if !virt.is_page_aligned() || page_count == 0 {
        return Err(KernelError::InvalidArguments);
    }

    let mut va = virt.as_u64();
    for _ in 0..page_count {
        // SAFETY: windows live per contract; levels checked in order.
        unsafe {
            if walk_has_leaf(va) {
                let slot = PML1.add(pml1_index(va));
                let entry = slot.read_volatile();
                if entry & EntryFlags::VALID.bits() != 0 {
                    slot.write_volatile(0);
                    invalidate(va);
                    if free_frames {
                        let frame =
                            frame_allocator::FrameNumber::new((entry & ADDRESS_MASK) >> 12);
                        let _ = frame_allocator::free_frames(frame, 1);
                    }
                }
            }
        }
        va += PAGE_SIZE as u64;
    }
    Ok(())
}

unsafe fn walk_has_leaf(va: u64) -> bool {
    // SAFETY: per the caller's contract.
    unsafe {
        let l4 = PML4.add(pml4_index(va)).read_volatile();
        if l4 & EntryFlags::VALID.bits() == 0 {
            return false;
        }
        let l3 = PML3.add(pml3_index(va)).read_volatile();
        if l3 & EntryFlags::VALID.bits() == 0 || l3 & EntryFlags::PAGE.bits() == 0 {
            return false;
        }
        let l2 = PML2.add(pml2_index(va)).read_volatile();
        l2 & EntryFlags::VALID.bits() != 0 && l2 & EntryFlags::PAGE.bits() != 0
    }
}

/// Translate a virtual address in the active address space.
///
/// # Safety
///
/// Recursive windows must be live.
pub unsafe fn translate(virt: VirtualAddress) -> Option<PhysicalAddress> {
    let va = virt.as_u64();

    // The direct map is linear and spans 64 TiB from its base.
    if (PHYS_MAP_BASE..0xFFFF_C000_0000_0000).contains(&va) {
        return Some(PhysicalAddress::new(va - PHYS_MAP_BASE));
    }

    // SAFETY: per the function contract.
    unsafe {
        let l4 = PML4.add(pml4_index(va)).read_volatile();
        if l4 & EntryFlags::VALID.bits() == 0 {
            return None;
        }
        let l3 = PML3.add(pml3_index(va)).read_volatile();
        if l3 & EntryFlags::VALID.bits() == 0 {
            return None;
        }
        if l3 & EntryFlags::PAGE.bits() == 0 {
            // 1 GiB block
            return Some(PhysicalAddress::new(
                (l3 & ADDRESS_MASK & !0x3FFF_FFFF) + (va & 0x3FFF_FFFF),
            ));
        }
        let l2 = PML2.add(pml2_index(va)).read_volatile();
        if l2 & EntryFlags::VALID.bits() == 0 {
            return None;
        }
        if l2 & EntryFlags::PAGE.bits() == 0 {
            // 2 MiB block
            return Some(PhysicalAddress::new(
                (l2 & ADDRESS_MASK & !(LARGE_PAGE_SIZE as u64 - 1))
                    + (va & (LARGE_PAGE_SIZE as u64 - 1)),
            ));
        }
        let l1 = PML1.add(pml1_index(va)).read_volatile();
        if l1 & EntryFlags::VALID.bits() == 0 {
            return None;
        }
        Some(PhysicalAddress::new(
            (l1 & ADDRESS_MASK) + (va & (PAGE_SIZE as u64 - 1)),
        ))
    }
}

/// Build a new address space sharing the kernel half of the active one.
///
/// # Safety
///
/// Recursive windows and the direct map must be live.
pub unsafe fn clone_kernel_space() -> Result<PhysicalAddress> {
    let root_frame = frame_allocator::allocate_frames(1)?;
    let root_phys = root_frame.as_addr();
    let new_root = phys_to_virt(root_phys).as_mut_ptr::<u64>();

    // SAFETY: the fresh root is reached through the direct map; PML4 is
    // the live window.
    unsafe {
        for i in 0..KERNEL_FIRST_SLOT {
            new_root.add(i).write_volatile(0);
        }
        for i in KERNEL_FIRST_SLOT..512 {
            new_root.add(i).write_volatile(PML4.add(i).read_volatile());
        }
        new_root.add(RECURSIVE_SLOT).write_volatile(
            root_phys.as_u64() | (EntryFlags::VALID | EntryFlags::PAGE).bits(),
        );
    }

    Ok(root_phys)
}

/// Physical address of the active root table.
pub fn current_root() -> PhysicalAddress {
    let ttbr0: u64;
    // SAFETY: reading TTBR0_EL1 has no side effects.
    unsafe {
        asm!("mrs {}, ttbr0_el1", out(reg) ttbr0, options(nostack, preserves_flags));
    }
    PhysicalAddress::new(ttbr0 & ADDRESS_MASK)
}

/// Load `root` into both translation base registers if it differs.
///
/// # Safety
///
/// `root` must be a valid level-0 table sharing the kernel half.
pub unsafe fn activate(root: PhysicalAddress) {
    if current_root() != root {
        // SAFETY: per the function contract; the ISB orders the writes
        // before any translation that follows.
        unsafe {
            asm!(
                "msr ttbr0_el1, {root}",
                "msr ttbr1_el1, {root}",
                "dsb ish",
                "tlbi vmalle1",
                "dsb ish",
                "isb",
                root = in(reg) root.as_u64(),
                options(nostack, preserves_flags)
            );
        }
    }
}

/// Free every user-half frame and page-table frame of `root` through
/// the direct map. See the x86_64 twin for the shape of the walk.
///
/// # Safety
///
/// `root` must not be the active root on any CPU.
pub unsafe fn release_user_half(root: PhysicalAddress) {
    use crate::mm::frame_allocator::{free_frames, FrameNumber};
    use crate::mm::USER_SPACE_END;

    let valid = EntryFlags::VALID.bits();
    let page = EntryFlags::PAGE.bits();
    let user_slots = (USER_SPACE_END >> 39) as usize;

    // SAFETY: no live translations reference these tables.
    unsafe {
        let l4 = phys_to_virt(root).as_mut_ptr::<u64>();
        for i4 in 0..user_slots {
            let e4 = l4.add(i4).read_volatile();
            if e4 & valid == 0 {
                continue;
            }
            let l3 = phys_to_virt(PhysicalAddress::new(e4 & ADDRESS_MASK)).as_mut_ptr::<u64>();
            for i3 in 0..512 {
                let e3 = l3.add(i3).read_volatile();
                if e3 & valid == 0 || e3 & page == 0 {
                    continue;
                }
                let l2 = phys_to_virt(PhysicalAddress::new(e3 & ADDRESS_MASK)).as_mut_ptr::<u64>();
                for i2 in 0..512 {
                    let e2 = l2.add(i2).read_volatile();
                    if e2 & valid == 0 || e2 & page == 0 {
                        continue;
                    }
                    let l1 =
                        phys_to_virt(PhysicalAddress::new(e2 & ADDRESS_MASK)).as_mut_ptr::<u64>();
                    for i1 in 0..512 {
                        let e1 = l1.add(i1).read_volatile();
                        if e1 & valid != 0 {
                            let _ = free_frames(FrameNumber::new((e1 & ADDRESS_MASK) >> 12), 1);
                        }
                    }
                    let _ = free_frames(FrameNumber::new((e2 & ADDRESS_MASK) >> 12), 1);
                }
                let _ = free_frames(FrameNumber::new((e3 & ADDRESS_MASK) >> 12), 1);
            }
            let _ = free_frames(FrameNumber::new((e4 & ADDRESS_MASK) >> 12), 1);
        }
        let _ = free_frames(FrameNumber::new(root.as_u64() >> 12), 1);
    }
}
