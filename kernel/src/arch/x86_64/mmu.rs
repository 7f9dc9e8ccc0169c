//! x86_64 page-table plumbing
//!
//! All page-table editing goes through the recursive mapping: PML4 slot
//! 510 points back at the PML4 itself, which exposes every level of the
//! hierarchy as ordinary virtual memory. No transient mappings are ever
//! created.
//!
//! How to calculate the window addresses: each translation level is
//! 9 bits, easiest written in octal (o000-o777). Slot 510 is o776.
//! Walking the recursive slot N times reaches level (4-N) tables:
//!
//! ```text
//! pml4: o776_776_776_776 -> 0xFFFF_FF7F_BFDF_E000
//! pml3: o776_776_776_000 -> 0xFFFF_FF7F_BFC0_0000
//! pml2: o776_776_000_000 -> 0xFFFF_FF7F_8000_0000
//! pml1: o776_000_000_000 -> 0xFFFF_FF00_0000_0000
//! ```

use bitflags::bitflags;
use x86_64::instructions::tlb;
use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::structures::paging::PhysFrame;
use x86_64::VirtAddr;

use crate::error::{KernelError, Result};
use crate::mm::frame_allocator;
use crate::mm::{
    phys_to_virt, PageType, PhysicalAddress, VirtualAddress, HUGE_PAGE_SIZE, LARGE_PAGE_SIZE,
    PAGE_SIZE, PHYS_MAP_BASE,
};

/// The PML4 slot used for the recursive self-map
pub const RECURSIVE_SLOT: usize = 510;

/// First PML4 slot belonging to the kernel half
pub const KERNEL_FIRST_SLOT: usize = 256;

bitflags! {
    /// x86_64 page-table entry flags (Intel SDM 4-level paging)
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u64 {
        const PRESENT       = 1 << 0;
        const WRITE         = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        /// Large/huge page in PML2/PML3 entries
        const SIZE          = 1 << 7;
        /// TLB entry survives address-space switches
        const GLOBAL        = 1 << 8;
        const NO_EXECUTE    = 1 << 63;
    }
}

/// Mask extracting the physical address from an entry
pub const ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

// The four recursive windows. Only meaningful while the recursive
// mapping is live (i.e. always, once the bootloader hands over).
const PML4: *mut u64 = 0xFFFF_FF7F_BFDF_E000usize as *mut u64;
const PML3: *mut u64 = 0xFFFF_FF7F_BFC0_0000usize as *mut u64;
const PML2: *mut u64 = 0xFFFF_FF7F_8000_0000usize as *mut u64;
const PML1: *mut u64 = 0xFFFF_FF00_0000_0000usize as *mut u64;

/// Index of `va` into the PML4 window
#[inline]
pub const fn pml4_index(va: u64) -> usize {
    ((va >> 39) & 0x1FF) as usize
}

/// Index of `va` into the PML3 window (18 significant bits)
#[inline]
pub const fn pml3_index(va: u64) -> usize {
    ((va >> 30) & 0x3_FFFF) as usize
}

/// Index of `va` into the PML2 window (27 significant bits)
#[inline]
pub const fn pml2_index(va: u64) -> usize {
    ((va >> 21) & 0x7FF_FFFF) as usize
}

/// Index of `va` into the PML1 window (36 significant bits)
#[inline]
pub const fn pml1_index(va: u64) -> usize {
    ((va >> 12) & 0xF_FFFF_FFFF) as usize
}

/// Native flags for each page type
pub fn entry_flags(page_type: PageType) -> EntryFlags {
    match page_type {
        PageType::KernelCode => EntryFlags::PRESENT,
        PageType::KernelDataRo => EntryFlags::PRESENT | EntryFlags::NO_EXECUTE,
        PageType::KernelDataRw => {
            EntryFlags::PRESENT | EntryFlags::WRITE | EntryFlags::NO_EXECUTE
        }
        PageType::UserCode => EntryFlags::PRESENT | EntryFlags::USER,
        PageType::UserDataRo => {
            EntryFlags::PRESENT | EntryFlags::USER | EntryFlags::NO_EXECUTE
        }
        PageType::UserDataRw => {
            EntryFlags::PRESENT
                | EntryFlags::USER
                | EntryFlags::WRITE
                | EntryFlags::NO_EXECUTE
        }
        PageType::Mmio => {
            EntryFlags::PRESENT
                | EntryFlags::WRITE
                | EntryFlags::NO_EXECUTE
                | EntryFlags::CACHE_DISABLE
        }
        PageType::VideoFramebuffer => {
            EntryFlags::PRESENT
                | EntryFlags::WRITE
                | EntryFlags::NO_EXECUTE
                | EntryFlags::WRITE_THROUGH
        }
    }
}

/// Does the CPU support 1 GiB pages?
fn has_huge_pages() -> bool {
    // CPUID.80000001H:EDX bit 26
    // SAFETY: CPUID leaf 0x80000001 is valid on every 64-bit CPU.
    let leaf = unsafe { core::arch::x86_64::__cpuid(0x8000_0001) };
    leaf.edx & (1 << 26) != 0
}

#[inline]
fn invalidate(va: u64) {
    tlb::flush(VirtAddr::new_truncate(va));
}

/// Ensure the intermediate entry `*entry` is present, allocating and
/// zeroing a fresh table if needed. `window_page` is the virtual address
/// (inside the next-lower window) of the table the entry exposes.
unsafe fn ensure_table(entry: *mut u64, window_page: u64, kernel_flags: EntryFlags, user: bool) -> Result<()> {
    // SAFETY: caller guarantees `entry` points into a live window.
    if unsafe { entry.read_volatile() } & EntryFlags::PRESENT.bits() == 0 {
        let frame = frame_allocator::allocate_frames(1)?;
        let mut flags = EntryFlags::PRESENT | EntryFlags::WRITE | kernel_flags;
        if user {
            flags |= EntryFlags::USER;
        }
        // SAFETY: as above.
        unsafe { entry.write_volatile(frame.as_addr().as_u64() | flags.bits()) };
        invalidate(window_page);
        // SAFETY: the window page now exposes the freshly allocated
        // table; zero all 512 entries.
        unsafe { core::ptr::write_bytes(window_page as usize as *mut u8, 0, PAGE_SIZE) };
    }
    Ok(())
}

/// Map `page_count` pages starting at `virt` to `phys` in the active
/// address space.
///
/// Large (2 MiB) and huge (1 GiB) entries are used opportunistically
/// when both addresses are naturally aligned and the count is an exact
/// multiple. Mapping an already-mapped page with identical flags is
/// idempotent; with different flags it is an error the caller must
/// treat as fatal.
///
/// # Safety
///
/// The recursive mapping must be live and the kernel lock held; `virt`
/// is interpreted in the *active* address space.
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
    let user = flags.contains(EntryFlags::USER);

    let use_huge = has_huge_pages()
        && page_count % (HUGE_PAGE_SIZE / PAGE_SIZE) == 0
        && phys.as_u64() % HUGE_PAGE_SIZE as u64 == 0
        && virt.as_u64() % HUGE_PAGE_SIZE as u64 == 0;
    let use_large = !use_huge
        && page_count % (LARGE_PAGE_SIZE / PAGE_SIZE) == 0
        && phys.as_u64() % LARGE_PAGE_SIZE as u64 == 0
        && virt.as_u64() % LARGE_PAGE_SIZE as u64 == 0;

    let count = if use_huge {
        page_count / (HUGE_PAGE_SIZE / PAGE_SIZE)
    } else if use_large {
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

        // Kernel-half TLB entries survive address-space switches.
        let kernel_flags = if i4 >= KERNEL_FIRST_SLOT {
            EntryFlags::GLOBAL
        } else {
            EntryFlags::empty()
        };

        // SAFETY: the recursive windows are live per the function
        // contract; each ensure_table call exposes the next level.
        unsafe {
            ensure_table(PML4.add(i4), PML3 as u64 + ((i4 as u64) << 12), kernel_flags, user)?;

            if use_huge {
                write_leaf(
                    PML3.add(i3),
                    phys | (flags | kernel_flags | EntryFlags::SIZE).bits(),
                    virt,
                )?;
                phys += HUGE_PAGE_SIZE as u64;
                virt += HUGE_PAGE_SIZE as u64;
                continue;
            }
            ensure_table(PML3.add(i3), PML2 as u64 + ((i3 as u64) << 12), kernel_flags, user)?;

            if use_large {
                write_leaf(
                    PML2.add(i2),
                    phys | (flags | kernel_flags | EntryFlags::SIZE).bits(),
                    virt,
                )?;
                phys += LARGE_PAGE_SIZE as u64;
                virt += LARGE_PAGE_SIZE as u64;
                continue;
            }
            ensure_table(PML2.add(i2), PML1 as u64 + ((i2 as u64) << 12), kernel_flags, user)?;

            write_leaf(PML1.add(i1), phys | (flags | kernel_flags).bits(), virt)?;
        }

        phys += PAGE_SIZE as u64;
        virt += PAGE_SIZE as u64;
    }

    Ok(())
}

/// Install a leaf entry, honoring the idempotence rule.
///
/// # Safety
///
/// `entry` must point into a live window.
unsafe fn write_leaf(entry: *mut u64, new_entry: u64, va: u64) -> Result<()> {
    // SAFETY: per the function contract.
    let old = unsafe { entry.read_volatile() };
    if old & EntryFlags::PRESENT.bits() != 0 {
        // The CPU may have set ACCESSED/DIRTY behind our back; they do
        // not make a mapping different.
        let hw_bits = (EntryFlags::ACCESSED | EntryFlags::DIRTY).bits();
        if old & !hw_bits == new_entry & !hw_bits {
            // Idempotent remap with identical frame and flags.
            return Ok(());
        }
        log::error!(
            "mmu: remap of {:#x} with different entry (old {:#x}, new {:#x})",
            va,
            old,
            new_entry
        );
        return Err(KernelError::AlreadyMapped);
    }
    // SAFETY: per the function contract.
    unsafe { entry.write_volatile(new_entry) };
    invalidate(va);
    Ok(())
}

/// Unmap `page_count` pages starting at `virt` from the active address
/// space, returning each backing frame to the PMM when `free_frames`.
///
/// # Safety
///
/// Same contract as [`map_pages`]. Large/huge mappings must be unmapped
/// by their leaf granularity.
pub unsafe fn unmap_pages(virt: VirtualAddress, page_count: usize, free_frames: bool) -> Result<()> {
    if !virt.is_page_aligned() || page_count == 0 {
        return Err(KernelError::InvalidArguments);
    }

    let mut va = virt.as_u64();
    for _ in 0..page_count {
        let i1 = pml1_index(va);
        // SAFETY: recursive windows are live per the function contract.
        // A non-present intermediate level faults on the window read, so
        // check the walk first via translate-style probes.
        unsafe {
            if !walk_has_leaf(va) {
                va += PAGE_SIZE as u64;
                continue;
            }
            let entry = PML1.add(i1).read_volatile();
            if entry & EntryFlags::PRESENT.bits() != 0 {
                PML1.add(i1).write_volatile(0);
                invalidate(va);
                if free_frames {
                    let frame =
                        frame_allocator::FrameNumber::new((entry & ADDRESS_MASK) >> 12);
                    let _ = frame_allocator::free_frames(frame, 1);
                }
            }
        }
        va += PAGE_SIZE as u64;
    }
    Ok(())
}

/// Is there a complete 4-level walk down to a PML1 entry for `va`?
///
/// # Safety
///
/// Recursive windows must be live.
unsafe fn walk_has_leaf(va: u64) -> bool {
    // SAFETY: per the function contract; each level is checked before
    // the next window page is touched.
    unsafe {
        let l4 = PML4.add(pml4_index(va)).read_volatile();
        if l4 & EntryFlags::PRESENT.bits() == 0 {
            return false;
        }
        let l3 = PML3.add(pml3_index(va)).read_volatile();
        if l3 & EntryFlags::PRESENT.bits() == 0 || l3 & EntryFlags::SIZE.bits() != 0 {
            return false;
        }
        let l2 = PML2.add(pml2_index(va)).read_volatile();
        l2 & EntryFlags::PRESENT.bits() != 0 && l2 & EntryFlags::SIZE.bits() == 0
    }
}

/// Translate a virtual address in the active address space.
///
/// # Safety
///
/// Recursive windows must be live.
pub unsafe fn translate(virt: VirtualAddress) -> Option<PhysicalAddress> {
    let va = virt.as_u64();

    // Direct-map shortcut: the physical map is linear by construction
    // and spans 64 TiB from its base.
    if (PHYS_MAP_BASE..0xFFFF_C000_0000_0000).contains(&va) {
        return Some(PhysicalAddress::new(va - PHYS_MAP_BASE));
    }

    // SAFETY: per the function contract.
    unsafe {
        let l4 = PML4.add(pml4_index(va)).read_volatile();
        if l4 & EntryFlags::PRESENT.bits() == 0 {
            return None;
        }

        let l3 = PML3.add(pml3_index(va)).read_volatile();
        if l3 & EntryFlags::PRESENT.bits() == 0 {
            return None;
        }
        if l3 & EntryFlags::SIZE.bits() != 0 {
            return Some(PhysicalAddress::new(
                (l3 & ADDRESS_MASK & !(HUGE_PAGE_SIZE as u64 - 1)) + (va & (HUGE_PAGE_SIZE as u64 - 1)),
            ));
        }

        let l2 = PML2.add(pml2_index(va)).read_volatile();
        if l2 & EntryFlags::PRESENT.bits() == 0 {
            return None;
        }
        if l2 & EntryFlags::SIZE.bits() != 0 {
            return Some(PhysicalAddress::new(
                (l2 & ADDRESS_MASK & !(LARGE_PAGE_SIZE as u64 - 1)) + (va & (LARGE_PAGE_SIZE as u64 - 1)),
            ));
        }

        let l1 = PML1.add(pml1_index(va)).read_volatile();
        if l1 & EntryFlags::PRESENT.bits() == 0 {
            return None;
        }
        Some(PhysicalAddress::new(
            (l1 & ADDRESS_MASK) + (va & (PAGE_SIZE as u64 - 1)),
        ))
    }
}

/// Build a new address space sharing the kernel half of the active one.
///
/// The new root's user half is empty, its kernel-half entries are the
/// same table frames as the source's, and slot 510 points at the new
/// root itself.
///
/// # Safety
///
/// Recursive windows and the direct map must be live.
pub unsafe fn clone_kernel_space() -> Result<PhysicalAddress> {
    let root_frame = frame_allocator::allocate_frames(1)?;
    let root_phys = root_frame.as_addr();

    // The new root is edited through the direct map; it is not the
    // active table yet.
    let new_root = phys_to_virt(root_phys).as_mut_ptr::<u64>();

    // SAFETY: new_root addresses a freshly allocated frame through the
    // direct map; PML4 is the live recursive window.
    unsafe {
        for i in 0..KERNEL_FIRST_SLOT {
            new_root.add(i).write_volatile(0);
        }
        for i in KERNEL_FIRST_SLOT..512 {
            new_root.add(i).write_volatile(PML4.add(i).read_volatile());
        }
        new_root.add(RECURSIVE_SLOT).write_volatile(
            root_phys.as_u64() | (EntryFlags::PRESENT | EntryFlags::WRITE).bits(),
        );
    }

    Ok(root_phys)
}

/// Physical address of the active root table.
pub fn current_root() -> PhysicalAddress {
    let (frame, _) = Cr3::read();
    PhysicalAddress::new(frame.start_address().as_u64())
}

/// Load `root` if it differs from the active one.
///
/// # Safety
///
/// `root` must be a valid PML4 sharing the kernel half.
pub unsafe fn activate(root: PhysicalAddress) {
    if current_root() != root {
        let frame = PhysFrame::containing_address(x86_64::PhysAddr::new(root.as_u64()));
        // SAFETY: per the function contract.
        unsafe { Cr3::write(frame, Cr3Flags::empty()) };
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_window_addresses_follow_slot_510() {
        // o776 repeated: each window is the previous one shifted through
        // the recursive slot.
        assert_eq!(PML4 as u64, 0xFFFF_FF7F_BFDF_E000);
        assert_eq!(PML3 as u64, 0xFFFF_FF7F_BFC0_0000);
        assert_eq!(PML2 as u64, 0xFFFF_FF7F_8000_0000);
        assert_eq!(PML1 as u64, 0xFFFF_FF00_0000_0000);
        assert_eq!(pml4_index(PML4 as u64), RECURSIVE_SLOT);
    }

    #[test]
    fn test_index_extraction() {
        let va = 0xFFFF_FFFF_C010_0000u64;
        assert_eq!(pml4_index(va), 511);
        // Walking one page forward moves only the PML1 index.
        assert_eq!(pml1_index(va) + 1, pml1_index(va + PAGE_SIZE as u64));
        // The window index widths nest: i2 = i3 * 512 + local slot.
        assert_eq!(pml2_index(va) / 512, pml3_index(va));
        assert_eq!(pml3_index(va) / 512, pml4_index(va));
    }

    #[test]
    fn test_entry_flags_user_and_nx() {
        assert!(entry_flags(PageType::UserCode).contains(EntryFlags::USER));
        assert!(!entry_flags(PageType::UserCode).contains(EntryFlags::NO_EXECUTE));
        assert!(entry_flags(PageType::UserDataRw).contains(EntryFlags::NO_EXECUTE));
        assert!(entry_flags(PageType::UserDataRw).contains(EntryFlags::WRITE));
        assert!(!entry_flags(PageType::UserDataRo).contains(EntryFlags::WRITE));
        assert!(!entry_flags(PageType::KernelCode).contains(EntryFlags::USER));
        assert!(entry_flags(PageType::Mmio).contains(EntryFlags::CACHE_DISABLE));
    }
}

/// Free every user-half frame and page-table frame of `root`, walking
/// through the direct map. Used by address-space teardown; the kernel
/// half is shared and untouched.
///
/// # Safety
///
/// `root` must not be the active root on any CPU.
pub unsafe fn release_user_half(root: PhysicalAddress) {
    use crate::mm::frame_allocator::{free_frames, FrameNumber};
    use crate::mm::USER_SPACE_END;

    let present = EntryFlags::PRESENT.bits();
    let size = EntryFlags::SIZE.bits();
    let user_slots = (USER_SPACE_END >> 39) as usize;

    // SAFETY: every table reached here was allocated by the kernel and
    // is reachable through the direct map; no live translations use it.
    unsafe {
        let l4 = phys_to_virt(root).as_mut_ptr::<u64>();
        for i4 in 0..user_slots {
            let e4 = l4.add(i4).read_volatile();
            if e4 & present == 0 {
                continue;
            }
            let l3 = phys_to_virt(PhysicalAddress::new(e4 & ADDRESS_MASK)).as_mut_ptr::<u64>();
            for i3 in 0..512 {
                let e3 = l3.add(i3).read_volatile();
                if e3 & present == 0 || e3 & size != 0 {
                    continue;
                }
                let l2 = phys_to_virt(PhysicalAddress::new(e3 & ADDRESS_MASK)).as_mut_ptr::<u64>();
                for i2 in 0..512 {
                    let e2 = l2.add(i2).read_volatile();
                    if e2 & present == 0 || e2 & size != 0 {
                        continue;
                    }
                    let l1 =
                        phys_to_virt(PhysicalAddress::new(e2 & ADDRESS_MASK)).as_mut_ptr::<u64>();
                    for i1 in 0..512 {
                        let e1 = l1.add(i1).read_volatile();
                        if e1 & present != 0 {
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
