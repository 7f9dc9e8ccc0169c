//! Per-task address spaces
//!
//! An `AddressSpace` is the shared-ownership handle to one translation
//! hierarchy. Threads of a task hold clones of the same `Arc`; the user
//! half is torn down when the last one drops. Every live address space
//! maps the kernel's upper half identically, so kernel code never cares
//! which one is active.
//!
//! Editing operations go through the architecture's recursive windows
//! and therefore apply to the *active* address space; callers switch
//! first (task creation runs its early steps on the new task, which has
//! already activated its own space).

use alloc::sync::Arc;

use crate::arch::mmu;
use crate::error::Result;
use crate::mm::{page_count, PageType, PhysicalAddress, VirtualAddress};

/// One virtual address space: the root translation table plus shared
/// ownership for the tasks (threads) using it.
#[derive(Debug)]
pub struct AddressSpace {
    root: PhysicalAddress,
}

impl AddressSpace {
    /// Wrap the currently active address space (used once at boot for
    /// the space the bootloader built).
    ///
    /// # Safety
    ///
    /// Must describe a root whose kernel half follows the layout
    /// contract; the returned handle must be the only owner wrapping
    /// this root.
    pub unsafe fn from_active() -> Arc<Self> {
        Arc::new(Self {
            root: mmu::current_root(),
        })
    }

    /// Physical address of the root table
    pub fn root(&self) -> PhysicalAddress {
        self.root
    }

    /// Is this the active address space?
    pub fn is_active(&self) -> bool {
        mmu::current_root() == self.root
    }

    /// Load this address space if it is not already active.
    pub fn activate(&self) {
        // SAFETY: every AddressSpace shares the kernel half, so
        // switching can never pull the kernel out from under us.
        unsafe { mmu::activate(self.root) };
    }

    /// Map `page_count` pages of `phys` at `virt`.
    ///
    /// Idempotent when the range is already mapped with identical
    /// flags; `AlreadyMapped` when flags differ; `OutOfMemory` when an
    /// intermediate table cannot be allocated.
    pub fn map(
        &self,
        phys: PhysicalAddress,
        virt: VirtualAddress,
        count: usize,
        page_type: PageType,
    ) -> Result<()> {
        debug_assert!(self.is_active());
        // SAFETY: the recursive mapping is live from handoff onward and
        // edits are serialized by the kernel lock.
        unsafe { mmu::map_pages(phys, virt, count, page_type) }
    }

    /// Unmap `count` pages at `virt` and return their frames to the PMM.
    pub fn unmap(&self, virt: VirtualAddress, count: usize) -> Result<()> {
        debug_assert!(self.is_active());
        // SAFETY: as in `map`.
        unsafe { mmu::unmap_pages(virt, count, true) }
    }

    /// Unmap `count` pages at `virt`, leaving the frames alone (used
    /// for mappings whose frames the PMM does not own, e.g. boot
    /// modules and the VDSO).
    pub fn unmap_keep_frames(&self, virt: VirtualAddress, count: usize) -> Result<()> {
        debug_assert!(self.is_active());
        // SAFETY: as in `map`.
        unsafe { mmu::unmap_pages(virt, count, false) }
    }

    /// Walk the tables for `virt`, honoring large/huge entries.
    pub fn translate(&self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        debug_assert!(self.is_active());
        // SAFETY: read-only walk through the live windows.
        unsafe { mmu::translate(virt) }
    }

    /// Build a new address space with an empty user half sharing this
    /// one's kernel half.
    pub fn clone_kernel_space(&self) -> Result<Arc<AddressSpace>> {
        debug_assert!(self.is_active());
        // SAFETY: recursive windows and direct map are live.
        let root = unsafe { mmu::clone_kernel_space() }?;
        Ok(Arc::new(AddressSpace { root }))
    }

    /// Map a byte range: convenience wrapper that page-counts `bytes`.
    pub fn map_bytes(
        &self,
        phys: PhysicalAddress,
        virt: VirtualAddress,
        bytes: u64,
        page_type: PageType,
    ) -> Result<()> {
        self.map(phys, virt, page_count(bytes) as usize, page_type)
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        // The last thread of the task is gone. The user half's frames
        // and intermediate tables go back to the PMM; the kernel half is
        // shared and stays. A dying address space is never the active
        // one (the dying task switched away during its final schedule),
        // so the walk goes through the direct map instead of the
        // recursive windows.
        //
        // The boot address space is never dropped (the idle task holds
        // it forever).
        // SAFETY: no CPU has this root loaded any more, so nothing can
        // race the walk or the frees.
        unsafe { mmu::release_user_half(self.root) };
    }
}

/// Non-owning handle to whatever address space is active.
///
/// Editing operations only ever apply to the active space, so code
/// touching the shared kernel half (kernel stacks, the heap region)
/// uses this instead of an `Arc<AddressSpace>`.
pub struct ActiveSpace(());

/// Borrow the active address space.
pub fn active() -> ActiveSpace {
    ActiveSpace(())
}

impl ActiveSpace {
    pub fn map(
        &self,
        phys: PhysicalAddress,
        virt: VirtualAddress,
        count: usize,
        page_type: PageType,
    ) -> Result<()> {
        // SAFETY: recursive mapping is live from handoff onward; edits
        // are serialized by the kernel lock.
        unsafe { mmu::map_pages(phys, virt, count, page_type) }
    }

    pub fn unmap(&self, virt: VirtualAddress, count: usize) -> Result<()> {
        // SAFETY: as in `map`.
        unsafe { mmu::unmap_pages(virt, count, true) }
    }

    pub fn unmap_keep_frames(&self, virt: VirtualAddress, count: usize) -> Result<()> {
        // SAFETY: as in `map`.
        unsafe { mmu::unmap_pages(virt, count, false) }
    }

    pub fn translate(&self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        // SAFETY: read-only walk through the live windows.
        unsafe { mmu::translate(virt) }
    }
}
