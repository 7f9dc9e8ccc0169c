//! Per-CPU state
//!
//! The `Cpu` structure sits behind the GS segment base so that reading a
//! field is a single `mov gs:[offset]`. The first three fields are ABI
//! with the syscall entry stub: it loads the kernel stack from offset
//! 0x0 and stashes the user stack pointer at offset 0x8 before it can
//! touch anything else.

use core::arch::asm;
use core::cell::UnsafeCell;

use x86_64::registers::model_specific::{GsBase, KernelGsBase};
use x86_64::VirtAddr;

use crate::sched::TaskId;

/// Per-processor state block
#[repr(C)]
pub struct Cpu {
    /// Kernel stack pointer for syscall entry (offset 0x00, ABI)
    pub kernel_stack: u64,
    /// Scratch slot holding the user stack pointer during syscall entry
    /// (offset 0x08, ABI)
    pub user_stack: u64,
    /// Id of the task currently executing on this CPU (offset 0x10)
    pub current_task: u64,
    /// Processor id (>= 0)
    pub id: u32,
    /// Local APIC id
    pub apic_id: u32,
    /// Processor is online
    pub enabled: bool,
    /// Is this the bootstrap processor?
    pub bootstrap: bool,
}

// The syscall entry stub hard-codes these offsets.
const _: () = assert!(core::mem::offset_of!(Cpu, kernel_stack) == 0x00);
const _: () = assert!(core::mem::offset_of!(Cpu, user_stack) == 0x08);
const _: () = assert!(core::mem::offset_of!(Cpu, current_task) == 0x10);

struct CpuCell(UnsafeCell<Cpu>);

// SAFETY: the cell is only accessed through the GS intrinsics below and
// only by the CPU it belongs to.
unsafe impl Sync for CpuCell {}

/// Bootstrap processor state. Secondary CPUs are a non-goal; bring-up
/// would allocate one of these per AP.
static BSP: CpuCell = CpuCell(UnsafeCell::new(Cpu {
    kernel_stack: 0,
    user_stack: 0,
    current_task: 0,
    id: 0,
    apic_id: 0,
    enabled: true,
    bootstrap: true,
}));

/// Point GS at the bootstrap `Cpu` block.
///
/// While in the kernel, GSBase holds the `Cpu` pointer; user mode runs
/// with the swapped (zero) base and the syscall/interrupt paths execute
/// `swapgs` on the way in and out.
pub fn init_bsp() {
    let base = VirtAddr::new(BSP.0.get() as u64);
    GsBase::write(base);
    KernelGsBase::write(VirtAddr::new(0));
}

/// Id of the task currently executing on this CPU. Single load.
#[inline]
pub fn current_task_id() -> TaskId {
    let id: u64;
    // SAFETY: GS base was set to the Cpu block in init_bsp.
    unsafe {
        asm!("mov {}, gs:[0x10]", out(reg) id, options(nostack, preserves_flags));
    }
    id
}

/// Publish the currently executing task. Single store.
#[inline]
pub fn set_current_task(id: TaskId) {
    // SAFETY: as in current_task_id.
    unsafe {
        asm!("mov gs:[0x10], {}", in(reg) id, options(nostack, preserves_flags));
    }
}

/// Install the kernel stack the next syscall entry will switch to.
#[inline]
pub fn set_kernel_stack(rsp: u64) {
    // SAFETY: as in current_task_id.
    unsafe {
        asm!("mov gs:[0x00], {}", in(reg) rsp, options(nostack, preserves_flags));
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_syscall_abi_offsets() {
        assert_eq!(core::mem::offset_of!(Cpu, kernel_stack), 0x00);
        assert_eq!(core::mem::offset_of!(Cpu, user_stack), 0x08);
        assert_eq!(core::mem::offset_of!(Cpu, current_task), 0x10);
    }
}
