//! Per-CPU state behind TPIDR_EL1
//!
//! The base register points at the `Cpu` block; field accesses are a
//! `mrs` plus one load or store. The first two fields are ABI with the
//! exception vectors, which use them to switch between the user and
//! kernel stacks.

use core::arch::asm;
use core::cell::UnsafeCell;

use crate::sched::TaskId;

/// Per-processor state block
#[repr(C)]
pub struct Cpu {
    /// Kernel stack pointer for exception entry (offset 0x00, ABI)
    pub kernel_stack: u64,
    /// Scratch slot for the user stack pointer (offset 0x08, ABI)
    pub user_stack: u64,
    /// Id of the task currently executing on this CPU (offset 0x10)
    pub current_task: u64,
    /// Processor id
    pub id: u32,
    /// MPIDR affinity bits
    pub mpidr: u32,
    pub enabled: bool,
    pub bootstrap: bool,
}

const _: () = assert!(core::mem::offset_of!(Cpu, kernel_stack) == 0x00);
const _: () = assert!(core::mem::offset_of!(Cpu, user_stack) == 0x08);
const _: () = assert!(core::mem::offset_of!(Cpu, current_task) == 0x10);

struct CpuCell(UnsafeCell<Cpu>);

// SAFETY: only the owning CPU dereferences its block.
unsafe impl Sync for CpuCell {}

static BSP: CpuCell = CpuCell(UnsafeCell::new(Cpu {
    kernel_stack: 0,
    user_stack: 0,
    current_task: 0,
    id: 0,
    mpidr: 0,
    enabled: true,
    bootstrap: true,
}));

/// Point TPIDR_EL1 at the bootstrap `Cpu` block.
pub fn init_bsp() {
    // SAFETY: writing the software thread-id register has no side
    // effects beyond making the block reachable.
    unsafe {
        asm!("msr tpidr_el1, {}", in(reg) BSP.0.get() as u64, options(nostack, preserves_flags));
    }
}

#[inline]
fn cpu_ptr() -> *mut Cpu {
    let ptr: u64;
    // SAFETY: TPIDR_EL1 was set in init_bsp.
    unsafe {
        asm!("mrs {}, tpidr_el1", out(reg) ptr, options(nostack, preserves_flags));
    }
    ptr as usize as *mut Cpu
}

/// Id of the task currently executing on this CPU.
#[inline]
pub fn current_task_id() -> TaskId {
    // SAFETY: cpu_ptr points at this CPU's block.
    unsafe { (*cpu_ptr()).current_task }
}

/// Publish the currently executing task.
#[inline]
pub fn set_current_task(id: TaskId) {
    // SAFETY: as above.
    unsafe { (*cpu_ptr()).current_task = id };
}

/// Install the kernel stack the next exception entry switches to.
#[inline]
pub fn set_kernel_stack(sp: u64) {
    // SAFETY: as above.
    unsafe { (*cpu_ptr()).kernel_stack = sp };
}
