//! User page-fault handling
//!
//! Two legitimate patterns reach here: growth of the user stack (any
//! fault inside the stack range except its guard page), and nothing
//! else. Everything else is fatal for the task, with a diagnostic dump;
//! the rest of the system keeps running.

use crate::error::KernelError;
use crate::mm::{
    align_down, frame_allocator, phys_to_virt, PageType, VirtualAddress, PAGE_SIZE,
};
use crate::sched;
use crate::sync::kernel_lock;

/// Handle a fault taken in user mode at `fault_addr`.
///
/// Returns normally when the fault was resolved (the faulting
/// instruction will be retried); kills the task otherwise.
pub fn handle_user_fault(fault_addr: VirtualAddress, error: u64, instruction: u64) {
    let guard = kernel_lock::lock();

    let current = sched::current_task();
    // SAFETY: kernel lock held.
    let task = unsafe { current.get() };
    let addr = fault_addr.as_u64();

    let in_stack = addr >= task.user_stack_top && addr < task.user_stack_bottom;
    let in_guard_page = in_stack && addr < task.user_stack_top + PAGE_SIZE as u64;

    if in_stack && !in_guard_page {
        match grow_stack(addr) {
            Ok(()) => return,
            Err(err) => {
                log::error!("task {}: stack growth failed: {}", task.id, err);
            }
        }
    } else if in_guard_page {
        log::error!(
            "task {}: stack overflow into the guard page at {:#x}",
            task.id,
            addr
        );
    } else {
        log::error!(
            "task {}: fatal page fault at {:#x} (ip {:#x}, error {:#x})",
            task.id,
            addr,
            instruction,
            error
        );
    }

    drop(guard);
    sched::kill_current(KernelError::Fault.code() as i32);
}

/// Map one fresh zeroed frame under the faulting stack address.
fn grow_stack(fault_addr: u64) -> crate::error::Result<()> {
    let page = align_down(fault_addr, PAGE_SIZE as u64);
    let frame = frame_allocator::allocate_frames(1)?;
    // SAFETY: fresh frame, zeroed through the direct map.
    unsafe {
        core::ptr::write_bytes(phys_to_virt(frame.as_addr()).as_mut_ptr::<u8>(), 0, PAGE_SIZE);
    }
    crate::mm::address_space::active().map(
        frame.as_addr(),
        VirtualAddress::new(page),
        1,
        PageType::UserDataRw,
    )
}
