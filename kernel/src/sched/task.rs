//! Task control block

use alloc::boxed::Box;
use alloc::sync::Arc;

use crate::arch::{Context, FpuState};
use crate::error::Result;
use crate::ipc;
use crate::mm::{
    frame_allocator, AddressSpace, PageType, VirtualAddress, KERNEL_STACKS_BASE, PAGE_SIZE,
};

use super::queue::WaitQueue;
use super::{table, TaskId, TaskState};

/// User TLS image descriptor: where the initialized template lives in
/// the task's image, how much to copy, and the full block size
/// including zero-fill.
#[derive(Debug, Clone, Copy, Default)]
pub struct TlsTemplate {
    pub base: u64,
    pub template_size: u64,
    pub total_size: u64,
}

/// The schedulable entity.
pub struct Task {
    /// Unique id, assigned monotonically; doubles as the IPC endpoint.
    pub id: TaskId,
    pub state: TaskState,
    /// Callee-saved register context, live while the task is switched
    /// out.
    pub context: Context,
    /// FPU/SIMD save area, saved/restored around every syscall and
    /// switch away.
    pub fpu: FpuState,
    /// Address space, shared with sibling threads.
    pub address_space: Arc<AddressSpace>,
    /// Kernel stack `[top, bottom)`; exclusively owned, one page, with
    /// an unmapped guard slot below `top`.
    pub kernel_stack_top: u64,
    pub kernel_stack_bottom: u64,
    /// User stack `[top, bottom)`; the page at `top` is the guard page
    /// and never auto-grows.
    pub user_stack_top: u64,
    pub user_stack_bottom: u64,
    /// Virtual message registers for IPC.
    pub ipc_registers: [u64; ipc::REGISTER_COUNT],
    /// Endpoint this task is rendezvousing with.
    pub ipc_partner: TaskId,
    /// Tasks blocked sending to us, in FIFO order.
    pub ipc_senders: WaitQueue,
    /// Intrusive wait/ready queue link.
    pub(crate) link: Option<TaskId>,
    /// Back-link to the queue currently holding this task.
    pub(crate) wait_queue: *mut WaitQueue,
    /// TLS image descriptor, inherited by clones.
    pub tls: TlsTemplate,
    pub exit_status: i32,
}

// SAFETY: tasks are only touched under the big kernel lock; the raw
// queue back-link never crosses that boundary.
unsafe impl Send for Task {}
unsafe impl Sync for Task {}

impl Task {
    /// Create a task that will start in `entry(arg)` on its own fresh
    /// kernel stack. The stack is one frame, mapped into the kernel
    /// stack area at a slot derived from the id so that consecutive
    /// stacks are separated by an unmapped guard slot.
    pub fn new(
        entry: extern "C" fn(usize) -> !,
        arg: usize,
        address_space: Arc<AddressSpace>,
    ) -> Result<Box<Task>> {
        let id = table::allocate_id();

        let stack_top = kernel_stack_slot(id);
        let stack_bottom = stack_top + PAGE_SIZE as u64;
        let frame = frame_allocator::allocate_frames(1)?;
        // Kernel stacks live in the shared kernel half, so mapping
        // through the creator's address space makes them visible to
        // every address space.
        let space = crate::mm::address_space::active();
        space.map(
            frame.as_addr(),
            VirtualAddress::new(stack_top),
            1,
            PageType::KernelDataRw,
        )?;
        // SAFETY: just mapped, exclusively ours.
        unsafe {
            core::ptr::write_bytes(stack_top as usize as *mut u8, 0, PAGE_SIZE);
        }

        Ok(Box::new(Task {
            id,
            state: TaskState::Ready,
            context: Context::new(entry, arg, stack_bottom),
            fpu: FpuState::new(),
            address_space,
            kernel_stack_top: stack_top,
            kernel_stack_bottom: stack_bottom,
            user_stack_top: 0,
            user_stack_bottom: 0,
            ipc_registers: [0; ipc::REGISTER_COUNT],
            ipc_partner: ipc::ENDPOINT_NONE,
            ipc_senders: WaitQueue::new(),
            link: None,
            wait_queue: core::ptr::null_mut(),
            tls: TlsTemplate::default(),
            exit_status: 0,
        }))
    }

    /// Wrap the boot flow of control as the idle task (id 0). Its
    /// context is filled in by the first switch away; its stack is the
    /// boot stack the bootloader gave us.
    pub fn idle(address_space: Arc<AddressSpace>) -> Box<Task> {
        let id = table::allocate_id();
        debug_assert_eq!(id, super::IDLE_TASK_ID);
        Box::new(Task {
            id,
            state: TaskState::Running,
            context: Context::empty(),
            fpu: FpuState::new(),
            address_space,
            kernel_stack_top: 0,
            kernel_stack_bottom: 0,
            user_stack_top: 0,
            user_stack_bottom: 0,
            ipc_registers: [0; ipc::REGISTER_COUNT],
            ipc_partner: ipc::ENDPOINT_NONE,
            ipc_senders: WaitQueue::new(),
            link: None,
            wait_queue: core::ptr::null_mut(),
            tls: TlsTemplate::default(),
            exit_status: 0,
        })
    }

    /// Release the kernel stack. Runs during reaping, after the final
    /// switch away from this task.
    pub(crate) fn release_kernel_stack(&mut self) {
        if self.kernel_stack_top != 0 {
            let space = crate::mm::address_space::active();
            let _ = space.unmap(VirtualAddress::new(self.kernel_stack_top), 1);
            self.kernel_stack_top = 0;
        }
    }
}

/// Kernel stack slot for a task id: stride of two pages leaves a guard
/// hole under every stack.
fn kernel_stack_slot(id: TaskId) -> u64 {
    KERNEL_STACKS_BASE + id * 2 * PAGE_SIZE as u64
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_stack_slots_leave_guard_holes() {
        let a = kernel_stack_slot(1);
        let b = kernel_stack_slot(2);
        // One page of stack, one page of hole.
        assert_eq!(b - a, 2 * PAGE_SIZE as u64);
        assert!(a >= KERNEL_STACKS_BASE);
    }
}
