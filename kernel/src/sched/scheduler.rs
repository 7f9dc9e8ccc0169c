//! The round-robin scheduler
//!
//! One ready queue, FIFO within it; the idle task sits outside the
//! queue and runs only when nothing else is ready. Everything here
//! runs under the big kernel lock, and a context switch happens with
//! the lock held at depth exactly 1. Ownership of the lock is
//! transferred to the incoming task, which releases it on its own
//! unwind path.

use alloc::boxed::Box;

use crate::arch::{self, percpu};
use crate::sync::{KernelCell, KERNEL_LOCK};

use super::queue::WaitQueue;
use super::table;
use super::task::Task;
use super::{TaskId, TaskState, IDLE_TASK_ID};

struct Scheduler {
    /// Task owning the CPU
    current: TaskId,
    /// Global ready queue (idle task excluded)
    ready: WaitQueue,
    /// Remaining quantum of the current task, in ticks
    quantum: u32,
    /// A dead task waiting to be reaped after its final switch
    reap: Option<TaskId>,
}

/// Quantum is a single tick for the default scheduler.
const DEFAULT_QUANTUM: u32 = 1;

static SCHEDULER: KernelCell<Scheduler> = KernelCell::new(Scheduler {
    current: IDLE_TASK_ID,
    ready: WaitQueue::new(),
    quantum: DEFAULT_QUANTUM,
    reap: None,
});

/// Turn the boot flow of control into the idle task. Kernel lock held.
pub(super) fn init_locked() {
    // SAFETY: kernel lock held.
    let sched = unsafe { SCHEDULER.get() };
    // SAFETY: boot runs on the address space the bootloader built.
    let space = unsafe { crate::mm::AddressSpace::from_active() };
    let idle = Task::idle(space);
    percpu::set_current_task(idle.id);
    sched.current = idle.id;
    table::insert(idle);
    log::info!("sched: idle task ready");
}

/// Insert a task into the ready queue. Kernel lock held.
pub(super) fn add_task_locked(mut task: Box<Task>) -> TaskId {
    let id = task.id;
    task.state = TaskState::Ready;
    table::insert(task);
    // SAFETY: kernel lock held.
    let sched = unsafe { SCHEDULER.get() };
    sched.ready.push_back(id);
    id
}

/// Move the current task to the ready tail and run somebody else.
pub fn yield_now() {
    let _guard = crate::sync::kernel_lock::lock();
    yield_locked();
}

/// Yield with the kernel lock already held.
pub fn yield_locked() {
    // SAFETY: kernel lock held.
    let sched = unsafe { SCHEDULER.get() };
    let current = sched.current;

    if current != IDLE_TASK_ID {
        let task = table::task_ptr(current).expect("current task must exist");
        // SAFETY: kernel lock held.
        let task = unsafe { task.get() };
        debug_assert_eq!(task.state, TaskState::Running);
        task.state = TaskState::Ready;
        sched.ready.push_back(current);
    }

    schedule();
}

/// Park the current task on `queue` in `state` and run somebody else.
/// Returns when the task is woken. Kernel lock held.
pub(super) fn suspend_locked(queue: *mut WaitQueue, state: TaskState) {
    debug_assert!(state.is_blocked());
    // SAFETY: kernel lock held.
    let sched = unsafe { SCHEDULER.get() };
    let current = sched.current;
    debug_assert_ne!(current, IDLE_TASK_ID, "the idle task cannot block");

    let task = table::task_ptr(current).expect("current task must exist");
    // SAFETY: kernel lock held.
    unsafe { task.get() }.state = state;
    // SAFETY: queue is address-stable per the WaitQueue contract and
    // the kernel lock serializes access.
    unsafe { (*queue).push_back(current) };

    schedule();
}

/// Move `id` from its wait queue to the ready queue. Kernel lock held.
pub(super) fn wake_locked(id: TaskId) {
    let Some(task) = table::task_ptr(id) else {
        return;
    };
    // SAFETY: kernel lock held.
    let task = unsafe { task.get() };

    match task.state {
        TaskState::Ready | TaskState::Running => {}
        TaskState::IpcSend | TaskState::IpcReceive | TaskState::Sleeping => {
            let queue = task.wait_queue;
            debug_assert!(!queue.is_null(), "blocked task must be queued");
            if !queue.is_null() {
                // SAFETY: queue back-links point at live, address-stable
                // queues; kernel lock held.
                unsafe { (*queue).remove(id) };
            }
            task.state = TaskState::Ready;
            // SAFETY: kernel lock held.
            let sched = unsafe { SCHEDULER.get() };
            sched.ready.push_back(id);
        }
        TaskState::Dead => {}
    }
}

/// Transition the current task to `Dead` and schedule; never returns.
pub(super) fn die_locked(status: i32) -> ! {
    // SAFETY: kernel lock held.
    let sched = unsafe { SCHEDULER.get() };
    let current = sched.current;
    assert_ne!(current, IDLE_TASK_ID, "the idle task is immortal");

    // Flush any corpse still waiting so ours cannot overwrite it.
    reap_locked();

    let task = table::task_ptr(current).expect("current task must exist");
    // SAFETY: kernel lock held.
    let task = unsafe { task.get() };
    task.state = TaskState::Dead;
    task.exit_status = status;
    // SAFETY: kernel lock held.
    let sched = unsafe { SCHEDULER.get() };
    sched.reap = Some(current);
    log::debug!("task {} exited with status {}", current, status);

    schedule();
    unreachable!("a dead task was rescheduled");
}

/// Timer tick: account the quantum and preempt when it is exhausted.
/// Called from the interrupt path with interrupts disabled.
pub fn tick() {
    if KERNEL_LOCK.is_held() {
        // Somebody is mid-critical-section; yield on their unlock.
        KERNEL_LOCK.request_resched();
        return;
    }

    let _guard = crate::sync::kernel_lock::lock();
    // SAFETY: kernel lock held.
    let sched = unsafe { SCHEDULER.get() };
    if sched.quantum > 0 {
        sched.quantum -= 1;
    }
    if sched.quantum == 0 {
        yield_locked();
    }
}

/// Pick the next task and switch to it. Kernel lock held at depth 1;
/// the current task's state has already been moved out of `Running`
/// (or it is the idle task).
fn schedule() {
    debug_assert_eq!(KERNEL_LOCK.depth(), 1, "switch requires exactly one lock level");

    // SAFETY: kernel lock held.
    let sched = unsafe { SCHEDULER.get() };
    let previous = sched.current;
    let next = sched.ready.pop_front().unwrap_or(IDLE_TASK_ID);

    if next == previous {
        // Nothing else to run; the caller keeps the CPU.
        let task = table::task_ptr(previous).expect("current task must exist");
        // SAFETY: kernel lock held.
        unsafe { task.get() }.state = TaskState::Running;
        sched.quantum = DEFAULT_QUANTUM;
        return;
    }

    let prev_ptr = table::task_ptr(previous).expect("outgoing task must exist");
    let next_ptr = table::task_ptr(next).expect("incoming task must exist");
    // SAFETY: kernel lock held; both tasks are distinct table entries.
    let prev = unsafe { prev_ptr.get() };
    let next_task = unsafe { next_ptr.get() };

    next_task.state = TaskState::Running;
    sched.current = next;
    sched.quantum = DEFAULT_QUANTUM;

    // The outgoing task's user FPU state was already saved by the
    // syscall/interrupt entry guard; the incoming task's is restored on
    // its own exit path.

    // Privilege-stack and syscall entry point at the incoming task's
    // kernel stack.
    percpu::set_current_task(next);
    percpu::set_kernel_stack(next_task.kernel_stack_bottom);
    #[cfg(target_arch = "x86_64")]
    arch::gdt::set_kernel_stack(next_task.kernel_stack_bottom);

    // Load the incoming root only if it differs.
    next_task.address_space.activate();

    // The incoming task inherits the lock and releases it on its own
    // unwind (or in the trampoline for a first run).
    KERNEL_LOCK.transfer(next);

    // SAFETY: both contexts are valid; interrupts are disabled while
    // the lock is held.
    unsafe {
        arch::context_switch(&mut prev.context, &next_task.context);
    }

    // We are back: some other task switched to us and transferred the
    // lock. Reap whatever died while we were away.
    reap_locked();
}

/// Reap a pending corpse, if any. Used by the task trampoline, which
/// bypasses the post-switch path in `schedule`.
pub(super) fn reap_pending() {
    reap_locked();
}

/// Free a dead task after its final switch away. Kernel lock held.
fn reap_locked() {
    // SAFETY: kernel lock held.
    let sched = unsafe { SCHEDULER.get() };
    let Some(dead_id) = sched.reap.take() else {
        return;
    };
    if let Some(mut dead) = table::remove(dead_id) {
        // Tasks still parked on the dead task's sender queue stay
        // blocked (there is no cancellation), but they must be
        // unlinked so their queue back-links do not dangle into the
        // freed block.
        while dead.ipc_senders.pop_front().is_some() {}
        dead.release_kernel_stack();
        // Dropping the box releases the address-space reference; the
        // user half is torn down when the last sibling exits.
    }
}

/// The idle loop the boot task settles into. Interrupts wake it for
/// ticks; anything ready preempts it immediately.
pub fn idle_loop() -> ! {
    loop {
        // Pick up work that became ready while interrupts were off.
        {
            let _guard = crate::sync::kernel_lock::lock();
            yield_locked();
        }
        arch::wait_for_interrupt();
    }
}
