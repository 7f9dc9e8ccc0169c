//! Task scheduling
//!
//! The task state machine, the global task table, intrusive wait
//! queues, and the round-robin scheduler. All mutation happens under
//! the big kernel lock; the public entry points here acquire it, the
//! `*_locked` internals assume it.

pub mod queue;
pub mod scheduler;
pub mod table;
pub mod task;

pub use queue::WaitQueue;
pub use scheduler::{idle_loop, tick, yield_now};
pub use table::TaskPtr;
pub use task::{Task, TlsTemplate};

use crate::sync::kernel_lock;

/// Unique task identifier; also the IPC endpoint namespace.
pub type TaskId = u64;

/// The immortal idle task (one per CPU; id 0 on the BSP).
pub const IDLE_TASK_ID: TaskId = 0;

/// Task lifecycle states.
///
/// `Ready` tasks sit in the ready queue, `Running` is the (single) task
/// owning the CPU, the three wait states each correspond to exactly one
/// wait queue, and `Dead` tasks are reaped after their final switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    /// Blocked in the IPC send phase, queued on the receiver
    IpcSend,
    /// Blocked in the IPC receive phase
    IpcReceive,
    /// Blocked on a futex
    Sleeping,
    Dead,
}

impl TaskState {
    /// Is this one of the wait states a `WaitQueue` may hold?
    pub fn is_blocked(&self) -> bool {
        matches!(self, TaskState::IpcSend | TaskState::IpcReceive | TaskState::Sleeping)
    }
}

/// Initialize the scheduler: the current flow of control becomes the
/// idle task (id 0).
pub fn init() {
    let _guard = kernel_lock::lock();
    scheduler::init_locked();
}

/// Add a new task to the ready queue.
pub fn add_task(task: alloc::boxed::Box<Task>) -> TaskId {
    let _guard = kernel_lock::lock();
    scheduler::add_task_locked(task)
}

/// Move the current task into `state` and park it on `queue`; returns
/// when the task is woken.
///
/// Caller must hold the kernel lock (exactly one level deep).
pub fn suspend_current_locked(queue: *mut WaitQueue, state: TaskState) {
    scheduler::suspend_locked(queue, state);
}

/// Wake `task` out of whatever wait queue it is in; no-op if it is
/// already ready or running.
///
/// Caller must hold the kernel lock.
pub fn wake_locked(id: TaskId) {
    scheduler::wake_locked(id);
}

/// Terminate the current task; never returns.
pub fn kill_current(status: i32) -> ! {
    let _guard = kernel_lock::lock();
    scheduler::die_locked(status)
}

/// Id of the task currently executing on this CPU.
pub fn current_task_id() -> TaskId {
    crate::arch::percpu::current_task_id()
}

/// Pointer to the current task's control block.
///
/// Caller must hold the kernel lock.
pub fn current_task() -> TaskPtr {
    table::task_ptr(current_task_id()).expect("current task not in table")
}

/// First Rust frame of every kernel task. The scheduler hands over
/// with the kernel lock held; release it, then run the task body.
#[no_mangle]
pub extern "C" fn task_startup(entry: extern "C" fn(usize) -> !, arg: usize) -> ! {
    // A first run bypasses the scheduler's post-switch path, so any
    // corpse left by the task we replaced is collected here.
    scheduler::reap_pending();
    crate::sync::KERNEL_LOCK.unlock_one();
    entry(arg)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_blocked_states_are_exactly_the_wait_states() {
        assert!(TaskState::IpcSend.is_blocked());
        assert!(TaskState::IpcReceive.is_blocked());
        assert!(TaskState::Sleeping.is_blocked());
        assert!(!TaskState::Ready.is_blocked());
        assert!(!TaskState::Running.is_blocked());
        assert!(!TaskState::Dead.is_blocked());
    }

    #[test]
    fn test_idle_task_id_is_zero() {
        assert_eq!(IDLE_TASK_ID, 0);
    }
}
