//! Global task table
//!
//! Tasks live in boxed allocations owned by the table; `TaskPtr` hands
//! out raw access for code paths that must not allocate or re-enter
//! the allocator (wait queues, the scheduler). Dereferencing a TaskPtr
//! is legal only under the big kernel lock.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::sync::KernelCell;

use super::{Task, TaskId};

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

static TASKS: KernelCell<BTreeMap<TaskId, Box<Task>>> = KernelCell::new(BTreeMap::new());

/// Allocate the next task id. Monotonic, never reused.
pub fn allocate_id() -> TaskId {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Stable pointer to a task owned by the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskPtr(NonNull<Task>);

// SAFETY: dereferencing is gated on holding the kernel lock; the
// pointer itself is freely movable.
unsafe impl Send for TaskPtr {}
unsafe impl Sync for TaskPtr {}

impl TaskPtr {
    /// Borrow the task.
    ///
    /// # Safety
    ///
    /// Kernel lock held; the task has not been reaped.
    pub unsafe fn get(&self) -> &'static mut Task {
        // SAFETY: per the function contract; Box contents are
        // address-stable.
        unsafe { &mut *self.0.as_ptr() }
    }
}

/// Insert a task. Caller must hold the kernel lock.
pub fn insert(task: Box<Task>) {
    // SAFETY: kernel lock held per the function contract.
    let tasks = unsafe { TASKS.get() };
    tasks.insert(task.id, task);
}

/// Remove and return a task. Caller must hold the kernel lock and
/// guarantee no `TaskPtr` to it survives the call.
pub fn remove(id: TaskId) -> Option<Box<Task>> {
    // SAFETY: kernel lock held per the function contract.
    let tasks = unsafe { TASKS.get() };
    tasks.remove(&id)
}

/// Look up a task by id. Caller must hold the kernel lock.
pub fn task_ptr(id: TaskId) -> Option<TaskPtr> {
    // SAFETY: kernel lock held per the function contract.
    let tasks = unsafe { TASKS.get() };
    tasks
        .get_mut(&id)
        .map(|boxed| TaskPtr(NonNull::from(boxed.as_mut())))
}

/// Does a task with this id exist?
pub fn exists(id: TaskId) -> bool {
    // SAFETY: kernel lock held per the function contract.
    let tasks = unsafe { TASKS.get() };
    tasks.contains_key(&id)
}
