//! Intrusive wait queues
//!
//! The link field lives inside the `Task`, so parking a task never
//! allocates; suspension can happen from the page-fault handler. A
//! task is in at most one queue at a time and records which one with a
//! raw back-link (queues are address-stable: globals, boxed map
//! values, or fields of boxed tasks).

use super::{table, TaskId};

/// FIFO queue of blocked (or ready) tasks, linked through
/// `Task::link`.
#[derive(Debug)]
pub struct WaitQueue {
    head: Option<TaskId>,
    tail: Option<TaskId>,
    len: usize,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// First task in the queue without removing it.
    pub fn front(&self) -> Option<TaskId> {
        self.head
    }

    /// Append `id`. Caller must hold the kernel lock; the task must not
    /// be in any queue.
    pub fn push_back(&mut self, id: TaskId) {
        let task = table::task_ptr(id).expect("queued task must exist");
        // SAFETY: kernel lock held per the function contract.
        let task = unsafe { task.get() };
        debug_assert!(task.wait_queue.is_null(), "task already queued");
        task.link = None;
        task.wait_queue = self as *mut WaitQueue;

        match self.tail {
            Some(tail_id) => {
                let tail = table::task_ptr(tail_id).expect("queue tail must exist");
                // SAFETY: as above.
                unsafe { tail.get() }.link = Some(id);
            }
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.len += 1;
    }

    /// Remove and return the first task. Caller must hold the kernel
    /// lock.
    pub fn pop_front(&mut self) -> Option<TaskId> {
        let id = self.head?;
        let task = table::task_ptr(id).expect("queued task must exist");
        // SAFETY: kernel lock held per the function contract.
        let task = unsafe { task.get() };

        self.head = task.link;
        if self.head.is_none() {
            self.tail = None;
        }
        task.link = None;
        task.wait_queue = core::ptr::null_mut();
        self.len -= 1;
        Some(id)
    }

    /// Unlink `id` from the middle of the queue. Caller must hold the
    /// kernel lock. Returns whether the task was present.
    pub fn remove(&mut self, id: TaskId) -> bool {
        let mut prev: Option<TaskId> = None;
        let mut cursor = self.head;

        while let Some(current) = cursor {
            let task = table::task_ptr(current).expect("queued task must exist");
            // SAFETY: kernel lock held per the function contract.
            let task = unsafe { task.get() };

            if current == id {
                match prev {
                    Some(prev_id) => {
                        let prev_task = table::task_ptr(prev_id).expect("queue link must exist");
                        // SAFETY: as above.
                        unsafe { prev_task.get() }.link = task.link;
                    }
                    None => self.head = task.link,
                }
                if self.tail == Some(id) {
                    self.tail = prev;
                }
                task.link = None;
                task.wait_queue = core::ptr::null_mut();
                self.len -= 1;
                return true;
            }

            prev = cursor;
            cursor = task.link;
        }
        false
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}
