//! Kernel synchronization primitives

pub mod kernel_lock;

pub use kernel_lock::{KernelLock, KernelLockGuard, KERNEL_LOCK};

use core::cell::UnsafeCell;

/// A cell whose contents are protected by the big kernel lock rather
/// than a lock of its own. Wait queues and scheduler state live in
/// these: suspension paths must not allocate and must not hold a guard
/// object across a context switch.
pub struct KernelCell<T>(UnsafeCell<T>);

// SAFETY: access goes through `get`, whose contract requires the
// kernel lock (which implies a single CPU owning the data).
unsafe impl<T> Sync for KernelCell<T> {}

impl<T> KernelCell<T> {
    pub const fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }

    /// Borrow the contents mutably.
    ///
    /// # Safety
    ///
    /// The caller must hold the kernel lock and must not let two
    /// borrows overlap.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get(&self) -> &mut T {
        // SAFETY: per the function contract.
        unsafe { &mut *self.0.get() }
    }

    /// Raw pointer to the contents (for storing back-links).
    pub fn as_ptr(&self) -> *mut T {
        self.0.get()
    }
}
