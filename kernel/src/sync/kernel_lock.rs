//! The big kernel lock
//!
//! A single recursive lock serializes all syscalls, all interrupt
//! handlers except the raw tick accounting, and every page-table edit.
//! Interrupts are disabled on the owning CPU while it is held. The
//! design leaves room to split it into a PMM lock, per-address-space
//! locks, and per-wait-queue locks without changing any contract.
//!
//! Context switches happen with the lock held at depth exactly 1; the
//! scheduler transfers ownership to the incoming task, which releases
//! it on its own unwind path (or in the task trampoline for a first
//! run).

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::arch;

/// Sentinel for "nobody holds the lock"
const FREE: u64 = u64::MAX;

pub struct KernelLock {
    /// Task id of the owner, `FREE` when unheld
    owner: AtomicU64,
    /// Recursion depth of the owner
    depth: AtomicUsize,
    /// Were interrupts enabled when the outermost acquisition happened?
    irq_was_enabled: AtomicBool,
    /// A tick arrived while the lock was held; yield on final release
    need_resched: AtomicBool,
}

pub static KERNEL_LOCK: KernelLock = KernelLock {
    owner: AtomicU64::new(FREE),
    depth: AtomicUsize::new(0),
    irq_was_enabled: AtomicBool::new(false),
    need_resched: AtomicBool::new(false),
};

/// RAII guard; dropping releases one level of the lock.
pub struct KernelLockGuard {
    _private: (),
}

impl KernelLock {
    /// Acquire the lock, disabling interrupts. Re-entrant for the
    /// owning task.
    pub fn lock(&self) -> KernelLockGuard {
        let irq = arch::interrupts_off();
        let me = arch::percpu::current_task_id();

        if self.owner.load(Ordering::Relaxed) == me && self.depth.load(Ordering::Relaxed) > 0 {
            self.depth.fetch_add(1, Ordering::Relaxed);
            return KernelLockGuard { _private: () };
        }

        // Single CPU with interrupts off: the lock is either free or
        // held by a task we switched away from, which cannot happen
        // (switches occur only with the lock held and transfer it).
        while self
            .owner
            .compare_exchange(FREE, me, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        self.depth.store(1, Ordering::Relaxed);
        self.irq_was_enabled.store(irq, Ordering::Relaxed);
        KernelLockGuard { _private: () }
    }

    /// Is the lock currently held (by anyone)?
    pub fn is_held(&self) -> bool {
        self.owner.load(Ordering::Relaxed) != FREE
    }

    /// Current recursion depth (0 when free).
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Ask for a yield on final release; used by the tick when it finds
    /// the lock held.
    pub fn request_resched(&self) {
        self.need_resched.store(true, Ordering::Relaxed);
    }

    /// Hand ownership to the task we are about to switch to. Called by
    /// the scheduler with depth exactly 1.
    pub(crate) fn transfer(&self, new_owner: u64) {
        debug_assert_eq!(self.depth.load(Ordering::Relaxed), 1);
        self.owner.store(new_owner, Ordering::Relaxed);
    }

    /// Release one level without a guard object. Only the task
    /// trampoline uses this: a fresh task inherits the lock from the
    /// switch that started it but has no guard on its stack to drop.
    pub(crate) fn unlock_one(&self) {
        self.unlock();
    }

    fn unlock(&self) {
        let depth = self.depth.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(depth >= 1);
        if depth > 1 {
            return;
        }

        let irq = self.irq_was_enabled.load(Ordering::Relaxed);
        let resched = self.need_resched.swap(false, Ordering::Relaxed);
        self.owner.store(FREE, Ordering::Release);
        arch::interrupts_restore(irq);

        if resched {
            crate::sched::yield_now();
        }
    }
}

impl Drop for KernelLockGuard {
    fn drop(&mut self) {
        KERNEL_LOCK.unlock();
    }
}

/// Convenience wrapper: acquire the big kernel lock.
pub fn lock() -> KernelLockGuard {
    KERNEL_LOCK.lock()
}
