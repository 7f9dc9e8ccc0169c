//! Futexes
//!
//! One wait queue per futex word, keyed by the word's physical address
//! so threads sharing memory across address spaces agree on the queue.
//! The wait re-reads the word under the kernel lock, which closes the
//! check-then-sleep race against wakers on this single-CPU core.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;

use crate::error::{KernelError, Result};
use crate::mm::{self, VirtualAddress};
use crate::sched::{self, TaskState, WaitQueue};
use crate::sync::{kernel_lock, KernelCell};

static FUTEX_QUEUES: KernelCell<BTreeMap<u64, Box<WaitQueue>>> = KernelCell::new(BTreeMap::new());

/// Resolve a user futex word to its physical address (the queue key).
fn futex_key(address: u64) -> Result<u64> {
    if address % 4 != 0 {
        return Err(KernelError::InvalidArguments);
    }
    mm::check_user_range(address, 4)?;
    mm::address_space::active()
        .translate(VirtualAddress::new(address))
        .map(|phys| phys.as_u64())
        .ok_or(KernelError::InvalidArguments)
}

/// Block until the word at `address` is woken, unless it no longer
/// holds `expected`. Returns 0 after a wakeup, 1 when the value check
/// failed immediately.
pub fn wait(address: u64, expected: u64) -> Result<isize> {
    let _guard = kernel_lock::lock();

    let key = futex_key(address)?;

    // Re-read under the lock: a waker that changed the word before we
    // got here must not strand us.
    // SAFETY: the range was validated and the caller's address space
    // is active.
    let value = unsafe { (address as usize as *const u32).read_volatile() };
    if value != expected as u32 {
        return Ok(1);
    }

    // SAFETY: kernel lock held.
    let queues = unsafe { FUTEX_QUEUES.get() };
    let queue = queues.entry(key).or_insert_with(|| Box::new(WaitQueue::new()));
    let queue_ptr = &mut **queue as *mut WaitQueue;

    sched::suspend_current_locked(queue_ptr, TaskState::Sleeping);
    Ok(0)
}

/// Wake up to `count` waiters of the word at `address`. Returns the
/// number woken.
pub fn wake(address: u64, count: u64) -> Result<isize> {
    let _guard = kernel_lock::lock();

    let key = futex_key(address)?;

    // SAFETY: kernel lock held.
    let queues = unsafe { FUTEX_QUEUES.get() };
    let Some(queue) = queues.get_mut(&key) else {
        return Ok(0);
    };

    let mut woken = 0isize;
    while (woken as u64) < count {
        let Some(id) = queue.front() else { break };
        sched::wake_locked(id);
        woken += 1;
    }

    if queue.is_empty() {
        queues.remove(&key);
    }

    Ok(woken)
}
