//! Synchronous IPC rendezvous
//!
//! Endpoints are task ids. A single operation performs an optional send
//! followed by an optional receive; payloads travel through a fixed
//! block of virtual message registers attached to each task. There is
//! no buffering in the kernel beyond those registers: a send completes
//! only when a receiver takes the message (direct handoff), and within
//! one receiver's sender queue delivery is FIFO.

use crate::error::{KernelError, Result};
use crate::sched::{self, table, TaskId, TaskState, WaitQueue};
use crate::sync::KernelCell;

/// Number of virtual message registers per task
pub const REGISTER_COUNT: usize = 16;

/// Size of the message register block in bytes
pub const REGISTER_BYTES: usize = REGISTER_COUNT * 8;

/// "No send" / "no receive" phase marker. Task id 0 is the idle task,
/// which never speaks IPC, so the value is unambiguous.
pub const ENDPOINT_NONE: TaskId = 0;

/// Open wait: accept a message from any sender.
pub const ENDPOINT_ANY: TaskId = u64::MAX;

/// Tasks blocked in the receive phase, regardless of partner.
static RECEIVERS: KernelCell<WaitQueue> = KernelCell::new(WaitQueue::new());

/// Clip a user-supplied length to the register block size.
pub fn clip_len(len: usize) -> usize {
    len.min(REGISTER_BYTES)
}

/// The combined send/receive operation. Caller must hold the kernel
/// lock at depth 1 and run in the current task's address space.
///
/// Returns the partner's id after a receive phase, 0 otherwise.
pub fn ipc_locked(
    send_to: TaskId,
    receive_from: TaskId,
    send_buf: *const u8,
    send_len: usize,
    recv_buf: *mut u8,
    recv_len: usize,
) -> Result<isize> {
    let current_id = sched::current_task_id();
    let current = sched::current_task();

    // Load the message registers from the caller before the send phase.
    if !send_buf.is_null() && send_len > 0 {
        let len = clip_len(send_len);
        // SAFETY: the range was validated against the user half by the
        // syscall layer and the caller's address space is active.
        unsafe {
            let task = current.get();
            core::ptr::copy_nonoverlapping(
                send_buf,
                task.ipc_registers.as_mut_ptr().cast::<u8>(),
                len,
            );
        }
    }

    // Send phase.
    if send_to != ENDPOINT_NONE {
        send_phase(current_id, send_to)?;
    }

    // Receive phase.
    let mut result = 0isize;
    if receive_from != ENDPOINT_NONE {
        result = receive_phase(current_id, receive_from)? as isize;
    }

    // Unload the message registers into the caller after the receive
    // phase.
    if !recv_buf.is_null() && recv_len > 0 {
        let len = clip_len(recv_len);
        // SAFETY: as for the send buffer.
        unsafe {
            let task = current.get();
            core::ptr::copy_nonoverlapping(
                task.ipc_registers.as_ptr().cast::<u8>(),
                recv_buf,
                len,
            );
        }
    }

    Ok(result)
}

/// Deliver the current task's message registers to `send_to`, blocking
/// until the receiver is in a matching open or closed wait.
fn send_phase(current_id: TaskId, send_to: TaskId) -> Result<()> {
    if send_to == current_id || send_to == ENDPOINT_ANY {
        // Sending to yourself can never rendezvous.
        return Err(KernelError::NotFound);
    }

    let receiver_ptr = table::task_ptr(send_to).ok_or(KernelError::NotFound)?;

    // We know who we want to talk to; write it down so the receiver's
    // closed wait can recognize us.
    // SAFETY: kernel lock held.
    unsafe { sched::current_task().get() }.ipc_partner = send_to;

    // SAFETY: kernel lock held.
    let receiver = unsafe { receiver_ptr.get() };
    let receiver_ready = receiver.state == TaskState::IpcReceive
        && (receiver.ipc_partner == ENDPOINT_ANY || receiver.ipc_partner == current_id);

    if !receiver_ready {
        // Receiver is not ready (or not waiting for us): park on its
        // sender queue until it performs a matching receive.
        let queue = &mut receiver.ipc_senders as *mut WaitQueue;
        sched::suspend_current_locked(queue, TaskState::IpcSend);

        // The receiver may have died while we were parked; its
        // endpoint id then no longer resolves.
        if !table::exists(send_to) {
            return Err(KernelError::NotFound);
        }
    }

    // Rendezvous: the receiver is in IpcReceive and ours.
    // SAFETY: kernel lock held; the lookup above re-validated the id.
    let receiver = unsafe { table::task_ptr(send_to).ok_or(KernelError::NotFound)?.get() };
    debug_assert_eq!(receiver.state, TaskState::IpcReceive);
    receiver.ipc_partner = current_id;

    // SAFETY: kernel lock held; distinct tasks.
    let current = unsafe { sched::current_task().get() };
    receiver.ipc_registers = current.ipc_registers;

    sched::wake_locked(send_to);
    Ok(())
}

/// Wait for a message. `receive_from == ENDPOINT_ANY` is an open wait;
/// anything else waits for that specific sender. Returns the partner's
/// id.
fn receive_phase(current_id: TaskId, receive_from: TaskId) -> Result<TaskId> {
    let sender_id = if receive_from == ENDPOINT_ANY {
        // Open wait: whoever has been queued on us the longest.
        // SAFETY: kernel lock held.
        unsafe { sched::current_task().get() }.ipc_senders.front()
    } else {
        table::task_ptr(receive_from).map(|_| receive_from)
    };

    let ready_sender = sender_id.and_then(|id| {
        let sender_ptr = table::task_ptr(id)?;
        // SAFETY: kernel lock held.
        let sender = unsafe { sender_ptr.get() };
        (sender.state == TaskState::IpcSend && sender.ipc_partner == current_id).then_some(id)
    });

    match ready_sender {
        None => {
            // Nobody to pair with yet: record what we accept and block.
            // SAFETY: kernel lock held.
            unsafe { sched::current_task().get() }.ipc_partner = receive_from;
            sched::suspend_current_locked(RECEIVERS.as_ptr(), TaskState::IpcReceive);
        }
        Some(id) => {
            // A sender is parked on us: hand it the CPU's attention and
            // block until it completes the transfer.
            // SAFETY: kernel lock held.
            unsafe { sched::current_task().get() }.ipc_partner = id;
            sched::wake_locked(id);
            sched::suspend_current_locked(RECEIVERS.as_ptr(), TaskState::IpcReceive);
        }
    }

    // Woken by our sender; it stamped its id into our partner field.
    // SAFETY: kernel lock held.
    Ok(unsafe { sched::current_task().get() }.ipc_partner)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_clip_len() {
        assert_eq!(clip_len(0), 0);
        assert_eq!(clip_len(8), 8);
        assert_eq!(clip_len(REGISTER_BYTES), REGISTER_BYTES);
        assert_eq!(clip_len(REGISTER_BYTES + 1), REGISTER_BYTES);
        assert_eq!(clip_len(usize::MAX), REGISTER_BYTES);
    }

    #[test]
    fn test_endpoint_encodings_are_distinct() {
        assert_ne!(ENDPOINT_NONE, ENDPOINT_ANY);
        // Real task ids start above the idle task's 0.
        assert_eq!(ENDPOINT_NONE, 0);
    }
}
