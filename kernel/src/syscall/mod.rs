//! System call dispatch
//!
//! The architecture entry stubs materialize a `SyscallFrame` and call
//! `syscall_dispatch_entry`. Everything behind that is portable: the
//! FPU guard, the function table, argument validation, and the mapping
//! of kernel errors onto stable negative return values.

pub mod futex;

use crate::error::{KernelError, Result};
use crate::ipc;
use crate::mm::{
    self, frame_allocator, page_count, phys_to_virt, PageType, VirtualAddress, PAGE_SIZE,
};
use crate::sched;
use crate::sync::kernel_lock;
use crate::usermode;

/// Register state captured at syscall entry. Field order is ABI with
/// the x86_64 entry stub's push sequence; aarch64 fills it in software.
#[repr(C)]
#[derive(Debug)]
pub struct SyscallFrame {
    /// Syscall number on entry, return value on exit
    pub number: u64,
    pub arg1: u64,
    pub arg2: u64,
    pub arg3: u64,
    pub arg4: u64,
    pub arg5: u64,
    pub arg6: u64,
    /// User program counter
    pub user_rip: u64,
    /// User flags/status word
    pub user_rflags: u64,
    /// User stack pointer
    pub user_rsp: u64,
}

/// The syscall vector. Numbers are ABI; never renumber.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Exit = 1,
    Mmap = 2,
    Munmap = 3,
    Thread = 4,
    Ipc = 5,
    Log = 6,
    Yield = 7,
    FutexWait = 8,
    FutexWake = 9,
}

impl TryFrom<u64> for Syscall {
    type Error = KernelError;

    fn try_from(value: u64) -> Result<Self> {
        match value {
            1 => Ok(Syscall::Exit),
            2 => Ok(Syscall::Mmap),
            3 => Ok(Syscall::Munmap),
            4 => Ok(Syscall::Thread),
            5 => Ok(Syscall::Ipc),
            6 => Ok(Syscall::Log),
            7 => Ok(Syscall::Yield),
            8 => Ok(Syscall::FutexWait),
            9 => Ok(Syscall::FutexWake),
            _ => Err(KernelError::InvalidArguments),
        }
    }
}

/// FPU guard: every syscall saves the user's FPU state on the way in
/// and restores it on the way out, so the kernel's incidental SIMD use
/// (memcpy, checksums) can never corrupt user context.
struct FpuGuard;

impl FpuGuard {
    fn enter() -> Self {
        let _guard = kernel_lock::lock();
        let current = sched::current_task();
        // SAFETY: kernel lock held; the FPU area belongs to the task
        // running on this CPU.
        unsafe { current.get() }.fpu.save();
        FpuGuard
    }
}

impl Drop for FpuGuard {
    fn drop(&mut self) {
        let _guard = kernel_lock::lock();
        let current = sched::current_task();
        // SAFETY: as in enter().
        unsafe { current.get() }.fpu.restore();
    }
}

/// Save the current task's live FPU state into its save area. The
/// preemption interrupt calls this when it arrives from user mode, so
/// a switch away cannot lose user FPU context.
pub fn save_current_fpu() {
    let _guard = kernel_lock::lock();
    let current = sched::current_task();
    // SAFETY: kernel lock held; the area belongs to this CPU's task.
    unsafe { current.get() }.fpu.save();
}

/// Restore the current task's FPU state from its save area; the
/// counterpart of [`save_current_fpu`] on the interrupt return path.
pub fn restore_current_fpu() {
    let _guard = kernel_lock::lock();
    let current = sched::current_task();
    // SAFETY: as in save_current_fpu.
    unsafe { current.get() }.fpu.restore();
}

/// Entry point called by the architecture stubs.
#[no_mangle]
pub extern "C" fn syscall_dispatch_entry(frame: &mut SyscallFrame) {
    let _fpu = FpuGuard::enter();

    let result = dispatch(frame);
    frame.number = match result {
        Ok(value) => value as u64,
        Err(err) => err.code() as u64,
    };
}

fn dispatch(frame: &SyscallFrame) -> Result<isize> {
    let syscall = Syscall::try_from(frame.number)?;
    match syscall {
        Syscall::Exit => sys_exit(frame.arg1 as i32),
        Syscall::Mmap => sys_mmap(frame.arg1, frame.arg2),
        Syscall::Munmap => sys_munmap(frame.arg1, frame.arg2),
        Syscall::Thread => sys_thread(frame.arg1, frame.arg2, frame.arg3, frame.arg4, frame.arg5),
        Syscall::Ipc => sys_ipc(
            frame.arg1,
            frame.arg2,
            frame.arg3,
            frame.arg4,
            frame.arg5,
            frame.arg6,
        ),
        Syscall::Log => sys_log(frame.arg1, frame.arg2),
        Syscall::Yield => sys_yield(),
        Syscall::FutexWait => futex::wait(frame.arg1, frame.arg2),
        Syscall::FutexWake => futex::wake(frame.arg1, frame.arg2),
    }
}

fn sys_exit(status: i32) -> Result<isize> {
    sched::kill_current(status)
}

/// Anonymous memory mapping at the caller's hint address.
fn sys_mmap(hint: u64, length: u64) -> Result<isize> {
    let _guard = kernel_lock::lock();

    if hint % PAGE_SIZE as u64 != 0 || length == 0 {
        return Err(KernelError::InvalidArguments);
    }
    mm::check_user_range(hint, length)?;

    let pages = page_count(length) as usize;
    let frames = frame_allocator::allocate_frames(pages)?;
    // SAFETY: fresh frames, zeroed through the direct map before any
    // user mapping exists.
    unsafe {
        core::ptr::write_bytes(
            phys_to_virt(frames.as_addr()).as_mut_ptr::<u8>(),
            0,
            pages * PAGE_SIZE,
        );
    }

    let space = mm::address_space::active();
    space.map(
        frames.as_addr(),
        VirtualAddress::new(hint),
        pages,
        PageType::UserDataRw,
    )?;

    Ok(hint as isize)
}

fn sys_munmap(address: u64, length: u64) -> Result<isize> {
    let _guard = kernel_lock::lock();

    if address % PAGE_SIZE as u64 != 0 || length == 0 {
        return Err(KernelError::InvalidArguments);
    }
    mm::check_user_range(address, length)?;

    let space = mm::address_space::active();
    space.unmap(VirtualAddress::new(address), page_count(length) as usize)?;
    Ok(0)
}

fn sys_thread(func: u64, arg: u64, flags: u64, stack: u64, stack_size: u64) -> Result<isize> {
    let id = usermode::clone_task(func, arg, flags, stack, stack_size)?;
    Ok(id as isize)
}

fn sys_ipc(
    send_to: u64,
    receive_from: u64,
    send_buf: u64,
    send_len: u64,
    recv_buf: u64,
    recv_len: u64,
) -> Result<isize> {
    let _guard = kernel_lock::lock();

    if send_buf != 0 {
        mm::check_user_range(send_buf, ipc::clip_len(send_len as usize) as u64)?;
    }
    if recv_buf != 0 {
        mm::check_user_range(recv_buf, ipc::clip_len(recv_len as usize) as u64)?;
    }

    ipc::ipc_locked(
        send_to,
        receive_from,
        send_buf as usize as *const u8,
        send_len as usize,
        recv_buf as usize as *mut u8,
        recv_len as usize,
    )
}

/// Cap on a single log write; longer texts are clipped, not rejected.
const LOG_MAX: usize = 1024;

fn sys_log(text: u64, length: u64) -> Result<isize> {
    let _guard = kernel_lock::lock();

    if text == 0 {
        return Err(KernelError::InvalidArguments);
    }
    let len = (length as usize).min(LOG_MAX);
    mm::check_user_range(text, len as u64)?;

    // SAFETY: the range was validated to lie in the user half and the
    // caller's address space is active.
    let bytes = unsafe { core::slice::from_raw_parts(text as usize as *const u8, len) };
    match core::str::from_utf8(bytes) {
        Ok(s) => crate::print!("{}", s),
        Err(_) => return Err(KernelError::InvalidArguments),
    }

    Ok(length as isize)
}

fn sys_yield() -> Result<isize> {
    sched::yield_now();
    Ok(0)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_syscall_numbers_are_abi() {
        assert_eq!(Syscall::try_from(1).unwrap(), Syscall::Exit);
        assert_eq!(Syscall::try_from(5).unwrap(), Syscall::Ipc);
        assert_eq!(Syscall::try_from(9).unwrap(), Syscall::FutexWake);
        assert!(Syscall::try_from(0).is_err());
        assert!(Syscall::try_from(10).is_err());
    }

    #[test]
    fn test_frame_layout_matches_entry_stub() {
        use core::mem::offset_of;
        assert_eq!(offset_of!(SyscallFrame, number), 0x00);
        assert_eq!(offset_of!(SyscallFrame, arg1), 0x08);
        assert_eq!(offset_of!(SyscallFrame, arg6), 0x30);
        assert_eq!(offset_of!(SyscallFrame, user_rip), 0x38);
        assert_eq!(offset_of!(SyscallFrame, user_rflags), 0x40);
        assert_eq!(offset_of!(SyscallFrame, user_rsp), 0x48);
    }
}
