//! x86_64 SYSCALL/SYSRET entry
//!
//! The CPU arrives here with the user RIP in RCX, RFLAGS in R11, and
//! interrupts masked (SFMASK clears IF). The stub swaps to the kernel
//! GS, parks the user stack pointer in the per-CPU scratch slot, loads
//! the kernel stack, and materializes a `SyscallFrame` for the Rust
//! dispatcher. The return value travels back through the frame's
//! `number` slot.

use x86_64::registers::model_specific::{Efer, EferFlags, LStar, SFMask, Star};
use x86_64::registers::rflags::RFlags;
use x86_64::VirtAddr;

use super::gdt;

pub use crate::syscall::SyscallFrame;

/// SYSCALL instruction target.
///
/// # Safety
///
/// Only the CPU's SYSCALL instruction may jump here.
#[unsafe(naked)]
pub unsafe extern "C" fn syscall_entry() {
    core::arch::naked_asm!(
        "swapgs",                        // kernel GS
        "mov gs:[0x08], rsp",            // park user RSP in the scratch slot
        "mov rsp, gs:[0x00]",            // switch to the kernel stack
        // Build the SyscallFrame (reverse field order).
        "push qword ptr gs:[0x08]",      // user_rsp
        "push r11",                      // user_rflags
        "push rcx",                      // user_rip
        "push r9",                       // arg6
        "push r8",                       // arg5
        "push r10",                      // arg4
        "push rdx",                      // arg3
        "push rsi",                      // arg2
        "push rdi",                      // arg1
        "push rax",                      // number
        "mov rdi, rsp",
        "call {dispatch}",
        // The dispatcher stored the result in frame.number.
        "pop rax",                       // return value
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop r10",
        "pop r8",
        "pop r9",
        "pop rcx",                       // user_rip
        "pop r11",                       // user_rflags
        "pop rsp",                       // user_rsp (last frame slot)
        "swapgs",
        "sysretq",
        dispatch = sym crate::syscall::syscall_dispatch_entry,
    )
}

/// Enable SYSCALL/SYSRET and point the MSRs at the entry stub.
pub fn init() {
    // SAFETY: one-time MSR setup during boot with valid selectors from
    // the already-loaded GDT.
    unsafe {
        Efer::update(|flags| {
            flags.insert(EferFlags::SYSTEM_CALL_EXTENSIONS);
        });
        LStar::write(VirtAddr::new(syscall_entry as usize as u64));
        Star::write(gdt::USER_CS, gdt::USER_SS, gdt::KERNEL_CS, gdt::KERNEL_SS)
            .expect("inconsistent STAR selector layout");
        // Syscalls enter with interrupts masked; the kernel lock
        // re-enables them on release.
        SFMask::write(RFlags::INTERRUPT_FLAG);
    }
}
