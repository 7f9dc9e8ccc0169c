//! EL1 -> EL0 transition

use core::arch::asm;

/// Enter user mode for the first time via `eret`.
///
/// SPSR_EL1 0x0 selects EL0t with interrupts unmasked; `arg` lands in
/// x0 per the user-side ABI.
///
/// # Safety
///
/// `entry` must be mapped user-executable and `user_stack` user-
/// writable in the active address space; the per-CPU kernel stack must
/// already be installed.
pub unsafe fn enter_user(entry: u64, user_stack: u64, arg: u64) -> ! {
    // SAFETY: per the function contract.
    unsafe {
        asm!(
            "msr elr_el1, {entry}",
            "msr sp_el0, {stack}",
            "msr spsr_el1, xzr",
            "mov x0, {arg}",
            "eret",
            entry = in(reg) entry,
            stack = in(reg) user_stack,
            arg = in(reg) arg,
            options(noreturn)
        );
    }
}

/// Install the user TLS base (TPIDR_EL0) for the current task.
pub fn set_tls_base(base: u64) {
    // SAFETY: writing the EL0 thread-id register has no side effects in
    // EL1.
    unsafe {
        asm!("msr tpidr_el0, {}", in(reg) base, options(nostack, preserves_flags));
    }
}
