//! Ring 0 -> Ring 3 transition

use core::arch::asm;

use super::gdt;

/// Enter user mode for the first time via `iretq`.
///
/// `iretq` pops RIP, CS, RFLAGS, RSP, SS and drops to the privilege
/// level in CS. `arg` lands in RDI per the user-side ABI. RFLAGS 0x202
/// enables interrupts the moment user code starts.
///
/// # Safety
///
/// - `entry` must be mapped user-executable and `user_stack` mapped
///   user-writable in the active address space
/// - the per-CPU kernel stack slot must already point at this task's
///   kernel stack, or the first syscall will crash
pub unsafe fn enter_user(entry: u64, user_stack: u64, arg: u64) -> ! {
    // SAFETY: per the function contract. swapgs parks the kernel GS
    // base so the next syscall entry can swap it back in.
    unsafe {
        asm!(
            "mov ds, {ss:r}",
            "mov es, {ss:r}",
            "mov fs, {zero:x}",
            "swapgs",
            "push {ss}",
            "push {rsp}",
            "push {rflags}",
            "push {cs}",
            "push {rip}",
            "iretq",
            ss = in(reg) gdt::USER_SS.0 as u64,
            rsp = in(reg) user_stack,
            rflags = in(reg) 0x202u64,
            cs = in(reg) gdt::USER_CS.0 as u64,
            rip = in(reg) entry,
            zero = in(reg) 0u64,
            in("rdi") arg,
            options(noreturn)
        );
    }
}

/// Install the user TLS base (FS) for the current task.
pub fn set_tls_base(base: u64) {
    use x86_64::registers::model_specific::FsBase;
    FsBase::write(x86_64::VirtAddr::new(base));
}
