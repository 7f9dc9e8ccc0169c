//! VDSO page
//!
//! One read-execute page mapped at a fixed user address, holding two
//! call stubs at stable offsets. User code never needs to know the
//! syscall instruction or its register convention; it calls these.

use crate::error::Result;
use crate::mm::{self, PageType, VirtualAddress, VDSO_BASE};

/// Offset of `syscall(n, a1..a5)` inside the page
pub const SYSCALL_OFFSET: u64 = 0x0;

/// Offset of `syscall_exit(status)` inside the page
pub const SYSCALL_EXIT_OFFSET: u64 = 0x40;

// The stubs shift the C argument registers into the kernel's syscall
// convention. One page, padded to 4 KiB so it can be mapped alone.
#[cfg(target_arch = "x86_64")]
core::arch::global_asm!(
    r#"
.section .vdso, "ax"
.balign 4096
.global vdso_page
vdso_page:
    // syscall(n, a1, a2, a3, a4, a5)
    mov rax, rdi
    mov rdi, rsi
    mov rsi, rdx
    mov rdx, rcx
    mov r10, r8
    mov r8, r9
    syscall
    ret

.org 0x40
    // syscall_exit(status): never returns
    mov rax, 1
    syscall
    ud2

.org 4096
.global vdso_page_end
vdso_page_end:
"#
);

#[cfg(target_arch = "aarch64")]
core::arch::global_asm!(
    r#"
.section .vdso, "ax"
.balign 4096
.global vdso_page
vdso_page:
    // syscall(n, a1, a2, a3, a4, a5)
    mov x8, x0
    mov x0, x1
    mov x1, x2
    mov x2, x3
    mov x3, x4
    mov x4, x5
    svc #0
    ret

.org 0x40
    // syscall_exit(status): never returns
    mov x8, #1
    svc #0
    brk #0

.org 4096
.global vdso_page_end
vdso_page_end:
"#
);

extern "C" {
    static vdso_page: u8;
}

/// User-space address of the `syscall` stub
pub const fn user_syscall_addr() -> u64 {
    VDSO_BASE + SYSCALL_OFFSET
}

/// User-space address of the `syscall_exit` stub
pub const fn user_syscall_exit_addr() -> u64 {
    VDSO_BASE + SYSCALL_EXIT_OFFSET
}

/// Map the VDSO page user-read-execute into the current (active)
/// address space. Caller must hold the kernel lock.
pub fn map_into_current() -> Result<()> {
    let space = mm::address_space::active();
    // The page lives in the kernel image; its frame is found by
    // walking our own mapping.
    // SAFETY: taking the address of the asm-defined page symbol.
    let vdso_virt = VirtualAddress::new(unsafe { &raw const vdso_page } as u64);
    let phys = space
        .translate(vdso_virt)
        .expect("vdso page must be mapped in the kernel image");
    space.map(phys, VirtualAddress::new(VDSO_BASE), 1, PageType::UserCode)
}
