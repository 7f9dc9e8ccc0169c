//! aarch64 exception vectors
//!
//! One 2 KiB vector table for EL1. Lower-EL synchronous exceptions are
//! either SVCs (the syscall path) or user faults; IRQs feed the
//! scheduler tick. The GIC itself is an external collaborator.

use core::arch::{asm, global_asm};

use crate::syscall::SyscallFrame;

// Each vector saves the caller-saved register window plus the exception
// return state, calls the marked Rust handler, and returns through
// eret. Lower-EL entries switch from SP_EL0 to the per-CPU kernel
// stack via TPIDR_EL1 (offsets are ABI with percpu::Cpu).
global_asm!(
    r#"
.macro SAVE_FRAME
    sub sp, sp, #0x120
    stp x0, x1, [sp, #0x00]
    stp x2, x3, [sp, #0x10]
    stp x4, x5, [sp, #0x20]
    stp x6, x7, [sp, #0x30]
    stp x8, x9, [sp, #0x40]
    stp x10, x11, [sp, #0x50]
    stp x12, x13, [sp, #0x60]
    stp x14, x15, [sp, #0x70]
    stp x16, x17, [sp, #0x80]
    stp x18, x19, [sp, #0x90]
    stp x20, x21, [sp, #0xA0]
    stp x22, x23, [sp, #0xB0]
    stp x24, x25, [sp, #0xC0]
    stp x26, x27, [sp, #0xD0]
    stp x28, x29, [sp, #0xE0]
    mrs x9, elr_el1
    stp x30, x9, [sp, #0xF0]
    mrs x9, spsr_el1
    mrs x10, sp_el0
    stp x9, x10, [sp, #0x100]
.endm

.macro RESTORE_FRAME
    ldp x9, x10, [sp, #0x100]
    msr spsr_el1, x9
    msr sp_el0, x10
    ldp x30, x9, [sp, #0xF0]
    msr elr_el1, x9
    ldp x28, x29, [sp, #0xE0]
    ldp x26, x27, [sp, #0xD0]
    ldp x24, x25, [sp, #0xC0]
    ldp x22, x23, [sp, #0xB0]
    ldp x20, x21, [sp, #0xA0]
    ldp x18, x19, [sp, #0x90]
    ldp x16, x17, [sp, #0x80]
    ldp x14, x15, [sp, #0x70]
    ldp x12, x13, [sp, #0x60]
    ldp x10, x11, [sp, #0x50]
    ldp x8, x9, [sp, #0x40]
    ldp x6, x7, [sp, #0x30]
    ldp x4, x5, [sp, #0x20]
    ldp x2, x3, [sp, #0x10]
    ldp x0, x1, [sp, #0x00]
    add sp, sp, #0x120
.endm

.balign 2048
.global exception_vector_table
exception_vector_table:
    // Current EL with SP_EL0: unused, treated as fatal.
    .balign 128
    b vector_fatal
    .balign 128
    b vector_fatal
    .balign 128
    b vector_fatal
    .balign 128
    b vector_fatal

    // Current EL with SP_ELx: kernel-mode exceptions.
    .balign 128
    b vector_kernel_sync
    .balign 128
    b vector_kernel_irq
    .balign 128
    b vector_fatal
    .balign 128
    b vector_fatal

    // Lower EL, AArch64: user-mode exceptions.
    .balign 128
    b vector_user_sync
    .balign 128
    b vector_user_irq
    .balign 128
    b vector_fatal
    .balign 128
    b vector_fatal

    // Lower EL, AArch32: unsupported.
    .balign 128
    b vector_fatal
    .balign 128
    b vector_fatal
    .balign 128
    b vector_fatal
    .balign 128
    b vector_fatal

vector_kernel_sync:
    SAVE_FRAME
    mov x0, sp
    bl kernel_sync_handler
    RESTORE_FRAME
    eret

vector_kernel_irq:
    SAVE_FRAME
    bl irq_handler
    RESTORE_FRAME
    eret

vector_user_sync:
    SAVE_FRAME
    mov x0, sp
    bl user_sync_handler
    RESTORE_FRAME
    eret

vector_user_irq:
    SAVE_FRAME
    bl user_irq_handler
    RESTORE_FRAME
    eret

vector_fatal:
    SAVE_FRAME
    mov x0, sp
    bl fatal_exception_handler
    b .
"#
);

extern "C" {
    static exception_vector_table: u8;
}

/// Saved register window, layout matching SAVE_FRAME above.
#[repr(C)]
pub struct TrapFrame {
    pub x: [u64; 31],
    pub elr: u64,
    pub spsr: u64,
    pub sp_el0: u64,
}

/// Install the vector table.
pub fn init() {
    // SAFETY: the table is 2 KiB aligned by the directive above.
    unsafe {
        let base = &exception_vector_table as *const u8 as u64;
        asm!("msr vbar_el1, {}", "isb", in(reg) base, options(nostack, preserves_flags));
    }
}

fn read_esr() -> u64 {
    let esr: u64;
    // SAFETY: reading ESR_EL1 has no side effects.
    unsafe {
        asm!("mrs {}, esr_el1", out(reg) esr, options(nostack, preserves_flags));
    }
    esr
}

fn read_far() -> u64 {
    let far: u64;
    // SAFETY: reading FAR_EL1 has no side effects.
    unsafe {
        asm!("mrs {}, far_el1", out(reg) far, options(nostack, preserves_flags));
    }
    far
}

/// Synchronous exception from EL0.
#[no_mangle]
extern "C" fn user_sync_handler(frame: &mut TrapFrame) {
    let esr = read_esr();
    let ec = (esr >> 26) & 0x3F;

    match ec {
        // SVC from AArch64
        0x15 => {
            let mut syscall = SyscallFrame {
                number: frame.x[8],
                arg1: frame.x[0],
                arg2: frame.x[1],
                arg3: frame.x[2],
                arg4: frame.x[3],
                arg5: frame.x[4],
                arg6: frame.x[5],
                user_rip: frame.elr,
                user_rflags: frame.spsr,
                user_rsp: frame.sp_el0,
            };
            crate::syscall::syscall_dispatch_entry(&mut syscall);
            frame.x[0] = syscall.number;
        }
        // Instruction or data abort from EL0
        0x20 | 0x24 => {
            crate::mm::page_fault::handle_user_fault(
                crate::mm::VirtualAddress::new(read_far()),
                esr,
                frame.elr,
            );
        }
        _ => {
            log::error!("unhandled EL0 exception, esr {:#x} elr {:#x}", esr, frame.elr);
            crate::sched::kill_current(crate::error::KernelError::Fault.code() as i32);
        }
    }
}

/// Synchronous exception from EL1: a kernel bug.
#[no_mangle]
extern "C" fn kernel_sync_handler(frame: &mut TrapFrame) {
    panic!(
        "kernel exception: esr {:#x} far {:#x} elr {:#x}",
        read_esr(),
        read_far(),
        frame.elr
    );
}

/// IRQ taken in kernel mode: the only interrupt the core consumes is
/// the scheduler tick.
#[no_mangle]
extern "C" fn irq_handler() {
    super::timer::on_tick();
}

/// IRQ taken in user mode: additionally guard the user's live FPU
/// state across a possible preemption switch.
#[no_mangle]
extern "C" fn user_irq_handler() {
    crate::syscall::save_current_fpu();
    super::timer::on_tick();
    crate::syscall::restore_current_fpu();
}

#[no_mangle]
extern "C" fn fatal_exception_handler(frame: &mut TrapFrame) -> ! {
    panic!(
        "unexpected exception: esr {:#x} elr {:#x} spsr {:#x}",
        read_esr(),
        frame.elr,
        frame.spsr
    );
}
