//! Interrupt Descriptor Table and exception handlers
//!
//! Interrupt controller programming is an external collaborator; the
//! only vectors the core owns are the CPU exceptions and the scheduler
//! tick.

use core::arch::asm;

use lazy_static::lazy_static;
use x86_64::registers::control::Cr2;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};
use x86_64::PrivilegeLevel;

/// Vector the timer tick arrives on (IRQ0 remapped)
pub const TIMER_VECTOR: u8 = 32;

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_fault_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        // SAFETY: the IST slot is set up by gdt::init before the IDT is
        // loaded.
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(super::gdt::DOUBLE_FAULT_IST_INDEX);
        }
        idt[TIMER_VECTOR].set_handler_fn(timer_interrupt_handler);
        idt
    };
}

pub fn init() {
    IDT.load();
}

/// Did the interrupted code run in ring 3? If so the kernel GS base is
/// still swapped out and we must `swapgs` around the handler body.
fn entered_from_user(frame: &InterruptStackFrame) -> bool {
    frame.code_segment.rpl() == PrivilegeLevel::Ring3
}

/// Swap GS bases. The x86-interrupt ABI gives us no early asm hook, so
/// handlers that touch per-CPU data call this themselves, bracketed by
/// the `entered_from_user` check.
#[inline]
fn swap_gs() {
    // SAFETY: paired swapgs around the handler body; interrupts stay
    // disabled for the gate's duration.
    unsafe { asm!("swapgs", options(nostack, preserves_flags)) };
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    log::warn!("EXCEPTION: breakpoint\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    panic!("EXCEPTION: double fault\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn general_protection_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    let from_user = entered_from_user(&stack_frame);
    if from_user {
        swap_gs();
        log::error!(
            "general protection fault in user mode, error {:#x}\n{:#?}",
            error_code,
            stack_frame
        );
        crate::sched::kill_current(crate::error::KernelError::Fault.code() as i32);
    }
    panic!(
        "EXCEPTION: general protection fault, error {:#x}\n{:#?}",
        error_code, stack_frame
    );
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    let fault_addr = Cr2::read().map(|a| a.as_u64()).unwrap_or(0);
    let from_user = entered_from_user(&stack_frame);

    if from_user {
        swap_gs();
        crate::mm::page_fault::handle_user_fault(
            crate::mm::VirtualAddress::new(fault_addr),
            error_code.bits(),
            stack_frame.instruction_pointer.as_u64(),
        );
        swap_gs();
        return;
    }

    // Kernel-mode fault: unrecoverable bookkeeping error.
    panic!(
        "EXCEPTION: kernel page fault at {:#x}, error {:?}\n{:#?}",
        fault_addr, error_code, stack_frame
    );
}

extern "x86-interrupt" fn timer_interrupt_handler(stack_frame: InterruptStackFrame) {
    let from_user = entered_from_user(&stack_frame);
    if from_user {
        swap_gs();
        // A preemption may switch away; the user's live FPU state must
        // survive in the task's save area until this frame resumes.
        crate::syscall::save_current_fpu();
    }
    super::timer::on_tick();
    if from_user {
        crate::syscall::restore_current_fpu();
        swap_gs();
    }
}
