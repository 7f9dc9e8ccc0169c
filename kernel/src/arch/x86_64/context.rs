//! x86_64 context switching and FPU state

use core::arch::{asm, naked_asm};

/// Callee-saved register context.
///
/// Only the registers the System V ABI requires a callee to preserve
/// are stored; everything else is dead across the `context_switch`
/// call by definition. The saved `rsp` points at a stack whose top
/// holds the resume address.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct Context {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub rsp: u64,
}

impl Context {
    /// Context for a fresh task: the first switch "returns" into
    /// `task_trampoline`, which moves `entry`/`arg` from their
    /// callee-saved homes into argument registers.
    pub fn new(entry: extern "C" fn(usize) -> !, arg: usize, stack_bottom: u64) -> Self {
        let mut rsp = stack_bottom;
        rsp -= 8;
        // SAFETY: the kernel stack was just allocated and mapped; its
        // top word is ours to seed with the resume address.
        unsafe {
            (rsp as usize as *mut u64).write(task_trampoline as usize as u64);
        }
        Self {
            r15: 0,
            r14: 0,
            r13: arg as u64,
            r12: entry as usize as u64,
            rbx: 0,
            rbp: 0,
            rsp,
        }
    }

    /// Empty context; filled by the first switch away from this task.
    pub const fn empty() -> Self {
        Self {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            rbx: 0,
            rbp: 0,
            rsp: 0,
        }
    }
}

/// First code every kernel task runs. The scheduler hands over with the
/// kernel lock held; release it before entering the task body.
#[unsafe(naked)]
extern "C" fn task_trampoline() -> ! {
    naked_asm!(
        "mov rdi, r12", // entry
        "mov rsi, r13", // arg
        "call {startup}",
        "ud2",
        startup = sym crate::sched::task_startup,
    )
}

/// Switch from `current` to `next`.
///
/// Saves the callee-saved registers and stack pointer of the outgoing
/// task, then restores the incoming task's and returns on its stack.
///
/// # Safety
///
/// Both pointers must reference valid contexts; interrupts must be
/// disabled (the kernel lock is held across the switch).
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(current: *mut Context, next: *const Context) {
    naked_asm!(
        "mov [rdi + 0x00], r15",
        "mov [rdi + 0x08], r14",
        "mov [rdi + 0x10], r13",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], rbx",
        "mov [rdi + 0x28], rbp",
        "mov [rdi + 0x30], rsp",
        "mov r15, [rsi + 0x00]",
        "mov r14, [rsi + 0x08]",
        "mov r13, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov rbx, [rsi + 0x20]",
        "mov rbp, [rsi + 0x28]",
        "mov rsp, [rsi + 0x30]",
        "ret",
    )
}

/// FXSAVE area. 512 bytes, 16-byte aligned as the instruction requires.
#[repr(C, align(16))]
pub struct FpuState {
    area: [u8; 512],
}

impl FpuState {
    /// Power-on default: x87 control word 0x037F, MXCSR 0x1F80,
    /// everything else zero.
    pub fn new() -> Self {
        let mut state = Self { area: [0; 512] };
        state.area[0] = 0x7F; // FCW low
        state.area[1] = 0x03; // FCW high
        state.area[24] = 0x80; // MXCSR low
        state.area[25] = 0x1F; // MXCSR high
        state
    }

    /// Save the CPU's FPU/SSE state into this area.
    pub fn save(&mut self) {
        // SAFETY: the area is 512 bytes and 16-byte aligned, which is
        // all FXSAVE64 requires.
        unsafe {
            asm!("fxsave64 [{}]", in(reg) self.area.as_mut_ptr(), options(nostack));
        }
    }

    /// Restore the CPU's FPU/SSE state from this area.
    pub fn restore(&self) {
        // SAFETY: the area holds a previously saved (or default
        // initialized) FXSAVE image.
        unsafe {
            asm!("fxrstor64 [{}]", in(reg) self.area.as_ptr(), options(nostack));
        }
    }
}

impl Default for FpuState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_fpu_default_control_words() {
        let state = FpuState::new();
        let fcw = u16::from_le_bytes([state.area[0], state.area[1]]);
        let mxcsr = u32::from_le_bytes([
            state.area[24],
            state.area[25],
            state.area[26],
            state.area[27],
        ]);
        assert_eq!(fcw, 0x037F);
        assert_eq!(mxcsr, 0x1F80);
    }

    #[test]
    fn test_context_layout_matches_switch_offsets() {
        assert_eq!(core::mem::offset_of!(Context, r15), 0x00);
        assert_eq!(core::mem::offset_of!(Context, rbx), 0x20);
        assert_eq!(core::mem::offset_of!(Context, rbp), 0x28);
        assert_eq!(core::mem::offset_of!(Context, rsp), 0x30);
    }
}
