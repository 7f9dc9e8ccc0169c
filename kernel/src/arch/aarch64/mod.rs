//! aarch64 architecture support

pub mod context;
pub mod exceptions;
pub mod mmu;
pub mod percpu;
pub mod timer;
pub mod usermode;

pub use context::{context_switch, Context, FpuState};

use cortex_a::asm;

/// Bring up the boot processor: vectors and per-CPU state.
pub fn init() {
    exceptions::init();
    percpu::init_bsp();
}

/// Halt forever.
pub fn halt() -> ! {
    loop {
        asm::wfe();
    }
}

/// Unmask IRQs and wait for the next one.
#[inline]
pub fn wait_for_interrupt() {
    // SAFETY: unmasking IRQs in the idle loop is the intended state.
    unsafe {
        core::arch::asm!("msr daifclr, #2", options(nostack, preserves_flags));
    }
    asm::wfi();
}

/// Disable interrupts, returning whether they were enabled.
#[inline]
pub fn interrupts_off() -> bool {
    let daif: u64;
    // SAFETY: reading/masking DAIF has no memory effects.
    unsafe {
        core::arch::asm!("mrs {}, daif", out(reg) daif, options(nostack, preserves_flags));
        core::arch::asm!("msr daifset, #2", options(nostack, preserves_flags));
    }
    daif & (1 << 7) == 0
}

/// Re-enable interrupts if `enable`.
#[inline]
pub fn interrupts_restore(enable: bool) {
    if enable {
        // SAFETY: unmasking IRQs only.
        unsafe {
            core::arch::asm!("msr daifclr, #2", options(nostack, preserves_flags));
        }
    }
}
