//! x86_64 architecture support

pub mod context;
pub mod gdt;
#[cfg(target_os = "none")]
pub mod idt;
pub mod mmu;
pub mod percpu;
pub mod syscall;
pub mod timer;
pub mod usermode;

pub use context::{context_switch, Context, FpuState};

/// Bring up the boot processor: descriptor tables, syscall MSRs, and
/// per-CPU state.
pub fn init() {
    gdt::init();
    #[cfg(target_os = "none")]
    idt::init();
    percpu::init_bsp();
    syscall::init();
}

/// Halt forever.
pub fn halt() -> ! {
    loop {
        x86_64::instructions::hlt();
    }
}

/// Enable interrupts and wait for the next one. The `sti; hlt` pair is
/// atomic with respect to the interrupt window, so a tick cannot slip
/// in between and leave us halted forever.
#[inline]
pub fn wait_for_interrupt() {
    x86_64::instructions::interrupts::enable_and_hlt();
}

/// Disable interrupts, returning whether they were enabled.
#[inline]
pub fn interrupts_off() -> bool {
    let were_enabled = x86_64::instructions::interrupts::are_enabled();
    x86_64::instructions::interrupts::disable();
    were_enabled
}

/// Re-enable interrupts if `enable`.
#[inline]
pub fn interrupts_restore(enable: bool) {
    if enable {
        x86_64::instructions::interrupts::enable();
    }
}
