//! Scheduler tick interface
//!
//! Programming the tick source (PIT or local APIC timer) is an external
//! collaborator; the kernel only consumes the resulting interrupt. The
//! handler in `idt.rs` calls `on_tick` once per tick.

use core::sync::atomic::{AtomicU64, Ordering};

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Monotonic tick count since boot
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Called from the timer interrupt vector.
pub fn on_tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
    crate::sched::tick();
}
