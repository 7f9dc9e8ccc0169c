//! Scheduler tick interface
//!
//! The generic timer and GIC programming are external collaborators;
//! the IRQ vector calls `on_tick` once per tick.

use core::sync::atomic::{AtomicU64, Ordering};

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Monotonic tick count since boot
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Called from the IRQ vector.
pub fn on_tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
    crate::sched::tick();
}
