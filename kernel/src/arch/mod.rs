//! Architecture support
//!
//! Each architecture provides the same surface: `mmu` (page-table
//! plumbing behind the recursive windows), `percpu` (the `Cpu` block at
//! a fixed base register), `context` (register save area and switch),
//! `usermode` (the ring transition), and the syscall entry.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "x86_64")]
pub use x86_64::*;

#[cfg(target_arch = "aarch64")]
pub mod aarch64;

#[cfg(target_arch = "aarch64")]
pub use aarch64::*;
