//! IrisOS kernel library
//!
//! Core of a UEFI-booted research microkernel for x86_64 and aarch64.
//! The library form exists so host-side unit tests and the bare-metal
//! integration tests can both link against the kernel proper.

#![no_std]
#![cfg_attr(all(test, target_os = "none"), no_main)]
#![cfg_attr(target_os = "none", feature(custom_test_frameworks))]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]
#![cfg_attr(all(target_arch = "x86_64", target_os = "none"), feature(abi_x86_interrupt))]
#![cfg_attr(target_os = "none", test_runner(crate::test_framework::test_runner))]
#![cfg_attr(target_os = "none", reexport_test_harness_main = "test_main")]

extern crate alloc;

// Bare-metal targets get the kernel heap; the host target delegates to the
// system allocator so unit tests can use Vec/String/Box normally.
#[cfg(target_os = "none")]
use linked_list_allocator::LockedHeap;

#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[cfg(not(target_os = "none"))]
extern crate std;

#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

/// Get a reference to the kernel heap allocator
#[cfg(target_os = "none")]
pub fn allocator() -> &'static LockedHeap {
    &ALLOCATOR
}

#[macro_use]
pub mod print;

pub mod arch;
pub mod bootinfo;
pub mod elf;
pub mod error;
pub mod ipc;
pub mod mm;
pub mod sched;
pub mod serial;
pub mod sync;
pub mod syscall;
pub mod usermode;
pub mod vdso;

pub mod test_framework;

// Re-exports for tests and the kernel binary
pub use error::{KernelError, Result};
pub use mm::{PhysicalAddress, VirtualAddress, PAGE_SIZE};
pub use test_framework::{exit_qemu, test_panic_handler, QemuExitCode, Testable};

#[cfg(all(test, target_os = "none"))]
#[no_mangle]
pub extern "C" fn _start() -> ! {
    test_main();
    loop {
        core::hint::spin_loop();
    }
}

#[cfg(all(test, target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    test_framework::test_panic_handler(info)
}

/// Heap allocation failure is unrecoverable in a no_std kernel.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("allocation error: {:?}", layout);
}
