//! Bare-metal test framework
//!
//! Integration tests run on the bare-metal target under QEMU with the
//! custom test framework; the `isa-debug-exit` device reports the result.
//! Host-side unit tests use the standard harness and never touch this.

use core::panic::PanicInfo;

/// Anything with a `run` method the test runner can invoke
pub trait Testable {
    fn run(&self);
}

impl<T> Testable for T
where
    T: Fn(),
{
    fn run(&self) {
        crate::serial_print!("{}...\t", core::any::type_name::<T>());
        self();
        crate::serial_println!("[ok]");
    }
}

/// Test runner for `custom_test_frameworks`
pub fn test_runner(tests: &[&dyn Testable]) {
    crate::serial_println!("running {} tests", tests.len());
    for test in tests {
        test.run();
    }
    exit_qemu(QemuExitCode::Success);
}

/// Panic handler shared by all bare-metal test binaries
pub fn test_panic_handler(info: &PanicInfo) -> ! {
    crate::serial_println!("[failed]");
    crate::serial_println!("{}", info);
    exit_qemu(QemuExitCode::Failed);
}

/// Exit codes understood by the QEMU isa-debug-exit device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    Success = 0x10,
    Failed = 0x11,
}

/// Exit QEMU via the isa-debug-exit device (iobase 0xf4)
pub fn exit_qemu(code: QemuExitCode) -> ! {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        use x86_64::instructions::port::Port;
        // SAFETY: Port 0xf4 is the isa-debug-exit device configured by the
        // test runner. Writing to it terminates the VM.
        unsafe {
            let mut port = Port::new(0xf4);
            port.write(code as u32);
        }
    }
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    {
        // QEMU virt: semihosting exit
        let _ = code;
    }
    #[cfg(not(target_os = "none"))]
    {
        extern crate std;
        std::process::exit(if code == QemuExitCode::Success { 0 } else { 1 });
    }
    #[allow(unreachable_code)]
    loop {
        core::hint::spin_loop();
    }
}
