//! Serial log sink
//!
//! All kernel diagnostics end up here: the `print!`/`println!` macros and
//! the `log` crate facade both write to the platform UART. Device-level
//! UART programming beyond "write a byte" is out of scope; this module is
//! the data sink the rest of the kernel logs into.

use core::fmt::{self, Write};

use log::{LevelFilter, Metadata, Record};
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use spin::Mutex;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use uart_16550::SerialPort;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
static SERIAL1: Mutex<Option<SerialPort>> = Mutex::new(None);

/// Base of the PL011 UART on the QEMU virt machine
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
const UART0_BASE: usize = 0x0900_0000;

struct SerialWriter;

impl Write for SerialWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        {
            let mut port = SERIAL1.lock();
            if let Some(ref mut port) = *port {
                for byte in s.bytes() {
                    port.send(byte);
                }
            }
        }
        #[cfg(all(target_arch = "aarch64", target_os = "none"))]
        {
            for byte in s.bytes() {
                // SAFETY: UART0_BASE is the PL011 data register on the only
                // platform this code path is compiled for. Writes are
                // fire-and-forget.
                unsafe { (UART0_BASE as *mut u8).write_volatile(byte) };
            }
        }
        #[cfg(not(target_os = "none"))]
        {
            extern crate std;
            use std::io::Write as _;
            let _ = std::io::stderr().write_all(s.as_bytes());
        }
        Ok(())
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    let _ = SerialWriter.write_fmt(args);
}

struct SerialLogger;

impl log::Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            crate::println!("[{:5}] {}: {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: SerialLogger = SerialLogger;

/// Initialize the UART and install the `log` facade.
///
/// Called once, early in boot, before anything logs.
pub fn init() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        // SAFETY: 0x3F8 is the standard COM1 port; nothing else in the
        // kernel touches it.
        let mut port = unsafe { SerialPort::new(0x3F8) };
        port.init();
        *SERIAL1.lock() = Some(port);
    }
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(LevelFilter::Info);
}
