//! IrisOS kernel entry point
//!
//! The bootloader hands us a single pointer to a `BootInfo` structure;
//! everything the kernel knows about the machine comes from it.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod kernel_entry {
    use core::panic::PanicInfo;

    use iris_kernel::{bootinfo::BootInfo, mm, sched, serial, usermode};
    use log::info;

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        iris_kernel::println!("[KERNEL PANIC] {}", info);
        iris_kernel::arch::halt();
    }

    /// Kernel entry point, called by the bootloader with the physical
    /// address of the handoff structure. The bootloader has already
    /// switched to the higher-half address space with the recursive
    /// mapping live.
    #[no_mangle]
    pub extern "C" fn kernel_main(boot_info: &'static BootInfo) -> ! {
        serial::init();

        info!("IrisOS v{}", env!("CARGO_PKG_VERSION"));

        boot_info.validate().expect("bad boot info");

        // Rebuild the memory map and bring up the physical allocator.
        mm::init(boot_info);

        // GDT/IDT or exception vectors, syscall entry, per-CPU state.
        iris_kernel::arch::init();

        // Scheduler with the immortal idle task (id 0).
        sched::init();

        // The two initial user tasks come from the handoff modules.
        usermode::spawn(&boot_info.go).expect("failed to load go module");
        usermode::spawn(&boot_info.logger).expect("failed to load logger module");

        info!("boot complete, entering idle loop");
        sched::idle_loop();
    }
}

#[cfg(not(target_os = "none"))]
fn main() {}
