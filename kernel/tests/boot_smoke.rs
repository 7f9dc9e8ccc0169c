//! Boot handoff and memory-map smoke tests
//!
//! Runs on the bare-metal target under QEMU via the project boot
//! chain; the host build compiles to an empty binary.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]
#![cfg_attr(target_os = "none", feature(custom_test_frameworks))]
#![cfg_attr(target_os = "none", test_runner(iris_kernel::test_framework::test_runner))]
#![cfg_attr(target_os = "none", reexport_test_harness_main = "test_main")]

#[cfg(not(target_os = "none"))]
fn main() {}

#[cfg(target_os = "none")]
mod harness {
    #[no_mangle]
    pub extern "C" fn _start() -> ! {
        iris_kernel::serial::init();
        iris_kernel::mm::heap::init().expect("heap init");
        crate::test_main();
        loop {
            core::hint::spin_loop();
        }
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        iris_kernel::test_panic_handler(info)
    }
}

#[cfg(target_os = "none")]
mod tests {
    use iris_kernel::bootinfo::{BootInfo, MemoryFlags, MemoryType, Module};
    use iris_kernel::mm::MemoryMap;
    use iris_kernel::KernelError;

    fn sample_boot_info() -> BootInfo {
        // SAFETY: all-zero is a valid bit pattern for the handoff
        // structures.
        let mut info: BootInfo = unsafe { core::mem::zeroed() };
        info.version = iris_kernel::bootinfo::BOOT_VERSION;
        info.go = Module { address: 0x10_0000, size: 0x1000 };
        info.logger = Module { address: 0x20_0000, size: 0x1000 };
        info
    }

    #[test_case]
    fn boot_info_is_256_bytes() {
        assert_eq!(core::mem::size_of::<BootInfo>(), 256);
    }

    #[test_case]
    fn boot_info_validation() {
        assert!(sample_boot_info().validate().is_ok());
        let mut bad = sample_boot_info();
        bad.version = 99;
        assert_eq!(bad.validate(), Err(KernelError::InvalidArguments));
    }

    #[test_case]
    fn memory_map_overlap_resolution() {
        let mut map = MemoryMap::new();
        map.add(MemoryType::Available, MemoryFlags::empty(), 0, 0x1000);
        map.add(MemoryType::Reserved, MemoryFlags::empty(), 0x2000, 0x1000);
        map.add(MemoryType::Available, MemoryFlags::empty(), 0x2800, 0x1800);
        map.sanitize();
        assert_eq!(map.len(), 3);
        assert_eq!(map.regions()[2].start, 0x3000);
        assert_eq!(map.regions()[2].size, 0x1000);
    }
}
