//! Page-table properties on the live recursive mapping
//!
//! Boots via the project boot chain so the recursive mapping and the
//! direct map are already up; exercises map/translate/unmap and the
//! kernel-half invariance of cloned address spaces.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]
#![cfg_attr(target_os = "none", feature(custom_test_frameworks))]
#![cfg_attr(target_os = "none", test_runner(iris_kernel::test_framework::test_runner))]
#![cfg_attr(target_os = "none", reexport_test_harness_main = "test_main")]

#[cfg(not(target_os = "none"))]
fn main() {}

#[cfg(target_os = "none")]
mod harness {
    use iris_kernel::bootinfo::BootInfo;

    #[no_mangle]
    pub extern "C" fn kernel_main(boot_info: &'static BootInfo) -> ! {
        iris_kernel::serial::init();
        iris_kernel::mm::init(boot_info);
        iris_kernel::arch::init();
        iris_kernel::sched::init();
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
    use iris_kernel::mm::{
        self, frame_allocator, PageType, PhysicalAddress, VirtualAddress, PAGE_SIZE,
    };

    /// A scratch kernel virtual range nothing else uses.
    const SCRATCH_VA: u64 = 0xFFFF_FFFF_C800_0000;

    #[test_case]
    fn map_translate_round_trip() {
        let space = mm::address_space::active();
        let frames = frame_allocator::allocate_frames(4).expect("frames");
        let virt = VirtualAddress::new(SCRATCH_VA);

        space.map(frames.as_addr(), virt, 4, PageType::KernelDataRw).expect("map");
        for k in 0..4u64 {
            let va = VirtualAddress::new(SCRATCH_VA + k * PAGE_SIZE as u64);
            assert_eq!(
                space.translate(va),
                Some(PhysicalAddress::new(frames.as_addr().as_u64() + k * PAGE_SIZE as u64))
            );
        }

        // The mapping is usable memory.
        // SAFETY: just mapped read-write.
        unsafe {
            (SCRATCH_VA as usize as *mut u32).write_volatile(0xDEAD_BEEF);
            assert_eq!((SCRATCH_VA as usize as *const u32).read_volatile(), 0xDEAD_BEEF);
        }

        space.unmap(virt, 4).expect("unmap");
        assert_eq!(space.translate(virt), None);
    }

    #[test_case]
    fn remap_same_flags_is_idempotent() {
        let space = mm::address_space::active();
        let frames = frame_allocator::allocate_frames(1).expect("frames");
        let virt = VirtualAddress::new(SCRATCH_VA + 0x10_0000);

        space.map(frames.as_addr(), virt, 1, PageType::KernelDataRw).expect("map");
        space.map(frames.as_addr(), virt, 1, PageType::KernelDataRw).expect("remap");
        space.unmap(virt, 1).expect("unmap");
    }

    #[test_case]
    fn remap_different_flags_is_rejected() {
        let space = mm::address_space::active();
        let frames = frame_allocator::allocate_frames(1).expect("frames");
        let virt = VirtualAddress::new(SCRATCH_VA + 0x20_0000);

        space.map(frames.as_addr(), virt, 1, PageType::KernelDataRw).expect("map");
        assert!(space.map(frames.as_addr(), virt, 1, PageType::KernelDataRo).is_err());
        space.unmap(virt, 1).expect("unmap");
    }

    #[test_case]
    fn clone_shares_kernel_half() {
        let current = iris_kernel::sched::current_task();
        // SAFETY: single-threaded test context.
        let space = unsafe { current.get() }.address_space.clone();

        let frames = frame_allocator::allocate_frames(1).expect("frames");
        let virt = VirtualAddress::new(SCRATCH_VA + 0x30_0000);
        space.map(frames.as_addr(), virt, 1, PageType::KernelDataRw).expect("map");

        let child = space.clone_kernel_space().expect("clone");

        // Kernel-half addresses translate identically in parent and
        // child; probe through both roots by switching.
        let parent_phys = space.translate(virt);
        child.activate();
        let child_phys = iris_kernel::mm::address_space::active().translate(virt);
        space.activate();

        assert_eq!(parent_phys, child_phys);
        assert!(parent_phys.is_some());
        space.unmap(virt, 1).expect("unmap");
    }
}

#[cfg(target_os = "none")]
mod fault_tests {
    use iris_kernel::mm::{self, page_fault, VirtualAddress, PAGE_SIZE};
    use iris_kernel::mm::{USER_STACK_BOTTOM, USER_STACK_TOP};
    use iris_kernel::sched;

    #[test_case]
    fn stack_growth_maps_a_fresh_page() {
        // Give the current (idle) task a user stack range, then fault
        // inside it. The guard page at the top must stay unmapped.
        {
            let _guard = iris_kernel::sync::kernel_lock::lock();
            let current = sched::current_task();
            // SAFETY: single-threaded test context under the lock.
            let task = unsafe { current.get() };
            task.user_stack_top = USER_STACK_TOP;
            task.user_stack_bottom = USER_STACK_BOTTOM;
        }

        let fault_addr = VirtualAddress::new(USER_STACK_TOP + 2 * PAGE_SIZE as u64);
        page_fault::handle_user_fault(fault_addr, 0, 0);

        let space = mm::address_space::active();
        assert!(space.translate(fault_addr).is_some());
        // The write that faulted can now complete.
        // SAFETY: just mapped user-read-write; the kernel may write it.
        unsafe {
            (fault_addr.as_u64() as usize as *mut u64).write_volatile(0x1234_5678);
        }
        space.unmap(VirtualAddress::new(fault_addr.as_u64() & !(PAGE_SIZE as u64 - 1)), 1)
            .expect("unmap");

        // Drop the fake stack range again.
        let _guard = iris_kernel::sync::kernel_lock::lock();
        let current = sched::current_task();
        // SAFETY: as above.
        let task = unsafe { current.get() };
        task.user_stack_top = 0;
        task.user_stack_bottom = 0;
    }
}
