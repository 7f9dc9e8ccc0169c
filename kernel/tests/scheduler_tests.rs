//! Scheduler behavior under cooperative yielding

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
    use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    use iris_kernel::sched::{self, Task};

    const ROUNDS: usize = 4;
    const WORKERS: u64 = 3;

    static LOG: [AtomicU64; 16] = [const { AtomicU64::new(0) }; 16];
    static LOG_LEN: AtomicUsize = AtomicUsize::new(0);
    static FINISHED: AtomicU64 = AtomicU64::new(0);

    extern "C" fn worker(tag: usize) -> ! {
        for _ in 0..ROUNDS {
            let slot = LOG_LEN.fetch_add(1, Ordering::Relaxed);
            if slot < LOG.len() {
                LOG[slot].store(tag as u64, Ordering::Relaxed);
            }
            sched::yield_now();
        }
        FINISHED.fetch_add(1, Ordering::Relaxed);
        sched::kill_current(0);
    }

    fn spawn_worker(tag: u64) {
        let current = sched::current_task();
        // SAFETY: single-threaded test context, kernel lock not needed
        // for a read-only Arc clone.
        let space = unsafe { current.get() }.address_space.clone();
        let task = Task::new(worker, tag as usize, space).expect("task");
        sched::add_task(task);
    }

    #[test_case]
    fn round_robin_is_fair() {
        for tag in 1..=WORKERS {
            spawn_worker(tag);
        }

        // The idle task (us) only runs when nobody else is ready, so
        // spinning on yield drains the workers.
        while FINISHED.load(Ordering::Relaxed) < WORKERS {
            sched::yield_now();
        }

        // Every worker logged once per round, and within each round the
        // FIFO order of the ready queue held.
        let len = LOG_LEN.load(Ordering::Relaxed).min(LOG.len());
        assert_eq!(len, ROUNDS * WORKERS as usize);
        for round in 0..ROUNDS {
            for (i, expected) in (1..=WORKERS).enumerate() {
                let slot = round * WORKERS as usize + i;
                assert_eq!(LOG[slot].load(Ordering::Relaxed), expected);
            }
        }
    }

    #[test_case]
    fn dead_tasks_are_reaped() {
        extern "C" fn short_lived(_arg: usize) -> ! {
            sched::kill_current(42);
        }

        let current = sched::current_task();
        // SAFETY: as above.
        let space = unsafe { current.get() }.address_space.clone();
        let task = Task::new(short_lived, 0, space).expect("task");
        let id = sched::add_task(task);

        // Give it the CPU until it is gone from the table.
        for _ in 0..8 {
            sched::yield_now();
        }
        let _guard = iris_kernel::sync::kernel_lock::lock();
        assert!(iris_kernel::sched::table::task_ptr(id).is_none());
    }
}

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
mod fpu_tests {
    use iris_kernel::syscall::{syscall_dispatch_entry, SyscallFrame};

    /// A dispatched syscall (here: yield, which context-switches) must
    /// not disturb the caller's FPU state; the entry/exit guard
    /// saves and restores it around everything the kernel does.
    #[test_case]
    fn fpu_state_survives_a_syscall() {
        let pattern: [u64; 2] = [0x1122_3344_5566_7788, 0x99AA_BBCC_DDEE_FF00];
        let mut readback: [u64; 2] = [0; 2];

        // SAFETY: xmm7 is caller-saved scratch; nothing below relies
        // on it except our readback.
        unsafe {
            core::arch::asm!(
                "movdqu xmm7, [{src}]",
                src = in(reg) pattern.as_ptr(),
                options(nostack)
            );
        }

        let mut frame = SyscallFrame {
            number: 7, // yield
            arg1: 0,
            arg2: 0,
            arg3: 0,
            arg4: 0,
            arg5: 0,
            arg6: 0,
            user_rip: 0,
            user_rflags: 0,
            user_rsp: 0,
        };
        syscall_dispatch_entry(&mut frame);
        assert_eq!(frame.number, 0);

        // SAFETY: as above.
        unsafe {
            core::arch::asm!(
                "movdqu [{dst}], xmm7",
                dst = in(reg) readback.as_mut_ptr(),
                options(nostack)
            );
        }
        assert_eq!(readback, pattern);
    }
}
