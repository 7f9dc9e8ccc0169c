//! IPC rendezvous and ordering

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
    use core::sync::atomic::{AtomicU64, Ordering};

    use iris_kernel::ipc::{self, ENDPOINT_ANY, ENDPOINT_NONE};
    use iris_kernel::sched::{self, Task};
    use iris_kernel::sync::kernel_lock;

    static SERVER_ID: AtomicU64 = AtomicU64::new(0);
    static REPLY: AtomicU64 = AtomicU64::new(0);
    static DONE: AtomicU64 = AtomicU64::new(0);
    static ORDER: [AtomicU64; 3] = [const { AtomicU64::new(0) }; 3];

    fn spawn(entry: extern "C" fn(usize) -> !, arg: usize) -> u64 {
        let current = sched::current_task();
        // SAFETY: single-threaded test context.
        let space = unsafe { current.get() }.address_space.clone();
        let task = Task::new(entry, arg, space).expect("task");
        sched::add_task(task)
    }

    /// Receives one word from anyone and sends it back incremented.
    extern "C" fn pong_server(_arg: usize) -> ! {
        let mut word = 0u64;
        let from = {
            let _guard = kernel_lock::lock();
            ipc::ipc_locked(
                ENDPOINT_NONE,
                ENDPOINT_ANY,
                core::ptr::null(),
                0,
                (&mut word as *mut u64).cast(),
                8,
            )
            .expect("receive")
        };

        let reply = word.wrapping_add(1);
        {
            let _guard = kernel_lock::lock();
            ipc::ipc_locked(
                from as u64,
                ENDPOINT_NONE,
                (&reply as *const u64).cast(),
                8,
                core::ptr::null_mut(),
                0,
            )
            .expect("reply");
        }
        sched::kill_current(0);
    }

    extern "C" fn ping_client(_arg: usize) -> ! {
        let server = SERVER_ID.load(Ordering::Relaxed);
        let word = 0xCAFE_BABEu64;
        let mut reply = 0u64;
        {
            let _guard = kernel_lock::lock();
            // Combined send + closed-wait receive: one rendezvous each
            // way.
            ipc::ipc_locked(
                server,
                server,
                (&word as *const u64).cast(),
                8,
                (&mut reply as *mut u64).cast(),
                8,
            )
            .expect("call");
        }
        REPLY.store(reply, Ordering::Relaxed);
        DONE.fetch_add(1, Ordering::Relaxed);
        sched::kill_current(0);
    }

    #[test_case]
    fn ping_pong_round_trip() {
        let server = spawn(pong_server, 0);
        SERVER_ID.store(server, Ordering::Relaxed);
        spawn(ping_client, 0);

        while DONE.load(Ordering::Relaxed) < 1 {
            sched::yield_now();
        }
        assert_eq!(REPLY.load(Ordering::Relaxed), 0xCAFE_BABF);
    }

    /// Sends its tag to the collector and records completion order.
    extern "C" fn tagged_sender(tag: usize) -> ! {
        let server = SERVER_ID.load(Ordering::Relaxed);
        let word = tag as u64;
        {
            let _guard = kernel_lock::lock();
            ipc::ipc_locked(
                server,
                ENDPOINT_NONE,
                (&word as *const u64).cast(),
                8,
                core::ptr::null_mut(),
                0,
            )
            .expect("send");
        }
        DONE.fetch_add(1, Ordering::Relaxed);
        sched::kill_current(0);
    }

    /// Three open-wait receives; the sender queue must deliver FIFO.
    extern "C" fn collector(_arg: usize) -> ! {
        for slot in &ORDER {
            let mut word = 0u64;
            let _guard = kernel_lock::lock();
            ipc::ipc_locked(
                ENDPOINT_NONE,
                ENDPOINT_ANY,
                core::ptr::null(),
                0,
                (&mut word as *mut u64).cast(),
                8,
            )
            .expect("receive");
            slot.store(word, Ordering::Relaxed);
        }
        DONE.fetch_add(1, Ordering::Relaxed);
        sched::kill_current(0);
    }

    #[test_case]
    fn sender_queue_is_fifo() {
        DONE.store(0, Ordering::Relaxed);
        let server = spawn(collector, 0);
        SERVER_ID.store(server, Ordering::Relaxed);

        // Let the senders enqueue in a known order: they are added to
        // the ready queue in tag order and each blocks in IpcSend
        // before the collector's first receive runs.
        for tag in 1..=3 {
            spawn(tagged_sender, tag);
        }

        while DONE.load(Ordering::Relaxed) < 4 {
            sched::yield_now();
        }

        assert_eq!(ORDER[0].load(Ordering::Relaxed), 1);
        assert_eq!(ORDER[1].load(Ordering::Relaxed), 2);
        assert_eq!(ORDER[2].load(Ordering::Relaxed), 3);
    }
}
