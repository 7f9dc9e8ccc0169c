//! User-mode task bring-up
//!
//! `spawn` loads a boot module into a fresh address space; `clone_task`
//! starts another thread of the current task. Both go through a kernel
//! entry that runs on the new task (its address space active) because
//! ELF mapping and TLS setup can only happen there.

use alloc::boxed::Box;
use alloc::sync::Arc;

use crate::arch::usermode::{enter_user, set_tls_base};
use crate::bootinfo::Module;
use crate::elf;
use crate::error::{KernelError, Result};
use crate::mm::{
    self, frame_allocator, page_count, phys_to_virt, PageType, VirtualAddress, PAGE_SIZE,
    USER_STACK_BOTTOM, USER_STACK_TOP,
};
use crate::sched::{self, Task, TaskId};
use crate::sync::kernel_lock;
use crate::vdso;

/// Where per-task TLS blocks live; strided by task id so threads
/// sharing an address space get distinct blocks.
const USER_TLS_BASE: u64 = 0x0000_7FFF_FFD0_0000;
const USER_TLS_STRIDE: u64 = 64 * 1024;

/// ELF aux vector tags
const AT_NULL: u64 = 0;
const AT_PHDR: u64 = 3;
const AT_PHENT: u64 = 4;
const AT_PHNUM: u64 = 5;
const AT_PAGESZ: u64 = 6;
const AT_ENTRY: u64 = 9;

/// Spawn a user task from a boot module in a fresh address space.
pub fn spawn(module: &Module) -> Result<TaskId> {
    let _guard = kernel_lock::lock();

    let space = {
        let current = sched::current_task();
        // SAFETY: kernel lock held.
        unsafe { current.get() }.address_space.clone_kernel_space()?
    };

    let module_arg = Box::into_raw(Box::new(*module)) as usize;
    let mut task = Task::new(spawn_entry, module_arg, space)?;
    task.user_stack_top = USER_STACK_TOP;
    task.user_stack_bottom = USER_STACK_BOTTOM;

    Ok(sched::add_task(task))
}

/// Start another thread of the current task on a caller-provided
/// stack. The TLS template is inherited from the spawning thread.
pub fn clone_task(
    func: u64,
    arg: u64,
    _flags: u64,
    user_stack: u64,
    user_stack_size: u64,
) -> Result<TaskId> {
    let _guard = kernel_lock::lock();

    if user_stack == 0 || user_stack_size == 0 || user_stack < user_stack_size {
        return Err(KernelError::InvalidArguments);
    }
    mm::check_user_range(user_stack - user_stack_size, user_stack_size)?;
    mm::check_user_range(func, 1)?;

    let (space, tls) = {
        let current = sched::current_task();
        // SAFETY: kernel lock held.
        let current = unsafe { current.get() };
        (Arc::clone(&current.address_space), current.tls)
    };

    let clone_arg = Box::into_raw(Box::new(CloneContext { func, arg })) as usize;
    let mut task = Task::new(clone_entry, clone_arg, space)?;
    task.user_stack_top = user_stack - user_stack_size;
    task.user_stack_bottom = user_stack;
    task.tls = tls;

    Ok(sched::add_task(task))
}

struct CloneContext {
    func: u64,
    arg: u64,
}

/// Kernel-side entry of a spawned task. Runs with this task's fresh
/// address space active; the trampoline has released the kernel lock.
extern "C" fn spawn_entry(arg: usize) -> ! {
    // SAFETY: the pointer was leaked by `spawn` for exactly this
    // handoff.
    let module = unsafe { Box::from_raw(arg as *mut Module) };

    let (entry, user_sp) = {
        let _guard = kernel_lock::lock();
        match setup_user_image(&module) {
            Ok(pair) => pair,
            Err(err) => {
                log::error!("failed to load user image: {}", err);
                drop(_guard);
                sched::kill_current(err.code() as i32);
            }
        }
    };

    // SAFETY: entry and stack were just mapped user-accessible in the
    // active address space, and the scheduler installed our kernel
    // stack in the per-CPU slot when it switched to us.
    unsafe { enter_user(entry, user_sp, user_sp) }
}

/// Kernel-side entry of a cloned thread.
extern "C" fn clone_entry(arg: usize) -> ! {
    // SAFETY: leaked by `clone_task` for this handoff.
    let context = unsafe { Box::from_raw(arg as *mut CloneContext) };

    {
        let _guard = kernel_lock::lock();
        if let Err(err) = init_user_tls() {
            log::error!("failed to initialize thread TLS: {}", err);
            drop(_guard);
            sched::kill_current(err.code() as i32);
        }
    }

    let user_sp = {
        let current = sched::current_task();
        // SAFETY: task fields are stable after creation.
        unsafe { current.get() }.user_stack_bottom
    };

    // SAFETY: the caller supplied a mapped user stack and a user
    // function pointer, both range-checked at clone time.
    unsafe { enter_user(context.func, user_sp, context.arg) }
}

/// Map the image, the VDSO, and TLS; build the initial user stack.
/// Returns `(entry, user_sp)`. Kernel lock held.
fn setup_user_image(module: &Module) -> Result<(u64, u64)> {
    let image = elf::load(module)?;
    vdso::map_into_current()?;

    // Remember the TLS template so clones inherit it, then build this
    // thread's block. TLS can only be set up here, once the task's own
    // address space is active.
    {
        let current = sched::current_task();
        // SAFETY: kernel lock held.
        unsafe { current.get() }.tls = image.tls;
    }
    init_user_tls()?;

    let user_sp = build_initial_stack(&image)?;
    Ok((image.entry, user_sp))
}

/// Allocate and map the TLS block for the current task, copy the
/// template, zero the rest, and install the architecture's TLS base
/// register.
pub fn init_user_tls() -> Result<()> {
    let current = sched::current_task();
    // SAFETY: kernel lock held.
    let task = unsafe { current.get() };
    let tls = task.tls;

    if tls.total_size == 0 {
        set_tls_base(0);
        return Ok(());
    }

    // A self-pointer word sits at the end of the block (the x86_64
    // convention; harmless elsewhere).
    let block_size = tls.total_size + 8;
    let pages = page_count(block_size) as usize;
    let base = USER_TLS_BASE + task.id * USER_TLS_STRIDE;

    let frames = frame_allocator::allocate_frames(pages)?;
    // SAFETY: fresh frames, reachable through the direct map.
    unsafe {
        core::ptr::write_bytes(
            phys_to_virt(frames.as_addr()).as_mut_ptr::<u8>(),
            0,
            pages * PAGE_SIZE,
        );
    }
    let space = mm::address_space::active();
    space.map(
        frames.as_addr(),
        VirtualAddress::new(base),
        pages,
        PageType::UserDataRw,
    )?;

    // SAFETY: the block was just mapped user-read-write in the active
    // space; the template lives in the already-mapped image.
    unsafe {
        if tls.template_size > 0 {
            core::ptr::copy_nonoverlapping(
                tls.base as usize as *const u8,
                base as usize as *mut u8,
                tls.template_size as usize,
            );
        }
        let tcb = base + tls.total_size;
        (tcb as usize as *mut u64).write(tcb);
        set_tls_base(tcb);
    }

    Ok(())
}

/// Build the initial user stack: pre-map the topmost page, push the
/// aux vectors, empty argv/envp, and argc, and align per the ABI.
fn build_initial_stack(image: &elf::LoadedImage) -> Result<u64> {
    let current = sched::current_task();
    // SAFETY: kernel lock held.
    let task = unsafe { current.get() };
    let stack_bottom = task.user_stack_bottom;

    // The first stack page is populated by the kernel (aux vectors)
    // before user code could fault it in.
    let first_page = VirtualAddress::new(stack_bottom - PAGE_SIZE as u64);
    let frame = frame_allocator::allocate_frames(1)?;
    // SAFETY: fresh frame via the direct map.
    unsafe {
        core::ptr::write_bytes(phys_to_virt(frame.as_addr()).as_mut_ptr::<u8>(), 0, PAGE_SIZE);
    }
    let space = mm::address_space::active();
    space.map(frame.as_addr(), first_page, 1, PageType::UserDataRw)?;

    // SAFETY: the page at the bottom of the stack range was just
    // mapped writable in the active space.
    unsafe {
        // Pushed top-down; the list ends with argc so the final stack
        // pointer lands on it.
        let words: [u64; 15] = [
            0,
            AT_NULL,
            PAGE_SIZE as u64,
            AT_PAGESZ,
            image.entry,
            AT_ENTRY,
            image.phnum as u64,
            AT_PHNUM,
            image.phent as u64,
            AT_PHENT,
            image.phdr,
            AT_PHDR,
            0, // envp terminator
            0, // argv terminator
            0, // argc (empty argv)
        ];

        let mut sp = stack_bottom;

        // The ABI wants the final stack pointer 16-byte aligned; pad
        // underneath everything when the word count is odd.
        if (words.len() % 2) != 0 {
            sp -= 8;
            (sp as usize as *mut u64).write(0);
        }

        for word in words {
            sp -= 8;
            (sp as usize as *mut u64).write(word);
        }

        debug_assert_eq!(sp % 16, 0);
        Ok(sp)
    }
}
