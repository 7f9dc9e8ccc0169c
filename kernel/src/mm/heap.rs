//! Kernel heap bring-up
//!
//! The heap arena lives in the kernel image's .bss so it is usable before
//! the frame allocator exists; the PMM and the memory map both need
//! `alloc` for their bookkeeping, so the heap must come up first.

use crate::error::Result;

/// Size of the kernel heap arena
pub const HEAP_SIZE: usize = 4 * 1024 * 1024;

#[cfg(target_os = "none")]
#[repr(align(4096))]
struct HeapArena([u8; HEAP_SIZE]);

#[cfg(target_os = "none")]
static mut HEAP_ARENA: HeapArena = HeapArena([0; HEAP_SIZE]);

/// Initialize the global kernel heap. Must be called exactly once,
/// before anything allocates.
pub fn init() -> Result<()> {
    #[cfg(target_os = "none")]
    {
        let arena = &raw mut HEAP_ARENA;
        // SAFETY: HEAP_ARENA is a static arena used for nothing else, and
        // init() runs once before any allocation.
        unsafe {
            crate::allocator()
                .lock()
                .init(arena.cast::<u8>(), HEAP_SIZE);
        }
        log::info!("heap: {} KiB at {:p}", HEAP_SIZE / 1024, arena);
    }
    Ok(())
}
