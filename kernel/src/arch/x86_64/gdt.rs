//! Global Descriptor Table, TSS, and segment selectors
//!
//! Selector layout is ABI with the syscall MSR setup and the user-mode
//! transition:
//!
//!   0x08 kernel code    0x10 kernel data    0x18 TSS (two slots)
//!   0x28 user data (0x2B with RPL 3)        0x30 user code (0x33)

use core::cell::UnsafeCell;

use lazy_static::lazy_static;
use x86_64::instructions::segmentation::{Segment, CS, DS, ES, SS};
use x86_64::instructions::tables::load_tss;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::{PrivilegeLevel, VirtAddr};

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

/// Kernel code selector
pub const KERNEL_CS: SegmentSelector = SegmentSelector::new(1, PrivilegeLevel::Ring0);
/// Kernel data selector
pub const KERNEL_SS: SegmentSelector = SegmentSelector::new(2, PrivilegeLevel::Ring0);
/// User data selector (RPL 3)
pub const USER_SS: SegmentSelector = SegmentSelector::new(5, PrivilegeLevel::Ring3);
/// User code selector (RPL 3)
pub const USER_CS: SegmentSelector = SegmentSelector::new(6, PrivilegeLevel::Ring3);

struct TssCell(UnsafeCell<TaskStateSegment>);

// SAFETY: rsp0 updates happen only under the kernel lock on the owning
// CPU; the CPU reads the TSS asynchronously but a torn read is
// impossible for an aligned 64-bit store.
unsafe impl Sync for TssCell {}

static TSS: TssCell = TssCell(UnsafeCell::new(TaskStateSegment::new()));

#[repr(align(16))]
struct AlignedStack([u8; 4096 * 5]);

/// Emergency stack for double faults; a guard-page overflow on the
/// kernel stack must not double-fault again.
static mut DOUBLE_FAULT_STACK: AlignedStack = AlignedStack([0; 4096 * 5]);

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        // SAFETY: one-time init before the GDT is loaded.
        unsafe {
            let tss = &mut *TSS.0.get();
            let stack = &raw const DOUBLE_FAULT_STACK;
            tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] =
                VirtAddr::from_ptr(stack) + core::mem::size_of::<AlignedStack>() as u64;
        }

        let mut gdt = GlobalDescriptorTable::new();
        let code_selector = gdt.append(Descriptor::kernel_code_segment()); // 0x08
        let data_selector = gdt.append(Descriptor::kernel_data_segment()); // 0x10
        // SAFETY: TSS is 'static and never moves.
        let tss_selector = gdt.append(Descriptor::tss_segment(unsafe { &*TSS.0.get() })); // 0x18
        let user_data_selector = gdt.append(Descriptor::user_data_segment()); // 0x28
        let user_code_selector = gdt.append(Descriptor::user_code_segment()); // 0x30
        (
            gdt,
            Selectors {
                code_selector,
                data_selector,
                tss_selector,
                user_data_selector,
                user_code_selector,
            },
        )
    };
}

#[allow(dead_code)]
struct Selectors {
    code_selector: SegmentSelector,
    data_selector: SegmentSelector,
    tss_selector: SegmentSelector,
    user_data_selector: SegmentSelector,
    user_code_selector: SegmentSelector,
}

/// Load the GDT, reload segments, and load the TSS.
pub fn init() {
    GDT.0.load();
    // SAFETY: the selectors index the GDT we just loaded.
    unsafe {
        CS::set_reg(GDT.1.code_selector);
        DS::set_reg(GDT.1.data_selector);
        ES::set_reg(GDT.1.data_selector);
        SS::set_reg(GDT.1.data_selector);
        load_tss(GDT.1.tss_selector);
    }

    debug_assert_eq!(GDT.1.code_selector, KERNEL_CS);
    debug_assert_eq!(GDT.1.user_code_selector, USER_CS);
    debug_assert_eq!(GDT.1.user_data_selector, USER_SS);
}

/// Install the privilege-0 stack used when an interrupt arrives in user
/// mode. Called on every context switch.
pub fn set_kernel_stack(rsp: u64) {
    // SAFETY: aligned 64-bit store; see TssCell.
    unsafe {
        (*TSS.0.get()).privilege_stack_table[0] = VirtAddr::new(rsp);
    }
}
