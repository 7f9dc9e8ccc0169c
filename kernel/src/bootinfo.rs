//! Boot handoff structures
//!
//! The bootloader and kernel share these bit-exact definitions. The layout
//! is identical in 32- and 64-bit builds so a 32-bit loader can boot a
//! 64-bit kernel: every field is explicitly sized and the structures
//! carry no implicit padding.

use bitflags::bitflags;

use crate::error::{KernelError, Result};

/// Handoff protocol version understood by this kernel
pub const BOOT_VERSION: u32 = 1;

/// Maximum number of displays described in the handoff
pub const MAX_FRAMEBUFFERS: usize = 8;

/// Memory types, ordered by precedence.
///
/// The order is important: when the firmware reports overlapping ranges,
/// the higher value wins the overlap.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryType {
    /// Normal memory (RAM) available for use
    Available = 0,
    /// Works like normal memory, but is persistent (not RAM)
    Persistent = 1,
    /// Normal memory (RAM) that contains errors and is not to be used
    Unusable = 2,
    /// RAM in use by the bootloader; reclaimable once the kernel is done
    /// reading bootloader data
    Bootloader = 3,
    /// RAM in use by (or reserved for) the kernel itself
    Kernel = 4,
    /// ACPI tables; reclaimable once ACPI is enabled
    AcpiReclaimable = 5,
    /// ACPI non-volatile storage; preserved in S1-S3 states
    AcpiNvs = 6,
    /// Firmware runtime services code and data
    Firmware = 7,
    /// Reserved / unknown / do not use
    Reserved = 8,
}

impl MemoryType {
    /// Decode from the wire value; unknown values collapse to `Reserved`.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => MemoryType::Available,
            1 => MemoryType::Persistent,
            2 => MemoryType::Unusable,
            3 => MemoryType::Bootloader,
            4 => MemoryType::Kernel,
            5 => MemoryType::AcpiReclaimable,
            6 => MemoryType::AcpiNvs,
            7 => MemoryType::Firmware,
            _ => MemoryType::Reserved,
        }
    }
}

bitflags! {
    /// Memory range capabilities. The bit values match UEFI memory
    /// descriptor attributes, these indicate capabilities and not
    /// configuration.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MemoryFlags: u32 {
        /// Uncacheable
        const UC = 0x0000_0001;
        /// Write combining
        const WC = 0x0000_0002;
        /// Write-through
        const WT = 0x0000_0004;
        /// Writeback
        const WB = 0x0000_0008;
        /// Write-protected
        const WP = 0x0000_1000;
        /// Non-volatile
        const NV = 0x0000_8000;
        /// Firmware runtime (UEFI Runtime Services)
        const RUNTIME = 0x8000_0000;
    }
}

/// One memory range in the handoff map (24 bytes on the wire)
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MemoryDescriptor {
    /// Memory type (`MemoryType` wire value)
    pub mem_type: u32,
    /// Capability flags (`MemoryFlags` bits)
    pub flags: u32,
    /// Start of the range (physical)
    pub address: u64,
    /// Size of the range in bytes
    pub size: u64,
}

/// Pixel formats the bootloader may hand us
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Unknown = 0,
    X8R8G8B8 = 1,
    X8B8G8R8 = 2,
    R8G8B8 = 3,
}

/// Display frame buffer description (24 bytes on the wire)
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Framebuffer {
    pub width: i32,
    pub height: i32,
    /// Bytes per scanline
    pub pitch: i32,
    /// `PixelFormat` wire value
    pub format: i32,
    /// Physical address of the pixel buffer
    pub pixels: u64,
}

/// A boot module: a flat file the bootloader loaded somewhere in
/// physical memory (16 bytes on the wire)
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Module {
    pub address: u64,
    pub size: u64,
}

/// The handoff structure. Exactly 256 bytes, no implicit padding.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BootInfo {
    /// Must equal `BOOT_VERSION`
    pub version: u32,
    /// Number of `MemoryDescriptor` records at `descriptors`
    pub descriptor_count: u32,
    /// Physical pointer to the memory descriptors
    pub descriptors: u64,
    /// Number of valid entries in `framebuffers`
    pub framebuffer_count: u32,
    reserved: u32,
    /// Display frame buffers
    pub framebuffers: [Framebuffer; MAX_FRAMEBUFFERS],
    /// ACPI Root System Description Pointer, 0 if absent
    pub acpi_rsdp: u64,
    /// Bootstrap services module
    pub go: Module,
    /// Logging module
    pub logger: Module,
}

// The whole point of this file is the exact layout; if any of these fire
// the loader and kernel no longer agree on the ABI.
const _: () = assert!(core::mem::size_of::<MemoryDescriptor>() == 24);
const _: () = assert!(core::mem::size_of::<Framebuffer>() == 24);
const _: () = assert!(core::mem::size_of::<Module>() == 16);
const _: () = assert!(core::mem::size_of::<BootInfo>() == 256);

impl BootInfo {
    /// Check that the handoff is something this kernel can consume.
    pub fn validate(&self) -> Result<()> {
        if self.version != BOOT_VERSION {
            return Err(KernelError::InvalidArguments);
        }
        if self.descriptor_count > 0 && self.descriptors == 0 {
            return Err(KernelError::InvalidArguments);
        }
        if self.framebuffer_count as usize > MAX_FRAMEBUFFERS {
            return Err(KernelError::InvalidArguments);
        }
        if self.go.size == 0 || self.logger.size == 0 {
            return Err(KernelError::InvalidArguments);
        }
        Ok(())
    }

    /// View the memory descriptors the bootloader left in physical memory.
    ///
    /// # Safety
    ///
    /// `self.descriptors` must point at `descriptor_count` valid records
    /// reachable through the direct physical map, and the bootloader
    /// memory holding them must not have been reclaimed yet.
    pub unsafe fn memory_descriptors(&self) -> &[MemoryDescriptor] {
        if self.descriptor_count == 0 {
            return &[];
        }
        let virt = crate::mm::phys_to_virt(crate::mm::PhysicalAddress::new(self.descriptors));
        // SAFETY: per the function contract.
        unsafe {
            core::slice::from_raw_parts(
                virt.as_u64() as usize as *const MemoryDescriptor,
                self.descriptor_count as usize,
            )
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use core::mem::{offset_of, size_of};

    use super::*;

    #[test]
    fn test_layout_is_stable() {
        assert_eq!(size_of::<BootInfo>(), 256);
        assert_eq!(offset_of!(BootInfo, version), 0);
        assert_eq!(offset_of!(BootInfo, descriptor_count), 4);
        assert_eq!(offset_of!(BootInfo, descriptors), 8);
        assert_eq!(offset_of!(BootInfo, framebuffer_count), 16);
        assert_eq!(offset_of!(BootInfo, framebuffers), 24);
        assert_eq!(offset_of!(BootInfo, acpi_rsdp), 216);
        assert_eq!(offset_of!(BootInfo, go), 224);
        assert_eq!(offset_of!(BootInfo, logger), 240);
    }

    #[test]
    fn test_memory_descriptor_layout() {
        assert_eq!(size_of::<MemoryDescriptor>(), 24);
        assert_eq!(offset_of!(MemoryDescriptor, mem_type), 0);
        assert_eq!(offset_of!(MemoryDescriptor, flags), 4);
        assert_eq!(offset_of!(MemoryDescriptor, address), 8);
        assert_eq!(offset_of!(MemoryDescriptor, size), 16);
    }

    #[test]
    fn test_memory_type_precedence_order() {
        assert!(MemoryType::Available < MemoryType::Persistent);
        assert!(MemoryType::Persistent < MemoryType::Unusable);
        assert!(MemoryType::Unusable < MemoryType::Bootloader);
        assert!(MemoryType::Bootloader < MemoryType::Kernel);
        assert!(MemoryType::Kernel < MemoryType::AcpiReclaimable);
        assert!(MemoryType::AcpiNvs < MemoryType::Firmware);
        assert!(MemoryType::Firmware < MemoryType::Reserved);
    }

    #[test]
    fn test_unknown_memory_type_is_reserved() {
        assert_eq!(MemoryType::from_raw(0xFFFF), MemoryType::Reserved);
    }

    fn sample_boot_info() -> BootInfo {
        // SAFETY: all-zero is a valid bit pattern for these plain-data
        // structures.
        let mut info: BootInfo = unsafe { core::mem::zeroed() };
        info.version = BOOT_VERSION;
        info.go = Module { address: 0x10_0000, size: 0x1000 };
        info.logger = Module { address: 0x20_0000, size: 0x1000 };
        info
    }

    #[test]
    fn test_validate_accepts_wellformed() {
        assert!(sample_boot_info().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_version() {
        let mut info = sample_boot_info();
        info.version = 2;
        assert_eq!(info.validate(), Err(KernelError::InvalidArguments));
    }

    #[test]
    fn test_validate_rejects_null_descriptors() {
        let mut info = sample_boot_info();
        info.descriptor_count = 4;
        info.descriptors = 0;
        assert_eq!(info.validate(), Err(KernelError::InvalidArguments));
    }
}
