//! ELF64 loader
//!
//! Loads a statically linked ELF64 EXEC image that the bootloader left
//! in physical memory into the current task's address space. File-backed
//! pages are mapped straight from the module's frames; only the BSS
//! tail allocates fresh memory.

use crate::bootinfo::Module;
use crate::error::{KernelError, Result};
use crate::mm::{
    self, frame_allocator, page_count, phys_to_virt, PageType, PhysicalAddress, VirtualAddress,
    PAGE_SIZE, USER_SPACE_END,
};

pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

pub const ELFCLASS64: u8 = 2;
pub const ELFDATA2LSB: u8 = 1;
pub const EV_CURRENT: u32 = 1;
pub const ET_EXEC: u16 = 2;
pub const EM_X86_64: u16 = 62;
pub const EM_AARCH64: u16 = 183;
pub const PT_LOAD: u32 = 1;
pub const PT_TLS: u32 = 7;

pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

#[cfg(target_arch = "x86_64")]
pub const ELF_MACHINE: u16 = EM_X86_64;
#[cfg(target_arch = "aarch64")]
pub const ELF_MACHINE: u16 = EM_AARCH64;

/// ELF64 file header
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Elf64Header {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

/// ELF64 program header
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Elf64ProgramHeader {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

/// What the user-mode bring-up needs to know about a loaded image
#[derive(Debug, Clone, Copy)]
pub struct LoadedImage {
    /// Entry point virtual address
    pub entry: u64,
    /// Virtual address of the program header table
    pub phdr: u64,
    /// Size of one program header entry
    pub phent: u16,
    /// Number of program headers
    pub phnum: u16,
    /// TLS template from the PT_TLS segment, all zero when absent
    pub tls: crate::sched::TlsTemplate,
}

/// Validate the file header, in documented order. The first failed
/// check fails the whole load.
pub fn validate(header: &Elf64Header, image_size: u64) -> Result<()> {
    if (image_size as usize) < core::mem::size_of::<Elf64Header>()
        || header.e_ident[0..4] != ELF_MAGIC
    {
        return Err(KernelError::InvalidArguments);
    }
    if header.e_ident[4] != ELFCLASS64 {
        return Err(KernelError::InvalidArguments);
    }
    if header.e_ident[5] != ELFDATA2LSB {
        return Err(KernelError::InvalidArguments);
    }
    if header.e_machine != ELF_MACHINE {
        return Err(KernelError::InvalidArguments);
    }
    if header.e_version != EV_CURRENT {
        return Err(KernelError::InvalidArguments);
    }
    if header.e_type != ET_EXEC {
        return Err(KernelError::InvalidArguments);
    }
    Ok(())
}

/// Page type for a segment's `p_flags`
pub fn segment_page_type(p_flags: u32) -> PageType {
    if p_flags & PF_X != 0 {
        PageType::UserCode
    } else if p_flags & PF_W != 0 {
        PageType::UserDataRw
    } else {
        PageType::UserDataRo
    }
}

/// Map `module` into the current task's (active) address space.
///
/// Caller must hold the kernel lock and run on the destination task.
pub fn load(module: &Module) -> Result<LoadedImage> {
    // The whole image is visible through the direct map.
    let image = phys_to_virt(PhysicalAddress::new(module.address));
    // SAFETY: the bootloader placed `size` bytes of module at `address`
    // and the direct map covers all of physical memory.
    let header = unsafe { &*image.as_ptr::<Elf64Header>() };

    validate(header, module.size)?;

    let space = mm::address_space::active();
    let mut image_info = LoadedImage {
        entry: header.e_entry,
        phdr: 0,
        phent: header.e_phentsize,
        phnum: header.e_phnum,
        tls: crate::sched::TlsTemplate::default(),
    };

    for i in 0..header.e_phnum as u64 {
        let offset = header.e_phoff + i * header.e_phentsize as u64;
        // SAFETY: program headers are inside the module per validate.
        let phdr = unsafe { &*image.offset(offset).as_ptr::<Elf64ProgramHeader>() };

        if phdr.p_type == PT_TLS {
            // The template bytes live inside some PT_LOAD mapping;
            // record where so thread bring-up can copy them.
            image_info.tls = crate::sched::TlsTemplate {
                base: phdr.p_vaddr,
                template_size: phdr.p_filesz,
                total_size: phdr.p_memsz,
            };
            continue;
        }
        if phdr.p_type != PT_LOAD {
            continue;
        }

        // Never map anything into the kernel half.
        let seg_end = phdr
            .p_vaddr
            .checked_add(phdr.p_memsz)
            .ok_or(KernelError::InvalidArguments)?;
        if seg_end > USER_SPACE_END || phdr.p_vaddr % PAGE_SIZE as u64 != 0 {
            return Err(KernelError::InvalidArguments);
        }

        let page_type = segment_page_type(phdr.p_flags);
        let file_pages = page_count(phdr.p_filesz);
        let mem_pages = page_count(phdr.p_memsz);

        // Map the file-backed pages straight from the module.
        if file_pages > 0 {
            space.map(
                PhysicalAddress::new(module.address + phdr.p_offset),
                VirtualAddress::new(phdr.p_vaddr),
                file_pages as usize,
                page_type,
            )?;
        }

        // BSS tail: fresh zeroed frames right after the file pages.
        if mem_pages > file_pages {
            let zero_pages = (mem_pages - file_pages) as usize;
            let frames = frame_allocator::allocate_frames(zero_pages)?;
            // SAFETY: freshly allocated frames, reached via the direct
            // map before any user mapping exists.
            unsafe {
                core::ptr::write_bytes(
                    phys_to_virt(frames.as_addr()).as_mut_ptr::<u8>(),
                    0,
                    zero_pages * PAGE_SIZE,
                );
            }
            space.map(
                frames.as_addr(),
                VirtualAddress::new(phdr.p_vaddr + file_pages * PAGE_SIZE as u64),
                zero_pages,
                page_type,
            )?;
        }

        // Zero the partial tail of the last file-backed page so stale
        // file bytes never leak into BSS.
        if phdr.p_memsz > phdr.p_filesz && phdr.p_filesz % PAGE_SIZE as u64 != 0 {
            let tail_start = module.address + phdr.p_offset + phdr.p_filesz;
            let tail_len = PAGE_SIZE as u64 - (phdr.p_filesz % PAGE_SIZE as u64);
            // SAFETY: inside the module's last file-backed page, via the
            // direct map.
            unsafe {
                core::ptr::write_bytes(
                    phys_to_virt(PhysicalAddress::new(tail_start)).as_mut_ptr::<u8>(),
                    0,
                    tail_len as usize,
                );
            }
        }

        // The aux vector wants the in-memory address of the program
        // header table; it lives in whichever segment covers e_phoff.
        if phdr.p_offset <= header.e_phoff
            && header.e_phoff < phdr.p_offset + phdr.p_filesz
        {
            image_info.phdr = phdr.p_vaddr + (header.e_phoff - phdr.p_offset);
        }
    }

    if image_info.entry >= USER_SPACE_END {
        return Err(KernelError::InvalidArguments);
    }

    Ok(image_info)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn wellformed_header() -> Elf64Header {
        let mut ident = [0u8; 16];
        ident[0..4].copy_from_slice(&ELF_MAGIC);
        ident[4] = ELFCLASS64;
        ident[5] = ELFDATA2LSB;
        Elf64Header {
            e_ident: ident,
            e_type: ET_EXEC,
            e_machine: ELF_MACHINE,
            e_version: EV_CURRENT,
            e_entry: 0x40_0000,
            e_phoff: 64,
            e_shoff: 0,
            e_flags: 0,
            e_ehsize: 64,
            e_phentsize: 56,
            e_phnum: 1,
            e_shentsize: 0,
            e_shnum: 0,
            e_shstrndx: 0,
        }
    }

    #[test]
    fn test_validate_accepts_wellformed() {
        assert!(validate(&wellformed_header(), 0x1000).is_ok());
    }

    #[test]
    fn test_validate_rejects_short_image() {
        assert!(validate(&wellformed_header(), 32).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_magic() {
        let mut header = wellformed_header();
        header.e_ident[0] = 0;
        assert!(validate(&header, 0x1000).is_err());
    }

    #[test]
    fn test_validate_rejects_32bit() {
        let mut header = wellformed_header();
        header.e_ident[4] = 1; // ELFCLASS32
        assert!(validate(&header, 0x1000).is_err());
    }

    #[test]
    fn test_validate_rejects_big_endian() {
        let mut header = wellformed_header();
        header.e_ident[5] = 2; // ELFDATA2MSB
        assert!(validate(&header, 0x1000).is_err());
    }

    #[test]
    fn test_validate_rejects_foreign_machine() {
        let mut header = wellformed_header();
        header.e_machine = 0xFFFF;
        assert!(validate(&header, 0x1000).is_err());
    }

    #[test]
    fn test_validate_rejects_shared_object() {
        let mut header = wellformed_header();
        header.e_type = 3; // ET_DYN
        assert!(validate(&header, 0x1000).is_err());
    }

    #[test]
    fn test_segment_page_types() {
        assert_eq!(segment_page_type(PF_R | PF_X), PageType::UserCode);
        assert_eq!(segment_page_type(PF_R | PF_W), PageType::UserDataRw);
        assert_eq!(segment_page_type(PF_R), PageType::UserDataRo);
        // Writable and executable resolves to code, matching the
        // X-wins precedence.
        assert_eq!(segment_page_type(PF_R | PF_W | PF_X), PageType::UserCode);
    }
}
