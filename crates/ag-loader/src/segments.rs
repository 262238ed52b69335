//! Segment and section loading

use crate::elf::{section, sht, Elf32};
use crate::image::RawImage;
use crate::module::{Extent, Module};
use ag_memory::{MemoryAccess, MemorySection, PageFlags, SHF_ALLOC};
use tracing::{debug, error, info, trace, warn};

/// Where a segment lands in memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentAddress {
    /// `base + vaddr`
    Relocated(u32),
    /// `base + vaddr` is unmapped, `vaddr` is used as is
    Absolute(u32),
    /// Neither address is mapped
    Invalid(u32),
}

fn segment_address(mem: &dyn MemoryAccess, base: u32, vaddr: u32) -> SegmentAddress {
    let relocated = base.wrapping_add(vaddr);
    if mem.is_address_valid(relocated) {
        SegmentAddress::Relocated(relocated)
    } else if mem.is_address_valid(vaddr) {
        SegmentAddress::Absolute(vaddr)
    } else {
        SegmentAddress::Invalid(vaddr)
    }
}

/// Copy every `PT_LOAD` segment into memory and derive the initial bounds
/// and bss size. With `analyze_only` nothing is written.
pub fn load_program(
    mem: &dyn MemoryAccess,
    image: &RawImage<'_>,
    elf: &Elf32,
    module: &mut Module,
    analyze_only: bool,
) {
    let base = module.base_address;
    module.bss_size = 0;

    for (i, phdr) in elf.phdrs.iter().enumerate() {
        if !phdr.is_load() {
            continue;
        }

        let mem_offset = match segment_address(mem, base, phdr.p_vaddr) {
            SegmentAddress::Relocated(addr) => addr,
            SegmentAddress::Absolute(addr) => {
                warn!(
                    "PH#{}: 0x{:08x} + 0x{:08x} is not mapped, loading at vaddr 0x{:08x}",
                    i, base, phdr.p_vaddr, addr
                );
                addr
            }
            SegmentAddress::Invalid(addr) => {
                warn!("PH#{}: program header has invalid memory offset 0x{:08x}", i, addr);
                addr
            }
        };

        let file_offset = phdr.p_offset as usize;
        let remaining = image.len().saturating_sub(file_offset);
        let mut file_len = phdr.p_filesz as usize;
        if file_len > remaining {
            warn!(
                "PH#{}: program overflow, clamping len 0x{:08x} to 0x{:08x}",
                i, file_len, remaining
            );
            file_len = remaining;
        }

        debug!(
            "PH#{}: loading program 0x{:08x} - 0x{:08x} - 0x{:08x}",
            i,
            mem_offset,
            mem_offset.wrapping_add(file_len as u32),
            mem_offset.wrapping_add(phdr.p_memsz)
        );

        if !analyze_only && file_len > 0 {
            let bytes = image.slice_clamped(file_offset, file_len);
            if let Err(e) = mem.write_bytes(mem_offset, bytes) {
                warn!("PH#{}: failed to copy 0x{:x} bytes to 0x{:08x}: {}", i, file_len, mem_offset, e);
            }
        }

        if mem_offset < module.load_address_low {
            module.load_address_low = mem_offset;
            debug!("PH#{}: new load_address_low 0x{:08x}", i, mem_offset);
        }
        let end = mem_offset.wrapping_add(phdr.p_memsz);
        if end > module.load_address_high {
            module.load_address_high = end;
            trace!("PH#{}: new load_address_high 0x{:08x}", i, end);
        }

        let bss = phdr.p_memsz - phdr.p_filesz;
        trace!("PH#{}: contributes 0x{:08x} to bss size", i, bss);
        module.bss_size = module.bss_size.wrapping_add(bss);
    }

    debug!(
        "PH alloc consumption 0x{:08x} (bss 0x{:08x})",
        module.load_address_high.wrapping_sub(module.load_address_low),
        module.bss_size
    );
}

/// Register sections with the memory map, zero NOBITS sections, widen the
/// bounds and reconcile `.bss`
pub fn load_sections(mem: &dyn MemoryAccess, elf: &Elf32, module: &mut Module, analyze_only: bool) {
    let base = module.base_address;

    for shdr in &elf.shdrs {
        trace!("ELF section header: {}", shdr);

        let mut mem_offset = base.wrapping_add(shdr.sh_addr);
        if !mem.is_address_valid(mem_offset) {
            mem_offset = shdr.sh_addr;
        }
        let len = shdr.sh_size;
        let end = mem_offset.wrapping_add(len);

        if shdr.sh_flags != 0 && mem.is_address_valid(mem_offset) && !analyze_only {
            let flags = PageFlags::from_section_flags(shdr.sh_flags);
            mem.add_memory_section(MemorySection::new(mem_offset, len, flags));
        }

        if shdr.sh_flags & SHF_ALLOC == 0 {
            continue;
        }

        match shdr.sh_type {
            sht::PROGBITS => {
                if !mem.is_address_valid(mem_offset) {
                    warn!("{}: PROGBITS section has invalid memory offset 0x{:08x}", shdr.name, mem_offset);
                }
                if mem_offset < module.load_address_low {
                    warn!("{}: section allocates more than program 0x{:08x} - 0x{:08x}", shdr.name, mem_offset, end);
                    module.load_address_low = mem_offset;
                }
                if end > module.load_address_high {
                    warn!("{}: section allocates more than program 0x{:08x} - 0x{:08x}", shdr.name, mem_offset, end);
                    module.load_address_high = end;
                }
            }
            sht::NOBITS => {
                if !mem.is_address_valid(mem_offset) {
                    warn!("{}: NOBITS section has invalid memory offset 0x{:08x}", shdr.name, mem_offset);
                }
                if len == 0 {
                    debug!("{}: ignoring zero-length NOBITS section 0x{:08x}", shdr.name, mem_offset);
                    continue;
                }

                debug!("{}: clearing section 0x{:08x} - 0x{:08x} (len 0x{:08x})", shdr.name, mem_offset, end, len);
                if !analyze_only {
                    if let Err(e) = mem.memset(mem_offset, 0, len) {
                        warn!("{}: failed to clear 0x{:08x}: {}", shdr.name, mem_offset, e);
                    }
                }
                if mem_offset < module.load_address_low {
                    module.load_address_low = mem_offset;
                    debug!("{}: new load_address_low 0x{:08x} (+0x{:08x})", shdr.name, mem_offset, len);
                }
                if end > module.load_address_high {
                    module.load_address_high = end;
                    debug!("{}: new load_address_high 0x{:08x} (+0x{:08x})", shdr.name, end, len);
                }
            }
            _ => {}
        }
    }

    if let Some(text) = elf.section_header(section::TEXT) {
        trace!("SH: storing text size 0x{:08x}", text.sh_size);
        module.text_addr = base.wrapping_add(text.sh_addr);
        module.text_size = text.sh_size;
    }
    if let Some(data) = elf.section_header(section::DATA) {
        trace!("SH: storing data size 0x{:08x}", data.sh_size);
        module.data_size = data.sh_size;
    }
    if let Some(bss) = elf.section_header(section::BSS) {
        reconcile_bss(module, bss.sh_size);
    }

    clamp_bounds(module);
    module.segment = Extent {
        addr: module.load_address_low,
        size: module.load_size(),
    };
}

/// Merge the `.bss` section size into the size derived from program headers
pub fn reconcile_bss(module: &mut Module, section_size: u32) {
    if section_size == 0 {
        return;
    }
    if module.bss_size == section_size {
        trace!("SH: same bss size already set");
    } else if module.bss_size > section_size {
        trace!(
            "SH: larger bss size already set (0x{:08x} > 0x{:08x})",
            module.bss_size,
            section_size
        );
    } else if module.bss_size != 0 {
        warn!("SH: overwriting bss size 0x{:08x} with 0x{:08x}", module.bss_size, section_size);
        module.bss_size = section_size;
    } else {
        info!("SH: bss size not already set");
        module.bss_size = section_size;
    }
}

/// Restore `low <= high` after loading
pub fn clamp_bounds(module: &mut Module) {
    if module.load_address_low > module.load_address_high {
        error!(
            "Incorrect ELF module address: load_address_low=0x{:08x}, load_address_high=0x{:08x}",
            module.load_address_low, module.load_address_high
        );
        module.load_address_high = module.load_address_low;
    }
}
