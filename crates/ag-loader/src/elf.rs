//! ELF32 little-endian parser for Allegrex executables

use crate::image::RawImage;
use ag_core::error::LoaderError;
use std::fmt;
use tracing::{debug, trace, warn};

/// ELF magic as a little-endian word (`\x7fELF`)
pub const ELF_MAGIC: u32 = 0x464C_457F;

/// `e_machine` value for MIPS
pub const EM_MIPS: u16 = 8;

/// `e_type` value marking a PRX
pub const ET_SCE_PRX: u16 = 0xFFA0;

/// Entry point value meaning "no entry"
pub const NO_ENTRY: u32 = 0xFFFF_FFFF;

/// Executables linked below this address must be relocated
pub const RELOCATION_THRESHOLD: u32 = 0x0800_0000;

pub const ELF_HEADER_SIZE: usize = 52;
pub const PROGRAM_HEADER_SIZE: usize = 32;
pub const SECTION_HEADER_SIZE: usize = 40;

/// Program header types
pub mod pt {
    pub const NULL: u32 = 0;
    pub const LOAD: u32 = 1;
    /// PRX relocation table
    pub const PRX_RELOC: u32 = 0x7000_00A0;
    /// Second-generation PRX relocation table (not supported)
    pub const PRX_RELOC2: u32 = 0x7000_00A1;
}

/// Section header types
pub mod sht {
    pub const NULL: u32 = 0;
    pub const PROGBITS: u32 = 1;
    pub const SYMTAB: u32 = 2;
    pub const STRTAB: u32 = 3;
    pub const NOBITS: u32 = 8;
    pub const REL: u32 = 9;
    /// PRX relocation section
    pub const PRXREL: u32 = 0x7000_00A0;
}

/// Well-known section names
pub mod section {
    pub const TEXT: &str = ".text";
    pub const DATA: &str = ".data";
    pub const BSS: &str = ".bss";
    pub const MODULE_INFO: &str = ".rodata.sceModuleInfo";
    pub const INIT: &str = ".init";
    pub const FINI: &str = ".fini";
    pub const STUB_TEXT: &str = ".sceStub.text";
}

/// ELF file header (32-bit)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Elf32Header {
    pub e_magic: u32,
    pub e_class: u8,
    pub e_data: u8,
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u32,
    pub e_phoff: u32,
    pub e_shoff: u32,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

impl Elf32Header {
    /// Parse the fixed 52-byte header at the start of `image`
    pub fn parse(image: &RawImage<'_>) -> Result<Self, LoaderError> {
        let field32 = |off| {
            image
                .read_u32(off)
                .ok_or_else(|| LoaderError::InvalidElf(format!("header truncated at 0x{:x}", off)))
        };
        let field16 = |off| {
            image
                .read_u16(off)
                .ok_or_else(|| LoaderError::InvalidElf(format!("header truncated at 0x{:x}", off)))
        };

        let e_magic = field32(0)?;
        if e_magic != ELF_MAGIC {
            return Err(LoaderError::InvalidElf(format!("bad magic 0x{:08x}", e_magic)));
        }
        if image.len() < ELF_HEADER_SIZE {
            return Err(LoaderError::InvalidElf(format!(
                "header needs {} bytes, image has {}",
                ELF_HEADER_SIZE,
                image.len()
            )));
        }

        Ok(Self {
            e_magic,
            e_class: image.read_u8(4).unwrap_or(0),
            e_data: image.read_u8(5).unwrap_or(0),
            e_type: field16(16)?,
            e_machine: field16(18)?,
            e_version: field32(20)?,
            e_entry: field32(24)?,
            e_phoff: field32(28)?,
            e_shoff: field32(32)?,
            e_flags: field32(36)?,
            e_ehsize: field16(40)?,
            e_phentsize: field16(42)?,
            e_phnum: field16(44)?,
            e_shentsize: field16(46)?,
            e_shnum: field16(48)?,
            e_shstrndx: field16(50)?,
        })
    }

    pub fn is_valid(&self) -> bool {
        self.e_magic == ELF_MAGIC
    }

    pub fn is_mips_executable(&self) -> bool {
        self.is_valid() && self.e_machine == EM_MIPS
    }

    pub fn is_prx(&self) -> bool {
        self.e_type == ET_SCE_PRX
    }

    pub fn requires_relocation(&self) -> bool {
        self.is_prx() || self.e_entry < RELOCATION_THRESHOLD
    }
}

impl fmt::Display for Elf32Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "-----ELF HEADER---------")?;
        writeln!(f, "e_magic     0x{:08X}", self.e_magic)?;
        writeln!(f, "e_class     0x{:02X}", self.e_class)?;
        writeln!(f, "e_data      0x{:02X}", self.e_data)?;
        writeln!(f, "e_type      0x{:04X}", self.e_type)?;
        writeln!(f, "e_machine   0x{:04X}", self.e_machine)?;
        writeln!(f, "e_version   0x{:08X}", self.e_version)?;
        writeln!(f, "e_entry     0x{:08X}", self.e_entry)?;
        writeln!(f, "e_phoff     0x{:08X}", self.e_phoff)?;
        writeln!(f, "e_shoff     0x{:08X}", self.e_shoff)?;
        writeln!(f, "e_flags     0x{:08X}", self.e_flags)?;
        writeln!(f, "e_ehsize    0x{:04X}", self.e_ehsize)?;
        writeln!(f, "e_phentsize 0x{:04X}", self.e_phentsize)?;
        writeln!(f, "e_phnum     0x{:04X}", self.e_phnum)?;
        writeln!(f, "e_shentsize 0x{:04X}", self.e_shentsize)?;
        writeln!(f, "e_shnum     0x{:04X}", self.e_shnum)?;
        writeln!(f, "e_shstrndx  0x{:04X}", self.e_shstrndx)
    }
}

/// ELF program header (32-bit)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Elf32Phdr {
    pub p_type: u32,
    pub p_offset: u32,
    pub p_vaddr: u32,
    pub p_paddr: u32,
    pub p_filesz: u32,
    pub p_memsz: u32,
    pub p_flags: u32,
    pub p_align: u32,
}

impl Elf32Phdr {
    fn parse(image: &RawImage<'_>, offset: usize) -> Option<Self> {
        let mut phdr = Self {
            p_type: image.read_u32(offset)?,
            p_offset: image.read_u32(offset + 4)?,
            p_vaddr: image.read_u32(offset + 8)?,
            p_paddr: image.read_u32(offset + 12)?,
            p_filesz: image.read_u32(offset + 16)?,
            p_memsz: image.read_u32(offset + 20)?,
            p_flags: image.read_u32(offset + 24)?,
            p_align: image.read_u32(offset + 28)?,
        };
        if phdr.p_filesz > phdr.p_memsz {
            warn!(
                "Program header at 0x{:x}: filesz 0x{:x} exceeds memsz 0x{:x}, raising memsz",
                offset, phdr.p_filesz, phdr.p_memsz
            );
            phdr.p_memsz = phdr.p_filesz;
        }
        Some(phdr)
    }

    pub fn is_load(&self) -> bool {
        self.p_type == pt::LOAD
    }
}

impl fmt::Display for Elf32Phdr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "p_type 0x{:08X} p_offset 0x{:08X} p_vaddr 0x{:08X} p_paddr 0x{:08X} \
             p_filesz 0x{:08X} p_memsz 0x{:08X} p_flags 0x{:08X} p_align 0x{:08X}",
            self.p_type,
            self.p_offset,
            self.p_vaddr,
            self.p_paddr,
            self.p_filesz,
            self.p_memsz,
            self.p_flags,
            self.p_align
        )
    }
}

/// ELF section header (32-bit) with its resolved name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Elf32Shdr {
    pub sh_name: u32,
    pub sh_type: u32,
    pub sh_flags: u32,
    pub sh_addr: u32,
    pub sh_offset: u32,
    pub sh_size: u32,
    pub sh_link: u32,
    pub sh_info: u32,
    pub sh_addralign: u32,
    pub sh_entsize: u32,
    pub name: String,
}

impl Elf32Shdr {
    fn parse(image: &RawImage<'_>, offset: usize) -> Option<Self> {
        Some(Self {
            sh_name: image.read_u32(offset)?,
            sh_type: image.read_u32(offset + 4)?,
            sh_flags: image.read_u32(offset + 8)?,
            sh_addr: image.read_u32(offset + 12)?,
            sh_offset: image.read_u32(offset + 16)?,
            sh_size: image.read_u32(offset + 20)?,
            sh_link: image.read_u32(offset + 24)?,
            sh_info: image.read_u32(offset + 28)?,
            sh_addralign: image.read_u32(offset + 32)?,
            sh_entsize: image.read_u32(offset + 36)?,
            name: String::new(),
        })
    }
}

impl fmt::Display for Elf32Shdr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<24} type 0x{:08X} flags 0x{:08X} addr 0x{:08X} offset 0x{:08X} size 0x{:08X}",
            self.name, self.sh_type, self.sh_flags, self.sh_addr, self.sh_offset, self.sh_size
        )
    }
}

/// Textual dump of an image's headers kept for debugging front-ends
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElfInfo {
    pub header: String,
    pub programs: String,
    pub sections: String,
}

/// Parsed ELF headers
#[derive(Debug, Clone, Default)]
pub struct Elf32 {
    pub header: Elf32Header,
    pub phdrs: Vec<Elf32Phdr>,
    pub shdrs: Vec<Elf32Shdr>,
}

impl Elf32 {
    /// Parse headers from an image whose ELF region starts at offset 0.
    ///
    /// The machine type is checked before any table is read.
    pub fn parse(image: &RawImage<'_>) -> Result<Self, LoaderError> {
        let header = Elf32Header::parse(image)?;
        if !header.is_mips_executable() {
            return Err(LoaderError::NotMips(header.e_machine));
        }

        let phdrs = Self::parse_phdrs(image, &header)?;
        let shdrs = Self::parse_shdrs(image, &header);

        debug!(
            "ELF parsed: type=0x{:04x}, entry=0x{:08x}, phdrs={}, shdrs={}",
            header.e_type,
            header.e_entry,
            phdrs.len(),
            shdrs.len()
        );

        Ok(Self { header, phdrs, shdrs })
    }

    fn parse_phdrs(image: &RawImage<'_>, header: &Elf32Header) -> Result<Vec<Elf32Phdr>, LoaderError> {
        let stride = (header.e_phentsize as usize).max(PROGRAM_HEADER_SIZE);
        let mut phdrs = Vec::with_capacity(header.e_phnum as usize);

        for i in 0..header.e_phnum as usize {
            let offset = header.e_phoff as usize + i * stride;
            let phdr = Elf32Phdr::parse(image, offset).ok_or_else(|| {
                LoaderError::InvalidElf(format!(
                    "program header {} at 0x{:x} extends beyond image ({} bytes)",
                    i,
                    offset,
                    image.len()
                ))
            })?;
            trace!("PH#{}: {}", i, phdr);
            phdrs.push(phdr);
        }

        Ok(phdrs)
    }

    fn parse_shdrs(image: &RawImage<'_>, header: &Elf32Header) -> Vec<Elf32Shdr> {
        if header.e_shoff == 0 || header.e_shnum == 0 {
            debug!("No section headers present (e_shoff=0 or e_shnum=0)");
            return Vec::new();
        }

        let stride = (header.e_shentsize as usize).max(SECTION_HEADER_SIZE);
        let mut shdrs = Vec::with_capacity(header.e_shnum as usize);

        for i in 0..header.e_shnum as usize {
            let offset = header.e_shoff as usize + i * stride;
            match Elf32Shdr::parse(image, offset) {
                Some(shdr) => shdrs.push(shdr),
                None => {
                    // Section headers are optional for execution
                    warn!(
                        "Section header {} at 0x{:x} extends beyond image, ignoring section headers",
                        i, offset
                    );
                    return Vec::new();
                }
            }
        }

        let strtab_offset = shdrs.get(header.e_shstrndx as usize).map(|s| s.sh_offset as usize);
        if let Some(strtab_offset) = strtab_offset {
            for shdr in &mut shdrs {
                if let Some(name) = image.read_cstr(strtab_offset + shdr.sh_name as usize) {
                    shdr.name = name;
                }
            }
        } else {
            debug!("Section name string table index {} out of range", header.e_shstrndx);
        }

        shdrs
    }

    pub fn program_header(&self, index: usize) -> Option<&Elf32Phdr> {
        self.phdrs.get(index)
    }

    pub fn section_header(&self, name: &str) -> Option<&Elf32Shdr> {
        self.shdrs.iter().find(|s| s.name == name)
    }

    pub fn has_section_headers(&self) -> bool {
        !self.shdrs.is_empty()
    }

    pub fn info(&self) -> ElfInfo {
        let programs = self
            .phdrs
            .iter()
            .enumerate()
            .map(|(i, p)| format!("PH#{:<2} {}\n", i, p))
            .collect();
        let sections = self
            .shdrs
            .iter()
            .enumerate()
            .map(|(i, s)| format!("SH#{:<2} {}\n", i, s))
            .collect();
        ElfInfo {
            header: self.header.to_string(),
            programs,
            sections,
        }
    }
}
