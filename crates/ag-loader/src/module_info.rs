//! Module descriptor (`sceModuleInfo`) extraction

use crate::elf::{section, Elf32};
use crate::image::RawImage;
use crate::module::Module;
use ag_core::error::LoaderError;
use ag_memory::MemoryAccess;
use tracing::{error, info, warn};

pub const MODULE_INFO_SIZE: u32 = 52;
const NAME_LEN: usize = 28;

/// Decoded module descriptor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleInfo {
    pub attr: u16,
    /// `[minor, major]`
    pub version: [u8; 2],
    pub name: String,
    pub gp: u32,
    pub ent_top: u32,
    pub ent_end: u32,
    pub stub_top: u32,
    pub stub_end: u32,
}

impl ModuleInfo {
    /// Decode the 52-byte descriptor
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let image = RawImage::new(bytes);
        let name_bytes = image.slice(4, NAME_LEN)?;
        let end = name_bytes.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        Some(Self {
            attr: image.read_u16(0)?,
            version: [image.read_u8(2)?, image.read_u8(3)?],
            name: String::from_utf8_lossy(&name_bytes[..end]).into_owned(),
            gp: image.read_u32(32)?,
            ent_top: image.read_u32(36)?,
            ent_end: image.read_u32(40)?,
            stub_top: image.read_u32(44)?,
            stub_end: image.read_u32(48)?,
        })
    }

    pub fn read(mem: &dyn MemoryAccess, addr: u32) -> Option<Self> {
        let bytes = mem.read_bytes(addr, MODULE_INFO_SIZE).ok()?;
        Self::parse(&bytes)
    }

    /// Copy the descriptor fields onto `module`
    pub fn apply(&self, module: &mut Module) {
        module.name = self.name.clone();
        module.attribute = self.attr;
        module.version = self.version;
        module.gp_value = self.gp;
        module.ent_top = self.ent_top;
        module.ent_size = self.ent_end.wrapping_sub(self.ent_top);
        module.stub_top = self.stub_top;
        module.stub_size = self.stub_end.wrapping_sub(self.stub_top);
    }
}

/// Where the descriptor lives in memory
pub fn locate(elf: &Elf32, base: u32) -> Option<u32> {
    let module_info_section = elf.section_header(section::MODULE_INFO);

    if elf.header.is_prx() {
        let ph0 = elf.program_header(0)?;
        return Some(
            base.wrapping_add(ph0.p_paddr & 0x7FFF_FFFF)
                .wrapping_sub(ph0.p_offset),
        );
    }

    match module_info_section {
        Some(shdr) => Some(base.wrapping_add(shdr.sh_addr)),
        None => {
            let ph0 = elf.program_header(0)?;
            warn!("ELF is not PRX, but has no module info section");
            let addr = ph0
                .p_vaddr
                .wrapping_add(ph0.p_paddr & 0x7FFF_FFFF)
                .wrapping_sub(ph0.p_offset);
            warn!("Manually locating module info at address 0x{:08x}", addr);
            Some(addr)
        }
    }
}

/// Find, decode and apply the module descriptor
pub fn load_module_info(
    mem: &dyn MemoryAccess,
    elf: &Elf32,
    module: &mut Module,
) -> Result<ModuleInfo, LoaderError> {
    let Some(addr) = locate(elf, module.base_address) else {
        error!("Module info not found!");
        return Err(LoaderError::ModuleInfoMissing);
    };
    let Some(info) = ModuleInfo::read(mem, addr) else {
        error!("Module info at 0x{:08x} is not readable", addr);
        return Err(LoaderError::ModuleInfoMissing);
    };

    info.apply(module);
    info!(
        "Found module info name:'{}' version:{:02x}{:02x} attr:0x{:08x} gp:0x{:08x}",
        module.name, module.version[1], module.version[0], module.attribute, module.gp_value
    );
    if module.is_kernel_mode() {
        warn!("Kernel mode module detected");
    }
    if module.is_vsh_mode() {
        warn!("VSH mode module detected");
    }

    Ok(info)
}
