//! Export tables: global symbol registration and lifecycle hooks

use crate::image::RawImage;
use crate::module::{Module, ModuleId, ThreadParams};
use crate::stubs::library_name;
use crate::symbols::SymbolTable;
use ag_memory::MemoryAccess;
use std::fmt;
use tracing::{debug, info, warn};

pub const ENT_HEADER_SIZE: u32 = 16;

/// Export table attribute bits
pub mod ent_attr {
    /// Table of the module itself (lifecycle hooks and variables)
    pub const MAIN: u16 = 0x8000;
    /// Entries are not published to other modules
    pub const LOCAL: u16 = 0x4000;
}

/// NIDs of the lifecycle functions exported by the main table
pub mod hook_nid {
    pub const MODULE_START: u32 = 0xD632_ACDB;
    pub const MODULE_STOP: u32 = 0xCEE8_593C;
    pub const MODULE_REBOOT_BEFORE: u32 = 0x2F06_4FA6;
    pub const MODULE_REBOOT_PHASE: u32 = 0xADF1_2745;
    pub const MODULE_BOOTSTART: u32 = 0xD374_4BE0;
}

/// NIDs of the variables exported by the main table
pub mod var_nid {
    pub const MODULE_INFO: u32 = 0xF01D_73A7;
    pub const START_THREAD_PARAMETER: u32 = 0x0F7C_276C;
    pub const STOP_THREAD_PARAMETER: u32 = 0xCF0C_C697;
    pub const REBOOT_BEFORE_THREAD_PARAMETER: u32 = 0xF4F4_299D;
    pub const SDK_VERSION: u32 = 0x11B9_7506;
}

/// One entry of the module's export table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntHeader {
    pub name_ptr: u32,
    pub version: u16,
    pub attr: u16,
    /// Header size in words
    pub size: u8,
    pub variable_count: u8,
    pub function_count: u16,
    pub resident_ptr: u32,
    pub library: String,
}

impl EntHeader {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let image = RawImage::new(bytes);
        Some(Self {
            name_ptr: image.read_u32(0)?,
            version: image.read_u16(4)?,
            attr: image.read_u16(6)?,
            size: image.read_u8(8)?,
            variable_count: image.read_u8(9)?,
            function_count: image.read_u16(10)?,
            resident_ptr: image.read_u32(12)?,
            library: String::new(),
        })
    }

    pub fn read(mem: &dyn MemoryAccess, addr: u32) -> Option<Self> {
        Self::parse(&mem.read_bytes(addr, ENT_HEADER_SIZE).ok()?)
    }

    pub fn stride(&self) -> u32 {
        if self.size == 0 {
            ENT_HEADER_SIZE / 2
        } else if self.size > 4 {
            self.size as u32 * 4
        } else {
            ENT_HEADER_SIZE
        }
    }

    pub fn is_main(&self) -> bool {
        self.attr & ent_attr::MAIN != 0
    }

    fn publishes(&self, mem: &dyn MemoryAccess, addr: u32) -> bool {
        mem.is_address_valid(addr) && self.attr & ent_attr::LOCAL == 0
    }
}

impl fmt::Display for EntHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "'{}' version=0x{:04x} attr=0x{:04x} size={} vcount={} fcount={} resident=0x{:08x}",
            self.library,
            self.version,
            self.attr,
            self.size,
            self.variable_count,
            self.function_count,
            self.resident_ptr
        )
    }
}

fn read_word(mem: &dyn MemoryAccess, addr: u32) -> Option<u32> {
    match mem.read32(addr) {
        Ok(word) => Some(word),
        Err(e) => {
            warn!("Export table word at 0x{:08x} unreadable: {}", addr, e);
            None
        }
    }
}

fn read_thread_params(mem: &dyn MemoryAccess, addr: u32) -> ThreadParams {
    let word = |offset: u32| mem.read32(addr.wrapping_add(offset)).unwrap_or(0);
    ThreadParams {
        priority: word(4),
        stack_size: word(8),
        attr: word(12),
    }
}

/// Walk the export table of `module`: publish its functions in `symbols`
/// under `owner` and record lifecycle hooks and variables from the main
/// table. Returns the number of exports published.
pub fn load_exports(
    mem: &dyn MemoryAccess,
    module: &mut Module,
    symbols: &mut SymbolTable,
    owner: ModuleId,
) -> usize {
    let mut addr = module.ent_top;
    let end = module.ent_top.wrapping_add(module.ent_size);
    let mut published = 0;

    let mut index = 0;
    while addr < end {
        let Some(mut header) = EntHeader::read(mem, addr) else {
            warn!("Export table entry at 0x{:08x} unreadable, stopping", addr);
            break;
        };
        if header.size == 0 {
            warn!("Skipping dummy export entry with size 0");
            addr = addr.wrapping_add(header.stride());
            index += 1;
            continue;
        }

        header.library = library_name(mem, header.name_ptr, module);
        debug!("Processing export header #{} at 0x{:08x}: {}", index, addr, header);
        addr = addr.wrapping_add(header.stride());
        index += 1;

        let functions = header.function_count as u32;
        let variables = header.variable_count as u32;
        let nid_addr = header.resident_ptr;
        let export_addr = nid_addr.wrapping_add((functions + variables) * 4);

        for j in 0..functions {
            let (Some(nid), Some(target)) = (
                read_word(mem, nid_addr.wrapping_add(j * 4)),
                read_word(mem, export_addr.wrapping_add(j * 4)),
            ) else {
                break;
            };

            if header.is_main() && record_hook(module, nid, target) {
                continue;
            }
            if header.publishes(mem, target) {
                symbols.put(&header.library, nid, target, Some(owner));
                published += 1;
                debug!("Export found at 0x{:08x} [0x{:08x}]", target, nid);
            }
        }

        if !header.is_main() {
            continue;
        }

        let variable_table = export_addr.wrapping_add(functions * 4);
        for j in 0..variables {
            let (Some(nid), Some(var_addr)) = (
                read_word(mem, nid_addr.wrapping_add((functions + j) * 4)),
                read_word(mem, variable_table.wrapping_add(j * 4)),
            ) else {
                break;
            };
            record_variable(mem, module, nid, var_addr);
        }
    }

    if published > 0 {
        info!("Found {} exports", published);
    }
    published
}

fn record_hook(module: &mut Module, nid: u32, target: u32) -> bool {
    let (slot, name) = match nid {
        hook_nid::MODULE_START => (&mut module.hooks.start, "module_start"),
        hook_nid::MODULE_STOP => (&mut module.hooks.stop, "module_stop"),
        hook_nid::MODULE_REBOOT_BEFORE => (&mut module.hooks.reboot_before, "module_reboot_before"),
        hook_nid::MODULE_REBOOT_PHASE => (&mut module.hooks.reboot_phase, "module_reboot_phase"),
        hook_nid::MODULE_BOOTSTART => (&mut module.hooks.bootstart, "module_bootstart"),
        _ => return false,
    };
    *slot = Some(target);
    debug!("{} found: nid=0x{:08x}, function=0x{:08x}", name, nid, target);
    true
}

fn record_variable(mem: &dyn MemoryAccess, module: &mut Module, nid: u32, addr: u32) {
    match nid {
        var_nid::MODULE_INFO => {
            debug!("module_info found: nid=0x{:08x}, addr=0x{:08x}", nid, addr);
        }
        var_nid::START_THREAD_PARAMETER => {
            module.start_thread = read_thread_params(mem, addr);
            debug!("module_start_thread_parameter found: {:?}", module.start_thread);
        }
        var_nid::STOP_THREAD_PARAMETER => {
            module.stop_thread = read_thread_params(mem, addr);
            debug!("module_stop_thread_parameter found: {:?}", module.stop_thread);
        }
        var_nid::REBOOT_BEFORE_THREAD_PARAMETER => {
            module.reboot_before_thread = read_thread_params(mem, addr);
            debug!("module_reboot_before_thread_parameter found: {:?}", module.reboot_before_thread);
        }
        var_nid::SDK_VERSION => match mem.read32(addr) {
            Ok(version) => {
                module.sdk_version = Some(version);
                debug!("module_sdk_version found: 0x{:08x}", version);
            }
            Err(e) => warn!("module_sdk_version at 0x{:08x} unreadable: {}", addr, e),
        },
        _ => warn!("Unknown variable entry found: nid=0x{:08x}, addr=0x{:08x}", nid, addr),
    }
}
