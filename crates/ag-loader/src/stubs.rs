//! Import stub tables and the global resolution pass

use crate::image::RawImage;
use crate::instr;
use crate::module::{DeferredImportStub, Module};
use crate::symbols::{SymbolTable, SyscallTable};
use ag_memory::MemoryAccess;
use std::fmt;
use tracing::{debug, info, warn};

pub const STUB_HEADER_SIZE: u32 = 20;
/// Longest library name read from guest memory
pub const MAX_LIBRARY_NAME: u32 = 64;
/// Bytes per import slot: jump plus delay slot
pub const STUB_SLOT_SIZE: u32 = 8;

/// One entry of the module's import table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StubHeader {
    pub name_ptr: u32,
    pub version: u16,
    pub flags: u16,
    /// Header size in words
    pub size: u8,
    pub vstub_size: u8,
    pub imports: u16,
    pub nid_ptr: u32,
    pub text_ptr: u32,
    /// Resolved library name
    pub library: String,
}

impl StubHeader {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let image = RawImage::new(bytes);
        Some(Self {
            name_ptr: image.read_u32(0)?,
            version: image.read_u16(4)?,
            flags: image.read_u16(6)?,
            size: image.read_u8(8)?,
            vstub_size: image.read_u8(9)?,
            imports: image.read_u16(10)?,
            nid_ptr: image.read_u32(12)?,
            text_ptr: image.read_u32(16)?,
            library: String::new(),
        })
    }

    pub fn read(mem: &dyn MemoryAccess, addr: u32) -> Option<Self> {
        Self::parse(&mem.read_bytes(addr, STUB_HEADER_SIZE).ok()?)
    }

    /// Distance to the next header
    pub fn stride(&self) -> u32 {
        if self.size == 0 {
            STUB_HEADER_SIZE / 2
        } else if self.size > 5 {
            self.size as u32 * 4
        } else {
            STUB_HEADER_SIZE
        }
    }
}

impl fmt::Display for StubHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "'{}' version=0x{:04x} flags=0x{:04x} size={} imports={} nid=0x{:08x} text=0x{:08x}",
            self.library, self.version, self.flags, self.size, self.imports, self.nid_ptr, self.text_ptr
        )
    }
}

/// Read the library name at `ptr`, falling back to the importing module's name
pub(crate) fn library_name(mem: &dyn MemoryAccess, ptr: u32, module: &Module) -> String {
    if mem.is_address_valid(ptr) {
        if let Ok(name) = mem.read_string_nz(ptr, MAX_LIBRARY_NAME) {
            return name;
        }
    }
    module.name.clone()
}

/// Walk the import table of `module`, queue one deferred stub per NID and
/// plant the unresolved trap in every delay slot
pub fn load_imports(mem: &dyn MemoryAccess, module: &mut Module) {
    let mut addr = module.stub_top;
    let end = module.stub_top.wrapping_add(module.stub_size);

    let mut index = 0;
    while addr < end {
        let Some(mut header) = StubHeader::read(mem, addr) else {
            warn!("Import table entry at 0x{:08x} unreadable, stopping", addr);
            break;
        };
        if header.size == 0 {
            warn!("Skipping dummy import entry with size 0");
            addr = addr.wrapping_add(header.stride());
            index += 1;
            continue;
        }

        header.library = library_name(mem, header.name_ptr, module);
        debug!("Processing Import #{}: {}", index, header);
        addr = addr.wrapping_add(header.stride());

        if !mem.is_address_valid(header.nid_ptr) || !mem.is_address_valid(header.text_ptr) {
            warn!("Incorrect NID or text address in stub header #{}: {}", index, header);
            index += 1;
            continue;
        }

        for j in 0..header.imports as u32 {
            let nid = match mem.read32(header.nid_ptr.wrapping_add(j * 4)) {
                Ok(nid) => nid,
                Err(e) => {
                    warn!("'{}': NID #{} unreadable: {}", header.library, j, e);
                    break;
                }
            };
            let patch_addr = header.text_ptr.wrapping_add(j * STUB_SLOT_SIZE);
            if let Err(e) = mem.write32(patch_addr.wrapping_add(4), instr::unresolved_trap()) {
                warn!("Failed to plant trap at 0x{:08x}: {}", patch_addr, e);
            }
            module.unresolved_imports.push_back(DeferredImportStub {
                module_name: header.library.clone(),
                nid,
                patch_addr,
            });
        }
        index += 1;
    }

    if !module.unresolved_imports.is_empty() {
        info!("Found {} unresolved imports", module.unresolved_imports.len());
    }
}

/// Counters for one resolution pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveStats {
    pub mapped: usize,
    pub failed: usize,
}

enum Resolution {
    Export(u32),
    Ignored,
    Syscall(u32),
    Unresolved,
}

fn resolve_one(stub: &DeferredImportStub, symbols: &SymbolTable, syscalls: &SyscallTable) -> Resolution {
    if let Some(addr) = symbols.get(&stub.module_name, stub.nid) {
        Resolution::Export(addr)
    } else if stub.nid == 0 {
        Resolution::Ignored
    } else if let Some(code) = syscalls.lookup(stub.nid) {
        Resolution::Syscall(code)
    } else {
        Resolution::Unresolved
    }
}

fn patch(mem: &dyn MemoryAccess, addr: u32, word: u32) {
    if let Err(e) = mem.write32(addr, word) {
        warn!("Failed to patch import at 0x{:08x}: {}", addr, e);
    }
}

/// Try every pending import of every module against the export and syscall
/// tables. Each module's attempt counter advances once per pass.
pub fn resolve_imports<'m>(
    mem: &dyn MemoryAccess,
    modules: impl IntoIterator<Item = &'m mut Module>,
    symbols: &SymbolTable,
    syscalls: &SyscallTable,
    warn_threshold: u32,
) -> ResolveStats {
    let mut stats = ResolveStats::default();

    for module in modules {
        module.import_fixup_attempts += 1;
        let attempt = module.import_fixup_attempts;

        for _ in 0..module.unresolved_imports.len() {
            let Some(stub) = module.unresolved_imports.pop_front() else {
                break;
            };
            let at = stub.patch_addr;

            match resolve_one(&stub, symbols, syscalls) {
                Resolution::Export(target) => {
                    patch(mem, at, instr::jump(target));
                    patch(mem, at.wrapping_add(4), instr::NOP);
                    stats.mapped += 1;
                    debug!(
                        "Mapped import at 0x{:08x} to export at 0x{:08x} [0x{:08x}] (attempt {})",
                        at, target, stub.nid, attempt
                    );
                }
                Resolution::Ignored => {
                    warn!("Ignoring import at 0x{:08x} [0x{:08x}] (attempt {})", at, stub.nid, attempt);
                    patch(mem, at.wrapping_add(4), instr::clear_v0());
                }
                Resolution::Syscall(code) => {
                    patch(mem, at.wrapping_add(4), instr::syscall(code));
                    stats.mapped += 1;
                    debug!(
                        "Mapped import at 0x{:08x} to syscall 0x{:05x} [0x{:08x}] (attempt {})",
                        at, code, stub.nid, attempt
                    );
                }
                Resolution::Unresolved => {
                    if attempt >= warn_threshold {
                        warn!(
                            "Failed to map import at 0x{:08x} [0x{:08x}] Module '{}' (attempt {})",
                            at, stub.nid, stub.module_name, attempt
                        );
                    } else {
                        debug!(
                            "Import at 0x{:08x} [0x{:08x}] Module '{}' still unresolved (attempt {})",
                            at, stub.nid, stub.module_name, attempt
                        );
                    }
                    stats.failed += 1;
                    module.unresolved_imports.push_back(stub);
                }
            }
        }
    }

    info!("{} NIDs mapped", stats.mapped);
    if stats.failed > 0 {
        info!("{} remaining unmapped NIDs", stats.failed);
    }
    stats
}
