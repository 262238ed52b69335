//! Loaded module record

use crate::psf::Psf;
use ag_memory::Allocation;
use bitflags::bitflags;
use std::collections::VecDeque;

/// Registry identifier of a loaded module
pub type ModuleId = u32;

bitflags! {
    /// Container formats encountered while unwrapping an image
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ModuleFormat: u32 {
        const ELF = 0x01;
        const PRX = 0x02;
        const PBP = 0x04;
        const SCE = 0x08;
        const PSP = 0x10;
    }
}

impl Default for ModuleFormat {
    fn default() -> Self {
        Self::empty()
    }
}

/// Module attribute bits from the module descriptor
pub mod attr {
    pub const KERNEL: u16 = 0x1000;
    pub const VSH: u16 = 0x0800;
}

/// Thread parameters for a lifecycle hook
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadParams {
    pub priority: u32,
    pub stack_size: u32,
    pub attr: u32,
}

/// Lifecycle entry points exported by the main module table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LifecycleHooks {
    pub start: Option<u32>,
    pub stop: Option<u32>,
    pub reboot_before: Option<u32>,
    pub reboot_phase: Option<u32>,
    pub bootstart: Option<u32>,
}

/// An import still waiting for its exporter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredImportStub {
    /// Library the import comes from
    pub module_name: String,
    pub nid: u32,
    /// Address of the 8-byte jump/delay-slot pair
    pub patch_addr: u32,
}

/// Address and size of a named section
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Extent {
    pub addr: u32,
    pub size: u32,
}

/// A module being loaded, or registered after a successful load
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub uid: ModuleId,
    pub file_name: String,
    pub format: ModuleFormat,

    pub base_address: u32,
    /// `None` when the image declares no entry point
    pub entry_addr: Option<u32>,
    pub load_address_low: u32,
    pub load_address_high: u32,
    pub bss_size: u32,
    pub text_addr: u32,
    pub text_size: u32,
    pub data_size: u32,
    /// Span reserved for the module
    pub segment: Extent,

    // Module descriptor
    pub name: String,
    pub attribute: u16,
    /// `[minor, major]`
    pub version: [u8; 2],
    pub gp_value: u32,
    pub ent_top: u32,
    pub ent_size: u32,
    pub stub_top: u32,
    pub stub_size: u32,

    pub hooks: LifecycleHooks,
    pub start_thread: ThreadParams,
    pub stop_thread: ThreadParams,
    pub reboot_before_thread: ThreadParams,
    pub sdk_version: Option<u32>,

    pub unresolved_imports: VecDeque<DeferredImportStub>,
    /// Resolution passes this module has taken part in
    pub import_fixup_attempts: u32,
    pub allocations: Vec<Allocation>,

    pub psf: Option<Psf>,

    pub init_section: Option<Extent>,
    pub fini_section: Option<Extent>,
    pub stub_text_section: Option<Extent>,
}

impl Module {
    pub fn new(file_name: &str) -> Self {
        Self {
            file_name: file_name.to_string(),
            ..Default::default()
        }
    }

    /// Name used for allocations and diagnostics
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.file_name
        } else {
            &self.name
        }
    }

    pub fn is_kernel_mode(&self) -> bool {
        self.attribute & attr::KERNEL != 0
    }

    pub fn is_vsh_mode(&self) -> bool {
        self.attribute & attr::VSH != 0
    }

    /// Size of the range the module occupies
    pub fn load_size(&self) -> u32 {
        self.load_address_high.saturating_sub(self.load_address_low)
    }
}
