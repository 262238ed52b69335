//! Loader state shared by every load call

use crate::elf::ElfInfo;
use crate::module::{Module, ModuleId};
use crate::stubs::{self, ResolveStats};
use crate::symbols::{SymbolTable, SyscallTable};
use ag_memory::MemoryAccess;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// System settings derived from the first module's PARAM.SFO
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SystemInfo {
    /// Firmware version as `major * 100 + minor`
    pub firmware_version: Option<u32>,
    /// The title asks for the 64MB memory layout
    pub memory_64mb: bool,
}

/// Module registry, global symbol tables and first-module state
#[derive(Debug)]
pub struct LoaderContext {
    modules: BTreeMap<ModuleId, Module>,
    next_uid: ModuleId,
    pub symbols: SymbolTable,
    pub syscalls: SyscallTable,
    pub loaded_first_module: bool,
    pub system_info: SystemInfo,
    /// Header dump of the first module
    pub elf_info: Option<ElfInfo>,
}

/// Context behind one coarse lock, held across load and resolution
pub type SharedContext = Arc<Mutex<LoaderContext>>;

impl Default for LoaderContext {
    fn default() -> Self {
        Self::new()
    }
}

impl LoaderContext {
    pub fn new() -> Self {
        Self {
            modules: BTreeMap::new(),
            next_uid: 1,
            symbols: SymbolTable::new(),
            syscalls: SyscallTable::new(),
            loaded_first_module: false,
            system_info: SystemInfo::default(),
            elf_info: None,
        }
    }

    /// Wrap a fresh context for shared use
    pub fn shared() -> SharedContext {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Forget every module and export. Registered syscalls are kept.
    ///
    /// Module reservations belong to the allocator and are not released
    /// here; [`Loader::reset`](crate::Loader::reset) frees them first.
    pub fn reset(&mut self) {
        debug!("Resetting loader context ({} modules)", self.modules.len());
        self.modules.clear();
        self.symbols.clear();
        self.loaded_first_module = false;
        self.system_info = SystemInfo::default();
        self.elf_info = None;
    }

    pub(crate) fn allocate_uid(&mut self) -> ModuleId {
        let uid = self.next_uid;
        self.next_uid += 1;
        uid
    }

    pub(crate) fn insert(&mut self, module: Module) {
        self.modules.insert(module.uid, module);
    }

    pub(crate) fn remove(&mut self, id: ModuleId) -> Option<Module> {
        self.modules.remove(&id)
    }

    /// Run one resolution pass over every registered module
    pub fn resolve_imports(&mut self, mem: &dyn MemoryAccess, warn_threshold: u32) -> ResolveStats {
        stubs::resolve_imports(
            mem,
            self.modules.values_mut(),
            &self.symbols,
            &self.syscalls,
            warn_threshold,
        )
    }

    pub fn module(&self, id: ModuleId) -> Option<&Module> {
        self.modules.get(&id)
    }

    /// Registered modules in load order
    pub fn modules(&self) -> impl Iterator<Item = &Module> {
        self.modules.values()
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Module> {
        self.modules.values().find(|m| m.name == name)
    }

    /// Imports still waiting for an exporter, across every module
    pub fn unresolved_count(&self) -> usize {
        self.modules.values().map(|m| m.unresolved_imports.len()).sum()
    }
}
