//! Global export table and syscall NID table

use crate::module::ModuleId;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use tracing::{debug, trace};

/// NID of an exported name: the first four bytes of its SHA-1 digest,
/// read little-endian
pub fn nid_for_name(name: &str) -> u32 {
    let digest = Sha1::digest(name.as_bytes());
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ExportEntry {
    addr: u32,
    owner: Option<ModuleId>,
}

/// `(library name, NID) -> address` table shared by every loaded module
#[derive(Debug, Default)]
pub struct SymbolTable {
    libraries: HashMap<String, HashMap<u32, ExportEntry>>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an export. A later registration of the same key wins.
    pub fn put(&mut self, module_name: &str, nid: u32, addr: u32, owner: Option<ModuleId>) {
        trace!("Export {}::0x{:08x} -> 0x{:08x}", module_name, nid, addr);
        self.libraries
            .entry(module_name.to_string())
            .or_default()
            .insert(nid, ExportEntry { addr, owner });
    }

    pub fn get(&self, module_name: &str, nid: u32) -> Option<u32> {
        self.libraries.get(module_name)?.get(&nid).map(|e| e.addr)
    }

    /// Drop every export registered by `owner`, returning how many went
    pub fn remove_owner(&mut self, owner: ModuleId) -> usize {
        let mut removed = 0;
        for exports in self.libraries.values_mut() {
            let before = exports.len();
            exports.retain(|_, e| e.owner != Some(owner));
            removed += before - exports.len();
        }
        self.libraries.retain(|_, exports| !exports.is_empty());
        debug!("Removed {} exports of module {}", removed, owner);
        removed
    }

    /// Number of registered exports
    pub fn len(&self) -> usize {
        self.libraries.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.libraries.is_empty()
    }

    pub fn clear(&mut self) {
        self.libraries.clear();
    }
}

/// NIDs serviced directly by the kernel through `syscall`
#[derive(Debug, Default, Clone)]
pub struct SyscallTable {
    codes: HashMap<u32, u32>,
}

impl SyscallTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, nid: u32, code: u32) {
        self.codes.insert(nid, code);
    }

    /// Register by function name; returns the NID used
    pub fn register_name(&mut self, name: &str, code: u32) -> u32 {
        let nid = nid_for_name(name);
        self.register(nid, code);
        nid
    }

    pub fn lookup(&self, nid: u32) -> Option<u32> {
        self.codes.get(&nid).copied()
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}
