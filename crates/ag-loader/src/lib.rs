//! Module loader and dynamic linker for Allegrex executables
//!
//! Loads ELF, PRX and PBP images into the emulated address space, applies
//! relocations, binds imports to exports by NID and keeps the module
//! registry in a [`LoaderContext`].

pub mod context;
pub mod crypto;
pub mod elf;
pub mod exports;
pub mod format;
pub mod image;
pub mod instr;
pub mod loader;
pub mod module;
pub mod module_info;
pub mod pbp;
pub mod psf;
pub mod reloc;
pub mod reserve;
pub mod segments;
pub mod stubs;
pub mod symbols;

// Re-export main types
pub use context::{LoaderContext, SharedContext, SystemInfo};
pub use crypto::{Decryptor, NoKeysDecryptor};
pub use elf::{Elf32, Elf32Header, Elf32Phdr, Elf32Shdr, ElfInfo};
pub use format::{detect, Detection, Probe, ProbeEnv};
pub use image::RawImage;
pub use loader::{LoadFailure, Loader};
pub use module::{DeferredImportStub, Extent, LifecycleHooks, Module, ModuleFormat, ModuleId, ThreadParams};
pub use module_info::ModuleInfo;
pub use pbp::Pbp;
pub use psf::{Psf, PsfValue};
pub use reloc::{RelocationEntry, Relocator};
pub use stubs::ResolveStats;
pub use symbols::{nid_for_name, SymbolTable, SyscallTable};
