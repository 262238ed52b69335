//! Module loading pipeline
//!
//! [`Loader`] turns a file image into a registered [`Module`]:
//!
//! 1. container detection and unwrapping (PBP, EDAT, `~PSP`)
//! 2. ELF header, program and section loading
//! 3. relocation, module descriptor, memory reservation
//! 4. import stubs and exports
//! 5. registration followed by a resolution pass over every module
//!
//! Malformed inputs abort only the module being loaded. Nothing already
//! written to memory is rolled back.

use crate::context::{LoaderContext, SharedContext};
use crate::crypto::{Decryptor, NoKeysDecryptor};
use crate::elf::{section, Elf32, NO_ENTRY};
use crate::exports::load_exports;
use crate::format::{detect, ProbeEnv};
use crate::image::RawImage;
use crate::module::{Extent, Module, ModuleFormat, ModuleId};
use crate::module_info::load_module_info;
use crate::reloc::relocate;
use crate::reserve::reserve_memory;
use crate::segments::{load_program, load_sections};
use crate::stubs::load_imports;
use ag_core::config::LoaderConfig;
use ag_core::error::LoaderError;
use ag_memory::{Allocator, MemoryAccess, END_USERSPACE};
use std::borrow::Cow;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Fixed-address images above this base probably collide with an
/// executable that is already loaded
const FIXED_IMAGE_WARN_BASE: u32 = 0x0890_0000;

/// A load that stopped early, with the module as far as it got.
/// The module is not registered.
#[derive(Debug, Error)]
#[error("failed to load '{}': {source}", .module.file_name)]
pub struct LoadFailure {
    #[source]
    pub source: LoaderError,
    pub module: Box<Module>,
}

impl LoadFailure {
    fn new(source: LoaderError, module: Module) -> Self {
        Self {
            source,
            module: Box::new(module),
        }
    }
}

/// Module loader bound to one address space and allocator
pub struct Loader {
    mem: Arc<dyn MemoryAccess>,
    alloc: Arc<dyn Allocator>,
    decryptor: Box<dyn Decryptor>,
    config: LoaderConfig,
}

impl Loader {
    pub fn new(mem: Arc<dyn MemoryAccess>, alloc: Arc<dyn Allocator>, config: LoaderConfig) -> Self {
        Self {
            mem,
            alloc,
            decryptor: Box::new(NoKeysDecryptor),
            config,
        }
    }

    /// Use `decryptor` for `~PSP` images
    pub fn with_decryptor(mut self, decryptor: impl Decryptor + 'static) -> Self {
        self.decryptor = Box::new(decryptor);
        self
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn memory(&self) -> &Arc<dyn MemoryAccess> {
        &self.mem
    }

    /// Load, link and register the module in `data`.
    ///
    /// Relocatable images are placed at `base`; fixed-address images ignore
    /// it. Every registered module takes part in the resolution pass that
    /// follows, so earlier imports can bind to this module's exports.
    pub fn load_module(
        &self,
        ctx: &mut LoaderContext,
        file_name: &str,
        data: &[u8],
        base: u32,
    ) -> Result<ModuleId, LoadFailure> {
        info!("Loading module '{}' ({} bytes) at base 0x{:08x}", file_name, data.len(), base);
        let mut module = Module::new(file_name);

        let prepared = self.prepare(ctx.loaded_first_module, &mut module, data, base, false);
        if !ctx.loaded_first_module {
            apply_system_info(ctx, &module);
        }
        let (elf, elf_data) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => return Err(LoadFailure::new(e, module)),
        };

        let mem = &*self.mem;
        let image = RawImage::new(&elf_data);

        if elf.header.requires_relocation() {
            let processed = relocate(mem, &image, &elf, module.base_address);
            debug!("Applied {} relocations", processed);
        }

        if let Err(e) = load_module_info(mem, &elf, &mut module) {
            module.entry_addr = None;
            return Err(LoadFailure::new(e, module));
        }

        reserve_memory(&*self.alloc, &mut module);
        load_imports(mem, &mut module);

        let uid = ctx.allocate_uid();
        module.uid = uid;
        load_exports(mem, &mut module, &mut ctx.symbols, uid);
        self.record_debugger_info(ctx, &elf, &mut module);

        info!(
            "Loaded module '{}' (uid {}) at 0x{:08x} - 0x{:08x}, entry {}",
            module.display_name(),
            uid,
            module.load_address_low,
            module.load_address_high,
            module
                .entry_addr
                .map_or_else(|| "none".to_string(), |e| format!("0x{:08x}", e))
        );
        ctx.insert(module);

        ctx.resolve_imports(mem, self.config.unresolved_warn_threshold);
        ctx.loaded_first_module = true;
        Ok(uid)
    }

    /// [`Loader::load_module`] under the shared context's lock
    pub fn load_shared(
        &self,
        ctx: &SharedContext,
        file_name: &str,
        data: &[u8],
        base: u32,
    ) -> Result<ModuleId, LoadFailure> {
        let mut ctx = ctx.lock();
        self.load_module(&mut ctx, file_name, data, base)
    }

    /// Parse headers and compute the layout of `data` without writing
    /// memory, relocating or registering anything
    pub fn analyze_module(
        &self,
        ctx: &LoaderContext,
        file_name: &str,
        data: &[u8],
        base: u32,
    ) -> Result<Module, LoadFailure> {
        let mut module = Module::new(file_name);
        match self.prepare(ctx.loaded_first_module, &mut module, data, base, true) {
            Ok(_) => Ok(module),
            Err(e) => Err(LoadFailure::new(e, module)),
        }
    }

    /// Remove a module, release its reservations and withdraw its exports.
    /// Imports other modules already bound to it stay patched.
    pub fn unload_module(&self, ctx: &mut LoaderContext, id: ModuleId) -> Option<Module> {
        let module = ctx.remove(id)?;
        for allocation in &module.allocations {
            self.alloc.free(allocation);
        }
        let dropped = ctx.symbols.remove_owner(id);
        info!(
            "Unloaded module '{}' (uid {}), {} exports withdrawn",
            module.display_name(),
            id,
            dropped
        );
        Some(module)
    }

    /// Release every registered module's reservations, then reset `ctx`
    pub fn reset(&self, ctx: &mut LoaderContext) {
        let mut freed = 0;
        for module in ctx.modules() {
            for allocation in &module.allocations {
                self.alloc.free(allocation);
                freed += 1;
            }
        }
        debug!("Released {} module reservations", freed);
        ctx.reset();
    }

    /// Detect the container, then load the ELF headers, segments and
    /// sections of `data` into `module`
    fn prepare<'a>(
        &self,
        loaded_first_module: bool,
        module: &mut Module,
        data: &'a [u8],
        base: u32,
        analyze_only: bool,
    ) -> Result<(Elf32, Cow<'a, [u8]>), LoaderError> {
        let env = ProbeEnv {
            decryptor: &*self.decryptor,
            allow_decrypt: !(self.config.decrypt_only_first_module && loaded_first_module),
        };
        let detection = detect(data, &env);
        module.format |= detection.format;
        module.psf = detection.psf;
        let elf_data = detection.elf?;

        let image = RawImage::new(&elf_data);
        let elf = match Elf32::parse(&image) {
            Ok(elf) => elf,
            Err(e @ LoaderError::NotMips(_)) => {
                module.format |= ModuleFormat::ELF;
                error!("Loader NOT a MIPS executable");
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        module.format |= ModuleFormat::ELF;

        let mut base = base;
        if elf.header.is_prx() {
            debug!("Relocation required (PRX)");
            module.format |= ModuleFormat::PRX;
        } else if elf.header.requires_relocation() {
            info!("Relocation required (ELF)");
        } else {
            if base > FIXED_IMAGE_WARN_BASE {
                warn!("Probably trying to load PBP ELF while another PBP ELF is already loaded");
            }
            base = 0;
        }

        module.base_address = base;
        module.entry_addr = match elf.header.e_entry {
            NO_ENTRY => None,
            entry => Some(base.wrapping_add(entry)),
        };
        module.load_address_low = if base != 0 { base } else { END_USERSPACE };
        module.load_address_high = base;

        let mem = &*self.mem;
        load_program(mem, &image, &elf, module, analyze_only);
        load_sections(mem, &elf, module, analyze_only);

        Ok((elf, elf_data))
    }

    fn record_debugger_info(&self, ctx: &mut LoaderContext, elf: &Elf32, module: &mut Module) {
        let base = module.base_address;
        let extent = |name: &str| {
            elf.section_header(name).map(|shdr| Extent {
                addr: base.wrapping_add(shdr.sh_addr),
                size: shdr.sh_size,
            })
        };
        module.init_section = extent(section::INIT);
        module.fini_section = extent(section::FINI);
        module.stub_text_section = extent(section::STUB_TEXT);

        if !ctx.loaded_first_module && self.config.keep_elf_info {
            ctx.elf_info = Some(elf.info());
        }
    }
}

/// Firmware version and memory layout requested by the first module's
/// PARAM.SFO
fn apply_system_info(ctx: &mut LoaderContext, module: &Module) {
    let Some(psf) = &module.psf else {
        return;
    };
    info!("PBP meta data:\n{}", psf);
    ctx.system_info.firmware_version = psf.firmware_version();
    ctx.system_info.memory_64mb = psf.wants_extended_memory();
    debug!(
        "System info: firmware {:?}, 64MB memory {}",
        ctx.system_info.firmware_version, ctx.system_info.memory_64mb
    );
}
