//! allegrex - module loader front-end
//!
//! Loads each file given on the command line into one address space, in
//! order, and prints the resulting module map.

use ag_core::{logging, Config};
use ag_loader::{Loader, LoaderContext, Module, ModuleId};
use ag_memory::{MemoryAccess, MemoryManager, PartitionAllocator, EXTENDED_RAM_SIZE, RAM_SIZE};
use std::process::ExitCode;
use std::sync::Arc;

fn print_module(module: &Module) {
    println!(
        "[{}] {} ({}) {:?}",
        module.uid,
        module.display_name(),
        module.file_name,
        module.format
    );
    println!(
        "    range 0x{:08x} - 0x{:08x}, bss 0x{:x}, gp 0x{:08x}",
        module.load_address_low, module.load_address_high, module.bss_size, module.gp_value
    );
    match module.entry_addr {
        Some(entry) => println!("    entry 0x{:08x}", entry),
        None => println!("    no entry point"),
    }
    if let Some(start) = module.hooks.start {
        println!("    module_start 0x{:08x}", start);
    }
    if !module.unresolved_imports.is_empty() {
        println!("    {} unresolved imports", module.unresolved_imports.len());
    }
}

/// Read `file` and load it at `base`
fn load_file(
    loader: &Loader,
    ctx: &mut LoaderContext,
    file: &str,
    base: u32,
) -> ag_core::Result<ModuleId> {
    let data = std::fs::read(file)?;
    let uid = loader
        .load_module(ctx, file, &data, base)
        .map_err(|failure| failure.source)?;
    Ok(uid)
}

/// First 0x100-aligned address past `module`
fn next_base(module: &Module) -> u32 {
    module.load_address_high.saturating_add(0xFF) & !0xFF
}

fn main() -> ExitCode {
    let files: Vec<String> = std::env::args().skip(1).collect();

    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("Failed to load configuration, using defaults: {}", e);
        Config::default()
    });
    logging::init(config.debug.log_level);

    if files.is_empty() {
        eprintln!("usage: allegrex <module>...");
        return ExitCode::FAILURE;
    }

    let (mem, ram_size) = if config.memory.extended_ram {
        (MemoryManager::new_extended(), EXTENDED_RAM_SIZE)
    } else {
        (MemoryManager::new(), RAM_SIZE)
    };
    let loader = Loader::new(
        mem as Arc<dyn MemoryAccess>,
        Arc::new(PartitionAllocator::new(ram_size)),
        config.loader.clone(),
    );
    let mut ctx = LoaderContext::new();

    let mut base = config.loader.default_base_address;
    let mut failed = false;
    for file in &files {
        match load_file(&loader, &mut ctx, file, base) {
            Ok(uid) => {
                if let Some(module) = ctx.module(uid) {
                    // Next relocatable module goes after this one
                    base = base.max(next_base(module));
                }
            }
            Err(e) => {
                tracing::error!("Failed to load '{}': {}", file, e);
                failed = true;
            }
        }
    }

    for module in ctx.modules() {
        print_module(module);
    }
    if let Some(firmware) = ctx.system_info.firmware_version {
        println!("firmware {}.{:02}", firmware / 100, firmware % 100);
    }

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_base() {
        let mut module = Module::new("a.prx");
        module.load_address_high = 0x0890_0180;
        assert_eq!(next_base(&module), 0x0890_0200);
        module.load_address_high = 0x0890_0200;
        assert_eq!(next_base(&module), 0x0890_0200);

        // Fixed images mapped near the top of the address space
        module.load_address_high = 0xFFFF_FFF0;
        assert_eq!(next_base(&module), 0xFFFF_FF00);
    }
}
