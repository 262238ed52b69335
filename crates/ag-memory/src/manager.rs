//! Memory manager implementation

use crate::constants::*;
use crate::pages::MemorySection;
use ag_core::error::MemoryError;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

/// Byte-level access to the emulated address space.
///
/// Implementors provide bounds-checked block reads and writes; the typed
/// little-endian accessors are derived from those. All methods take `&self`
/// so a single memory instance can be shared between the loader and the CPU.
pub trait MemoryAccess: Send + Sync {
    /// Check whether `addr` maps to backed memory
    fn is_address_valid(&self, addr: u32) -> bool;

    /// Fill `buf` from memory starting at `addr`
    fn read_into(&self, addr: u32, buf: &mut [u8]) -> Result<(), MemoryError>;

    /// Copy `data` to memory starting at `addr`
    fn write_bytes(&self, addr: u32, data: &[u8]) -> Result<(), MemoryError>;

    /// Set `len` bytes starting at `addr` to `value`
    fn memset(&self, addr: u32, value: u8, len: u32) -> Result<(), MemoryError>;

    /// Record a loaded section with the memory map
    fn add_memory_section(&self, _section: MemorySection) {}

    fn read8(&self, addr: u32) -> Result<u8, MemoryError> {
        let mut buf = [0u8; 1];
        self.read_into(addr, &mut buf)?;
        Ok(buf[0])
    }

    fn read16(&self, addr: u32) -> Result<u16, MemoryError> {
        check_alignment(addr, 2)?;
        let mut buf = [0u8; 2];
        self.read_into(addr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read32(&self, addr: u32) -> Result<u32, MemoryError> {
        check_alignment(addr, 4)?;
        self.read_unaligned32(addr)
    }

    fn read_unaligned32(&self, addr: u32) -> Result<u32, MemoryError> {
        let mut buf = [0u8; 4];
        self.read_into(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn write8(&self, addr: u32, value: u8) -> Result<(), MemoryError> {
        self.write_bytes(addr, &[value])
    }

    fn write16(&self, addr: u32, value: u16) -> Result<(), MemoryError> {
        check_alignment(addr, 2)?;
        self.write_bytes(addr, &value.to_le_bytes())
    }

    fn write32(&self, addr: u32, value: u32) -> Result<(), MemoryError> {
        check_alignment(addr, 4)?;
        self.write_unaligned32(addr, value)
    }

    fn write_unaligned32(&self, addr: u32, value: u32) -> Result<(), MemoryError> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    fn read_bytes(&self, addr: u32, len: u32) -> Result<Vec<u8>, MemoryError> {
        let mut data = vec![0u8; len as usize];
        self.read_into(addr, &mut data)?;
        Ok(data)
    }

    /// Read a NUL-terminated string of at most `max_len` bytes
    fn read_string_nz(&self, addr: u32, max_len: u32) -> Result<String, MemoryError> {
        let mut bytes = Vec::new();
        for i in 0..max_len {
            let b = self.read8(addr.wrapping_add(i))?;
            if b == 0 {
                break;
            }
            bytes.push(b);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

fn check_alignment(addr: u32, align: u32) -> Result<(), MemoryError> {
    if addr % align != 0 {
        return Err(MemoryError::AlignmentError { addr, align });
    }
    Ok(())
}

/// Memory region descriptor
pub struct MemoryRegion {
    /// Base address
    pub base: u32,
    /// Size in bytes
    pub size: u32,
    /// Region name
    pub name: &'static str,
    data: RwLock<Box<[u8]>>,
}

impl MemoryRegion {
    fn new(base: u32, size: u32, name: &'static str) -> Self {
        Self {
            base,
            size,
            name,
            data: RwLock::new(vec![0u8; size as usize].into_boxed_slice()),
        }
    }

    fn contains(&self, addr: u32) -> bool {
        addr >= self.base && (addr - self.base) < self.size
    }

    /// Offset range of `[addr, addr + len)` inside this region
    fn span(&self, addr: u32, len: usize) -> Option<std::ops::Range<usize>> {
        let start = (addr - self.base) as usize;
        let end = start.checked_add(len)?;
        (end <= self.size as usize).then_some(start..end)
    }
}

/// Emulated PSP address space
///
/// Holds scratchpad, VRAM and main RAM. Kernel and uncached mirrors are
/// folded onto the same backing store through [`ADDRESS_MASK`].
pub struct MemoryManager {
    regions: Vec<MemoryRegion>,
    sections: RwLock<Vec<MemorySection>>,
}

impl MemoryManager {
    /// Create the standard 32MB layout
    pub fn new() -> Arc<Self> {
        Self::with_ram_size(RAM_SIZE)
    }

    /// Create a layout with the 64MB main RAM
    pub fn new_extended() -> Arc<Self> {
        Self::with_ram_size(EXTENDED_RAM_SIZE)
    }

    fn with_ram_size(ram_size: u32) -> Arc<Self> {
        debug!("Creating address space with 0x{:x} bytes of main RAM", ram_size);

        let regions = vec![
            MemoryRegion::new(SCRATCHPAD_BASE, SCRATCHPAD_SIZE, "Scratchpad"),
            MemoryRegion::new(VRAM_BASE, VRAM_SIZE, "VRAM"),
            MemoryRegion::new(RAM_BASE, ram_size, "Main Memory"),
        ];

        Arc::new(Self {
            regions,
            sections: RwLock::new(Vec::new()),
        })
    }

    fn region(&self, addr: u32) -> Option<&MemoryRegion> {
        let addr = addr & ADDRESS_MASK;
        self.regions.iter().find(|r| r.contains(addr))
    }

    /// Get memory regions
    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    /// Sections registered by loaded modules
    pub fn sections(&self) -> Vec<MemorySection> {
        self.sections.read().clone()
    }

    /// Find the registered section containing `addr`
    pub fn section_at(&self, addr: u32) -> Option<MemorySection> {
        self.sections.read().iter().rev().find(|s| s.contains(addr)).copied()
    }
}

impl MemoryAccess for MemoryManager {
    fn is_address_valid(&self, addr: u32) -> bool {
        self.region(addr).is_some()
    }

    fn read_into(&self, addr: u32, buf: &mut [u8]) -> Result<(), MemoryError> {
        let region = self.region(addr).ok_or(MemoryError::InvalidAddress(addr))?;
        let span = region
            .span(addr & ADDRESS_MASK, buf.len())
            .ok_or(MemoryError::InvalidAddress(addr))?;
        buf.copy_from_slice(&region.data.read()[span]);
        Ok(())
    }

    fn write_bytes(&self, addr: u32, data: &[u8]) -> Result<(), MemoryError> {
        let region = self.region(addr).ok_or(MemoryError::InvalidAddress(addr))?;
        let span = region
            .span(addr & ADDRESS_MASK, data.len())
            .ok_or(MemoryError::InvalidAddress(addr))?;
        region.data.write()[span].copy_from_slice(data);
        Ok(())
    }

    fn memset(&self, addr: u32, value: u8, len: u32) -> Result<(), MemoryError> {
        let region = self.region(addr).ok_or(MemoryError::InvalidAddress(addr))?;
        let span = region
            .span(addr & ADDRESS_MASK, len as usize)
            .ok_or(MemoryError::InvalidAddress(addr))?;
        region.data.write()[span].fill(value);
        Ok(())
    }

    fn add_memory_section(&self, section: MemorySection) {
        self.sections.write().push(section);
    }
}
