//! Memory section attributes

use bitflags::bitflags;

bitflags! {
    /// Section protection flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageFlags: u32 {
        /// Section is readable
        const READ    = 0b0000_0001;
        /// Section is writable
        const WRITE   = 0b0000_0010;
        /// Section is executable
        const EXECUTE = 0b0000_0100;

        /// Read and write access
        const RW  = Self::READ.bits() | Self::WRITE.bits();
        /// Read, write, and execute access
        const RWX = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
        /// Read and execute access
        const RX  = Self::READ.bits() | Self::EXECUTE.bits();
    }
}

impl Default for PageFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// ELF section flag bits
pub const SHF_WRITE: u32 = 0x1;
pub const SHF_ALLOC: u32 = 0x2;
pub const SHF_EXECINSTR: u32 = 0x4;

impl PageFlags {
    /// Derive protection from ELF `sh_flags`.
    ///
    /// An allocated section is readable.
    pub fn from_section_flags(sh_flags: u32) -> Self {
        let mut flags = PageFlags::empty();
        if sh_flags & SHF_ALLOC != 0 {
            flags |= PageFlags::READ;
        }
        if sh_flags & SHF_WRITE != 0 {
            flags |= PageFlags::WRITE;
        }
        if sh_flags & SHF_EXECINSTR != 0 {
            flags |= PageFlags::EXECUTE;
        }
        flags
    }
}

/// A loaded section registered with the memory map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySection {
    pub base: u32,
    pub size: u32,
    pub flags: PageFlags,
}

impl MemorySection {
    pub fn new(base: u32, size: u32, flags: PageFlags) -> Self {
        Self { base, size, flags }
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.base && (addr - self.base) < self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_section_flags() {
        assert_eq!(PageFlags::from_section_flags(0), PageFlags::empty());
        assert_eq!(PageFlags::from_section_flags(SHF_ALLOC | SHF_EXECINSTR), PageFlags::RX);
        assert_eq!(
            PageFlags::from_section_flags(SHF_ALLOC | SHF_WRITE | SHF_EXECINSTR),
            PageFlags::RWX
        );
        assert_eq!(PageFlags::from_section_flags(SHF_WRITE), PageFlags::WRITE);
    }

    #[test]
    fn test_section_contains() {
        let section = MemorySection::new(0x0880_0000, 0x100, PageFlags::RW);
        assert!(section.contains(0x0880_0000));
        assert!(section.contains(0x0880_00FF));
        assert!(!section.contains(0x0880_0100));
        assert!(!section.contains(0x087F_FFFF));
    }
}
