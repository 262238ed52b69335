//! PSP memory map constants

/// Mask removing the cached/uncached and kernel mirror bits
pub const ADDRESS_MASK: u32 = 0x3FFF_FFFF;

/// Scratchpad RAM
pub const SCRATCHPAD_BASE: u32 = 0x0001_0000;
pub const SCRATCHPAD_SIZE: u32 = 0x0000_4000;

/// Video RAM
pub const VRAM_BASE: u32 = 0x0400_0000;
pub const VRAM_SIZE: u32 = 0x0020_0000;

/// Main RAM (32MB, 64MB with extended RAM)
pub const RAM_BASE: u32 = 0x0800_0000;
pub const RAM_SIZE: u32 = 0x0200_0000;
pub const EXTENDED_RAM_SIZE: u32 = 0x0400_0000;

/// Kernel partition inside main RAM
pub const KERNEL_BASE: u32 = RAM_BASE;
pub const KERNEL_SIZE: u32 = 0x0080_0000;

/// First user-space address
pub const USER_BASE: u32 = 0x0880_0000;

/// Last user-space address on the standard 32MB layout
pub const END_USERSPACE: u32 = RAM_BASE + RAM_SIZE - 1;

/// Partition identifiers as used by the system memory manager
pub const KERNEL_PARTITION_ID: u32 = 1;
pub const USER_PARTITION_ID: u32 = 2;

/// Allocation granularity of the partition allocator
pub const PARTITION_ALIGNMENT: u32 = 0x100;
