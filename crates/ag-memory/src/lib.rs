//! Memory management for the allegrex loader
//!
//! This crate provides the emulated PSP address space the loader writes
//! module images into, the section map, and the partition allocator used
//! to reserve the range each module occupies.

pub mod constants;
pub mod manager;
pub mod pages;
pub mod partition;

pub use constants::*;
pub use manager::{MemoryAccess, MemoryManager, MemoryRegion};
pub use pages::{MemorySection, PageFlags, SHF_ALLOC, SHF_EXECINSTR, SHF_WRITE};
pub use partition::{AllocKind, Allocation, Allocator, PartitionAllocator};
