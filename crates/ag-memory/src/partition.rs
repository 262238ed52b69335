//! Partition allocator backing module reservations

use crate::constants::*;
use parking_lot::Mutex;
use tracing::{debug, trace};

/// Placement strategy for a reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocKind {
    /// Lowest free block
    Low,
    /// Highest free block
    High,
    /// At the requested address
    Addr,
}

/// A granted reservation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub uid: u32,
    pub partition_id: u32,
    pub tag: String,
    pub addr: u32,
    pub size: u32,
}

/// Backing-store allocator used by the loader
pub trait Allocator: Send + Sync {
    /// Reserve `size` bytes. With [`AllocKind::Addr`] the allocator tries
    /// `addr` first; the granted address may still differ.
    fn reserve(
        &self,
        partition_id: u32,
        tag: &str,
        kind: AllocKind,
        size: u32,
        addr: u32,
    ) -> Option<Allocation>;

    /// Release a reservation
    fn free(&self, allocation: &Allocation);
}

struct Partition {
    id: u32,
    base: u32,
    size: u32,
    /// One bit per `PARTITION_ALIGNMENT` block
    allocation_map: Vec<u64>,
}

impl Partition {
    fn new(id: u32, base: u32, size: u32) -> Self {
        let blocks = (size / PARTITION_ALIGNMENT) as usize;
        Self {
            id,
            base,
            size,
            allocation_map: vec![0u64; blocks.div_ceil(64)],
        }
    }

    fn block_count(&self) -> usize {
        (self.size / PARTITION_ALIGNMENT) as usize
    }

    fn is_used(&self, block: usize) -> bool {
        self.allocation_map[block / 64] & (1u64 << (block % 64)) != 0
    }

    fn set_used(&mut self, start: usize, count: usize, used: bool) {
        for block in start..start + count {
            if used {
                self.allocation_map[block / 64] |= 1u64 << (block % 64);
            } else {
                self.allocation_map[block / 64] &= !(1u64 << (block % 64));
            }
        }
    }

    fn range_free(&self, start: usize, count: usize) -> bool {
        start + count <= self.block_count() && (start..start + count).all(|b| !self.is_used(b))
    }

    fn find_low(&self, count: usize) -> Option<usize> {
        let mut consecutive = 0usize;
        for block in 0..self.block_count() {
            if self.is_used(block) {
                consecutive = 0;
            } else {
                consecutive += 1;
                if consecutive == count {
                    return Some(block + 1 - count);
                }
            }
        }
        None
    }

    fn find_high(&self, count: usize) -> Option<usize> {
        let mut consecutive = 0usize;
        for block in (0..self.block_count()).rev() {
            if self.is_used(block) {
                consecutive = 0;
            } else {
                consecutive += 1;
                if consecutive == count {
                    return Some(block);
                }
            }
        }
        None
    }
}

struct PartitionState {
    partitions: Vec<Partition>,
    next_uid: u32,
}

/// First-fit partition allocator over the kernel and user partitions
pub struct PartitionAllocator {
    state: Mutex<PartitionState>,
}

impl PartitionAllocator {
    /// Partitions for a main RAM of `ram_size` bytes
    pub fn new(ram_size: u32) -> Self {
        let partitions = vec![
            Partition::new(KERNEL_PARTITION_ID, KERNEL_BASE, KERNEL_SIZE),
            Partition::new(USER_PARTITION_ID, USER_BASE, RAM_BASE + ram_size - USER_BASE),
        ];
        Self {
            state: Mutex::new(PartitionState {
                partitions,
                next_uid: 1,
            }),
        }
    }

    /// Number of free bytes in a partition
    pub fn free_size(&self, partition_id: u32) -> u32 {
        let state = self.state.lock();
        state
            .partitions
            .iter()
            .find(|p| p.id == partition_id)
            .map(|p| {
                let free = (0..p.block_count()).filter(|&b| !p.is_used(b)).count();
                free as u32 * PARTITION_ALIGNMENT
            })
            .unwrap_or(0)
    }
}

impl Default for PartitionAllocator {
    fn default() -> Self {
        Self::new(RAM_SIZE)
    }
}

impl Allocator for PartitionAllocator {
    fn reserve(
        &self,
        partition_id: u32,
        tag: &str,
        kind: AllocKind,
        size: u32,
        addr: u32,
    ) -> Option<Allocation> {
        let mut state = self.state.lock();
        let partition = state.partitions.iter_mut().find(|p| p.id == partition_id)?;

        let count = size.max(1).div_ceil(PARTITION_ALIGNMENT) as usize;

        let requested = match kind {
            AllocKind::Addr if addr >= partition.base => {
                let start = ((addr - partition.base) / PARTITION_ALIGNMENT) as usize;
                partition.range_free(start, count).then_some(start)
            }
            _ => None,
        };

        let start = match (kind, requested) {
            (_, Some(start)) => start,
            (AllocKind::High, None) => partition.find_high(count)?,
            (_, None) => {
                if kind == AllocKind::Addr {
                    debug!(
                        "Partition {}: 0x{:08x} (0x{:x} bytes) unavailable for '{}', falling back to first fit",
                        partition_id, addr, size, tag
                    );
                }
                partition.find_low(count)?
            }
        };

        partition.set_used(start, count, true);
        let granted = partition.base + start as u32 * PARTITION_ALIGNMENT;

        let uid = state.next_uid;
        state.next_uid += 1;

        trace!(
            "Partition {}: reserved 0x{:x} bytes at 0x{:08x} for '{}' (uid {})",
            partition_id, size, granted, tag, uid
        );

        Some(Allocation {
            uid,
            partition_id,
            tag: tag.to_string(),
            addr: granted,
            size,
        })
    }

    fn free(&self, allocation: &Allocation) {
        let mut state = self.state.lock();
        if let Some(partition) = state
            .partitions
            .iter_mut()
            .find(|p| p.id == allocation.partition_id)
        {
            if allocation.addr < partition.base {
                return;
            }
            let start = ((allocation.addr - partition.base) / PARTITION_ALIGNMENT) as usize;
            let count = allocation.size.max(1).div_ceil(PARTITION_ALIGNMENT) as usize;
            let count = count.min(partition.block_count().saturating_sub(start));
            partition.set_used(start, count, false);
            trace!("Partition {}: freed uid {} at 0x{:08x}", partition.id, allocation.uid, allocation.addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_address_reservation() {
        let alloc = PartitionAllocator::default();
        let a = alloc
            .reserve(USER_PARTITION_ID, "mod", AllocKind::Addr, 0x1000, 0x0880_4000)
            .unwrap();
        assert_eq!(a.addr, 0x0880_4000);
        assert_eq!(a.size, 0x1000);
    }

    #[test]
    fn test_conflicting_fixed_address_falls_back() {
        let alloc = PartitionAllocator::default();
        let first = alloc
            .reserve(USER_PARTITION_ID, "a", AllocKind::Addr, 0x1000, USER_BASE)
            .unwrap();
        let second = alloc
            .reserve(USER_PARTITION_ID, "b", AllocKind::Addr, 0x100, USER_BASE + 0x800)
            .unwrap();
        assert_eq!(first.addr, USER_BASE);
        assert_eq!(second.addr, USER_BASE + 0x1000);
        assert_ne!(first.uid, second.uid);
    }

    #[test]
    fn test_low_and_high() {
        let alloc = PartitionAllocator::default();
        let low = alloc.reserve(USER_PARTITION_ID, "low", AllocKind::Low, 0x100, 0).unwrap();
        let high = alloc.reserve(USER_PARTITION_ID, "high", AllocKind::High, 0x100, 0).unwrap();
        assert_eq!(low.addr, USER_BASE);
        assert_eq!(high.addr, END_USERSPACE + 1 - 0x100);
    }

    #[test]
    fn test_free_releases_blocks() {
        let alloc = PartitionAllocator::default();
        let before = alloc.free_size(USER_PARTITION_ID);
        let a = alloc
            .reserve(USER_PARTITION_ID, "tmp", AllocKind::Addr, 0x250, USER_BASE)
            .unwrap();
        assert_eq!(alloc.free_size(USER_PARTITION_ID), before - 0x300);
        alloc.free(&a);
        assert_eq!(alloc.free_size(USER_PARTITION_ID), before);
    }

    #[test]
    fn test_unknown_partition() {
        let alloc = PartitionAllocator::default();
        assert!(alloc.reserve(7, "x", AllocKind::Low, 0x100, 0).is_none());
    }

    #[test]
    fn test_exhaustion() {
        let alloc = PartitionAllocator::default();
        assert!(alloc
            .reserve(KERNEL_PARTITION_ID, "big", AllocKind::Low, KERNEL_SIZE + 1, 0)
            .is_none());
    }
}
