//! Backing reservation for a loaded module

use crate::module::Module;
use ag_memory::{AllocKind, Allocation, Allocator, PARTITION_ALIGNMENT, USER_PARTITION_ID};
use tracing::{debug, warn};

/// Reserve `[low & !0xFF, high)` in the user partition for `module`.
///
/// A failed or displaced reservation is reported and loading continues; the
/// grant, if any, is recorded on the module.
pub fn reserve_memory(alloc: &dyn Allocator, module: &mut Module) -> Option<Allocation> {
    let addr = module.load_address_low & !(PARTITION_ALIGNMENT - 1);
    let size = module.load_address_high.wrapping_sub(addr);

    let tag = module.display_name().to_string();
    let granted = alloc.reserve(USER_PARTITION_ID, &tag, AllocKind::Addr, size, addr);

    match &granted {
        None => warn!(
            "Failed to properly reserve memory consumed by module {} at address 0x{:08x}, size 0x{:x}",
            tag, addr, size
        ),
        Some(allocation) if allocation.addr != addr => warn!(
            "Reserved memory for module {} at 0x{:08x} instead of 0x{:08x}, size 0x{:x}",
            tag, allocation.addr, addr, size
        ),
        Some(allocation) => debug!(
            "Reserved 0x{:x} bytes at 0x{:08x} for module {}",
            allocation.size, allocation.addr, tag
        ),
    }

    if let Some(allocation) = &granted {
        module.allocations.push(allocation.clone());
    }
    granted
}

#[cfg(test)]
mod tests {
    use super::*;
    use ag_memory::PartitionAllocator;

    fn module(low: u32, high: u32) -> Module {
        let mut module = Module::new("boot.bin");
        module.name = "Boot".to_string();
        module.load_address_low = low;
        module.load_address_high = high;
        module
    }

    #[test]
    fn test_aligned_reservation() {
        let alloc = PartitionAllocator::default();
        let mut m = module(0x0890_0040, 0x0890_0180);
        let granted = reserve_memory(&alloc, &mut m).unwrap();
        assert_eq!(granted.addr, 0x0890_0000);
        assert_eq!(granted.size, 0x180);
        assert_eq!(granted.partition_id, USER_PARTITION_ID);
        assert_eq!(granted.tag, "Boot");
        assert_eq!(m.allocations, vec![granted]);
    }

    #[test]
    fn test_conflict_is_recorded() {
        let alloc = PartitionAllocator::default();
        let mut first = module(0x0890_0000, 0x0890_1000);
        let mut second = module(0x0890_0000, 0x0890_1000);
        reserve_memory(&alloc, &mut first).unwrap();
        let granted = reserve_memory(&alloc, &mut second).unwrap();
        assert_ne!(granted.addr, 0x0890_0000);
        assert_eq!(second.allocations.len(), 1);
    }

    #[test]
    fn test_outside_user_partition() {
        let alloc = PartitionAllocator::default();
        let mut m = module(0x0400_0000, 0x0800_0000);
        assert!(reserve_memory(&alloc, &mut m).is_none());
        assert!(m.allocations.is_empty());
    }
}
