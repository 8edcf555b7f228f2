extern crate std;

use self::std::vec::Vec;

use super::*;
use boot_info::{BootMemoryRegion, KernelBaseAddress};
use memory_structs::{PhysicalAddress, PhysicalAddressRange, VirtualAddress};

struct TestBootInfo {
    entries: Vec<BootMemoryRegion>,
}

impl TestBootInfo {
    fn new(entries: &[(usize, usize, BootMemoryType)]) -> TestBootInfo {
        TestBootInfo {
            entries: entries
                .iter()
                .map(|&(start, size, typ)| BootMemoryRegion {
                    range: PhysicalAddressRange::new(PhysicalAddress::new(start), size),
                    typ,
                })
                .collect(),
        }
    }
}

impl BootInformation for TestBootInfo {
    type MemoryRegions<'a> = self::std::vec::IntoIter<BootMemoryRegion> where Self: 'a;

    fn memory_map(&self, direction: MapDirection) -> Self::MemoryRegions<'_> {
        let mut entries = self.entries.clone();
        if direction == MapDirection::Reverse {
            entries.reverse();
        }
        entries.into_iter()
    }

    fn direct_map_address(&self) -> VirtualAddress {
        VirtualAddress::new(0xFFFF_9000_0000_0000)
    }

    fn kernel_base_address(&self) -> KernelBaseAddress {
        KernelBaseAddress {
            physical: PhysicalAddress::new(0x20_0000),
            virt: VirtualAddress::new(0xFFFF_FFFF_8000_0000),
        }
    }

    fn rsdp(&self) -> Option<PhysicalAddress> {
        None
    }
}

const PAGE: usize = kernel_config::memory::PAGE_SIZE;

#[test]
fn allocates_sequentially_from_lowest_region() {
    let info = TestBootInfo::new(&[
        (0x10_0000, 4 * PAGE, BootMemoryType::Free),
        (0x20_0000, 2 * PAGE, BootMemoryType::Reserved),
        (0x30_0000, 2 * PAGE, BootMemoryType::Free),
    ]);
    let mut allocator = BootstrapAllocator::new(&info);

    let first = allocator.allocate();
    let second = allocator.allocate();
    assert_eq!(first.base_address().value(), 0x10_0000);
    assert_eq!(second.base_address().value(), 0x10_1000);
    assert_eq!(allocator.consumed_frame_count(), 2);
}

#[test]
fn spills_into_the_next_region() {
    let info = TestBootInfo::new(&[
        (0x10_0000, 2 * PAGE, BootMemoryType::Free),
        (0x30_0000, 2 * PAGE, BootMemoryType::Free),
    ]);
    let mut allocator = BootstrapAllocator::new(&info);

    allocator.allocate();
    allocator.allocate();
    let spilled = allocator.allocate();
    assert_eq!(spilled.base_address().value(), 0x30_0000);
}

#[test]
fn contiguous_allocations_skip_short_regions() {
    let info = TestBootInfo::new(&[
        (0x10_0000, 2 * PAGE, BootMemoryType::Free),
        (0x30_0000, 8 * PAGE, BootMemoryType::Free),
    ]);
    let mut allocator = BootstrapAllocator::new(&info);
    allocator.allocate();

    // Only one frame left in the first region; four must come from the
    // second.
    let run = allocator.allocate_contiguous(4);
    assert_eq!(run.base_address().value(), 0x30_0000);

    // The next single frame still comes from the first region's remainder.
    let single = allocator.allocate();
    assert_eq!(single.base_address().value(), 0x10_1000);
}

#[test]
#[should_panic]
fn panics_when_exhausted() {
    let info = TestBootInfo::new(&[(0x10_0000, PAGE, BootMemoryType::Free)]);
    let mut allocator = BootstrapAllocator::new(&info);
    allocator.allocate();
    allocator.allocate();
}

#[test]
#[should_panic]
fn deallocate_always_panics() {
    let info = TestBootInfo::new(&[(0x10_0000, 2 * PAGE, BootMemoryType::Free)]);
    let mut allocator = BootstrapAllocator::new(&info);
    let frame = allocator.allocate();
    allocator.deallocate(frame);
}

#[test]
fn teardown_reports_consumed_and_unconsumed() {
    let info = TestBootInfo::new(&[
        (0x10_0000, 4 * PAGE, BootMemoryType::Free),
        (0x30_0000, 2 * PAGE, BootMemoryType::Free),
    ]);
    let mut allocator = BootstrapAllocator::new(&info);
    allocator.allocate();
    allocator.allocate();
    allocator.allocate();

    let consumed: Vec<FrameRange> = allocator.consumed_frames().collect();
    assert_eq!(consumed.len(), 1);
    assert_eq!(consumed[0].size_in_frames(), 3);

    let unconsumed: Vec<FrameRange> = allocator.unconsumed_frames().collect();
    assert_eq!(unconsumed.len(), 2);
    assert_eq!(unconsumed[0].size_in_frames(), 1);
    assert_eq!(unconsumed[0].start().base_address().value(), 0x10_3000);
    assert_eq!(unconsumed[1].size_in_frames(), 2);
}
