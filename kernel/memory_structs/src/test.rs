extern crate std;

use super::*;
use kernel_config::memory::{FLUSH_BATCH_CAPACITY, PAGE_SIZE};

fn page_at(addr: usize) -> Page {
    Page::containing_address(VirtualAddress::new(addr))
}

fn range_at(addr: usize, pages: usize) -> PageRange {
    PageRange::from_virt_addr(VirtualAddress::new(addr), pages * PAGE_SIZE)
}

#[test]
fn frame_address_round_trip() {
    for index in [0u32, 1, 0x1000, 0xF_FFFF] {
        let frame = Frame::from_index(index);
        assert_eq!(Frame::from_address(frame.base_address()), frame);
        assert_eq!(frame.base_address().value(), index as usize * PAGE_SIZE);
    }
}

#[test]
fn frame_containing_address_rounds_down() {
    let addr = PhysicalAddress::new(3 * PAGE_SIZE + 17);
    assert_eq!(Frame::containing_address(addr), Frame::from_index(3));
}

#[test]
fn frame_range_sizes() {
    let range = FrameRange::from_base_address(PhysicalAddress::new(0x1_0000_0000), 16 * 1024 * 1024);
    assert_eq!(range.size_in_frames(), 4096);
    assert_eq!(range.size_in_bytes(), 16 * 1024 * 1024);
    assert!(FrameRange::empty().is_empty());
    assert_eq!(FrameRange::empty().size_in_frames(), 0);
}

#[test]
fn frame_range_iteration() {
    let range = FrameRange::new(Frame::from_index(10), Frame::from_index(13));
    let frames: std::vec::Vec<u32> = range.iter().map(|f| f.index()).collect();
    assert_eq!(frames, [10, 11, 12, 13]);
}

#[test]
fn page_range_covers_partial_pages() {
    let range = PageRange::from_virt_addr(VirtualAddress::new(0x1000 + 8), 0x1000);
    // Touches two pages even though it is one page long.
    assert_eq!(range.size_in_pages(), 2);
}

#[test]
fn virtual_address_range_queries() {
    let range = VirtualAddressRange::new(VirtualAddress::new(0x4000), 0x2000);
    assert!(range.contains_address(VirtualAddress::new(0x4000)));
    assert!(range.contains_address(VirtualAddress::new(0x5FFF)));
    assert!(!range.contains_address(VirtualAddress::new(0x6000)));
    let inner = VirtualAddressRange::new(VirtualAddress::new(0x4800), 0x800);
    assert!(range.contains_range(&inner));
    let disjoint = VirtualAddressRange::new(VirtualAddress::new(0x8000), 0x1000);
    assert!(!range.overlaps(&disjoint));
    assert!(range.overlaps(&inner));
}

#[test]
fn map_type_equality_is_field_wise() {
    let a = MapType::kernel_read_write();
    let b = MapType::new(Environment::Kernel, Protection::ReadWrite, CachePolicy::WriteBack);
    assert_eq!(a, b);
    assert_ne!(a, MapType::kernel_uncached());
    assert_ne!(
        a,
        MapType::new(Environment::User, Protection::ReadWrite, CachePolicy::WriteBack)
    );
}

#[test]
fn protection_tightening() {
    assert!(Protection::ReadWrite.is_tightened_by(Protection::Read));
    assert!(Protection::Read.is_tightened_by(Protection::None));
    assert!(!Protection::Read.is_tightened_by(Protection::ReadWrite));
    assert!(MapType::kernel_read_write().change_requires_flush(&MapType::kernel_uncached()));
    assert!(!MapType::kernel_read_only().change_requires_flush(&MapType::kernel_read_write()));
}

#[test]
fn batch_appends_stay_sorted_and_disjoint() {
    let mut batch = VirtualRangeBatch::new();
    // In-order, page-aligned appends with gaps beyond the merge slack.
    for i in 0..6 {
        batch.append(range_at(0x10_0000 + i * 0x10_0000, 2));
    }
    let ranges = batch.as_slice();
    assert_eq!(ranges.len(), 6);
    for pair in ranges.windows(2) {
        assert!(pair[0].end() < pair[1].start());
    }
}

#[test]
fn batch_merges_within_slack() {
    let mut batch = VirtualRangeBatch::new();
    batch.append(range_at(0x10_0000, 1));
    // One page of gap, within the two-page slack.
    batch.append(range_at(0x10_2000, 1));
    assert_eq!(batch.len(), 1);
    assert_eq!(batch.as_slice()[0].start(), page_at(0x10_0000));
    assert_eq!(batch.as_slice()[0].end(), page_at(0x10_2000));
}

#[test]
fn batch_forces_merge_at_capacity() {
    let mut batch = VirtualRangeBatch::new();
    for i in 0..FLUSH_BATCH_CAPACITY + 3 {
        batch.append(range_at(0x10_0000 + i * 0x100_0000, 1));
    }
    assert_eq!(batch.len(), FLUSH_BATCH_CAPACITY);
    // The overflowing appends all merged into the last entry.
    let last = batch.as_slice()[FLUSH_BATCH_CAPACITY - 1];
    assert_eq!(
        last.end(),
        page_at(0x10_0000 + (FLUSH_BATCH_CAPACITY + 2) * 0x100_0000)
    );
}

#[test]
fn batch_ignores_empty_ranges() {
    let mut batch = VirtualRangeBatch::new();
    batch.append(PageRange::empty());
    assert!(batch.is_empty());
}
