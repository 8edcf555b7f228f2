//! Provides an allocator for physical memory frames.
//! The unit of allocation and deallocation is a single frame.
//!
//! The free list is a lock-free LIFO stack threaded through the intrusive
//! links of the page descriptors, so `allocate` and `deallocate` are O(1),
//! never block, and are safe to call from interrupt context once memory
//! init is complete — and never before.
//!
//! Batches of frames are returned through a [`FrameList`], which the
//! allocator splices onto the free list with a single compare-and-set.
//!
//! The free-byte counter is maintained separately from the list with
//! release-ordered updates; readers see it lag the list slightly.

#![no_std]


use boot_info::{BootInformation, BootMemoryType, MapDirection};
use bootstrap_allocator::BootstrapAllocator;
use core::fmt;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use kernel_config::memory::PAGE_SIZE;
use log::debug;
use memory_structs::{Frame, VirtualAddress};
use page_descriptors::{FrameList, PageDescriptorTable, PageIndex};

/// The error returned when no free frames remain.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FramesExhausted;

impl fmt::Display for FramesExhausted {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "all physical memory frames are in use")
    }
}

/// Byte totals for each class of physical memory reported at boot.
/// Fixed at init; only the free count changes afterwards.
#[derive(Clone, Copy, Default, Debug)]
pub struct MemoryStatistics {
    /// Usable RAM (free at boot plus boot-environment-occupied).
    pub total: usize,
    /// Firmware-reserved memory.
    pub reserved: usize,
    /// Bootloader- and ACPI-reclaimable memory.
    pub reclaimable: usize,
    /// Defective or unclassified memory.
    pub unavailable: usize,
}

/// The stack head: a 32-bit modification tag packed above a 32-bit
/// descriptor index. The tag changes on every successful push or pop so a
/// stalled compare-and-set cannot succeed against a recycled head.
const EMPTY_INDEX: u32 = u32::MAX;

fn pack(tag: u32, index: Option<PageIndex>) -> u64 {
    let raw = match index {
        Some(index) => index.value(),
        None => EMPTY_INDEX,
    };
    ((tag as u64) << 32) | raw as u64
}

fn unpack(word: u64) -> (u32, Option<PageIndex>) {
    let tag = (word >> 32) as u32;
    let raw = word as u32;
    let index = if raw == EMPTY_INDEX {
        None
    } else {
        Some(PageIndex::new(raw))
    };
    (tag, index)
}

/// The system-wide physical frame allocator.
pub struct FrameAllocator {
    table: &'static PageDescriptorTable,
    head: AtomicU64,
    free_bytes: AtomicUsize,
    stats: MemoryStatistics,
    /// Where physical address zero is mapped, for debug poison fills.
    /// `None` until the direct map exists (and in hosted tests that
    /// exercise the list without backing memory).
    direct_map_base: Option<VirtualAddress>,
}

impl FrameAllocator {
    /// Creates an allocator with an empty free list.
    /// Frames are added afterwards via [`FrameAllocator::deallocate`].
    pub fn new(
        table: &'static PageDescriptorTable,
        stats: MemoryStatistics,
        direct_map_base: Option<VirtualAddress>,
    ) -> FrameAllocator {
        FrameAllocator {
            table,
            head: AtomicU64::new(pack(0, None)),
            free_bytes: AtomicUsize::new(0),
            stats,
            direct_map_base,
        }
    }

    /// The page descriptor table this allocator draws from.
    pub fn table(&self) -> &'static PageDescriptorTable {
        self.table
    }

    /// Pops one frame off the free list.
    pub fn allocate(&self) -> Result<Frame, FramesExhausted> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let (tag, index) = unpack(head);
            let index = match index {
                Some(index) => index,
                None => return Err(FramesExhausted),
            };
            let descriptor = self.table.descriptor(index);
            let next = descriptor.next_index();
            let new = pack(tag.wrapping_add(1), next);
            match self
                .head
                .compare_exchange_weak(head, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    self.free_bytes.fetch_sub(PAGE_SIZE, Ordering::Release);
                    descriptor.set_next_index(None);
                    let frame = descriptor.frame();
                    self.poison(frame);
                    return Ok(frame);
                }
                Err(current) => head = current,
            }
        }
    }

    /// Splices a whole batch of frames back onto the free list with one
    /// compare-and-set. No-op on an empty list.
    pub fn deallocate(&self, list: FrameList) {
        let (first, last) = match (list.first(), list.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return,
        };
        let tail = self.table.descriptor(last);
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let (tag, index) = unpack(head);
            tail.set_next_index(index);
            let new = pack(tag.wrapping_add(1), Some(first));
            match self
                .head
                .compare_exchange_weak(head, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    self.free_bytes
                        .fetch_add(list.count() * PAGE_SIZE, Ordering::Release);
                    return;
                }
                Err(current) => head = current,
            }
        }
    }

    /// Usable RAM in bytes.
    pub fn total_bytes(&self) -> usize {
        self.stats.total
    }

    /// Currently free bytes. Eventually consistent: the counter is updated
    /// after the list, so readers may see it lag.
    pub fn free_bytes(&self) -> usize {
        self.free_bytes.load(Ordering::Relaxed)
    }

    pub fn reserved_bytes(&self) -> usize {
        self.stats.reserved
    }

    pub fn reclaimable_bytes(&self) -> usize {
        self.stats.reclaimable
    }

    pub fn unavailable_bytes(&self) -> usize {
        self.stats.unavailable
    }

    /// Fills a freshly allocated frame with poison through the direct map,
    /// so stale pointers into it fail loudly.
    #[cfg(debug_assertions)]
    fn poison(&self, frame: Frame) {
        if let Some(base) = self.direct_map_base {
            let virt = base.value() + frame.base_address().value();
            unsafe {
                core::ptr::write_bytes(
                    virt as *mut u8,
                    kernel_config::memory::FRAME_POISON_BYTE,
                    PAGE_SIZE,
                );
            }
        }
    }

    #[cfg(not(debug_assertions))]
    fn poison(&self, _frame: Frame) {}
}

static FRAME_ALLOCATOR: spin::Once<FrameAllocator> = spin::Once::new();

/// Initializes the system-wide frame allocator from the boot memory map,
/// taking over from the bootstrap allocator.
///
/// Every usable frame the bootstrap allocator did not consume is pushed
/// onto the free list; consumed frames are simply left off it.
pub fn init<B: BootInformation>(
    boot_info: &B,
    bootstrap: &BootstrapAllocator,
    table: &'static PageDescriptorTable,
    direct_map_base: Option<VirtualAddress>,
) -> Result<&'static FrameAllocator, &'static str> {
    if FRAME_ALLOCATOR.is_completed() {
        return Err("frame allocator was already initialized");
    }

    let mut stats = MemoryStatistics::default();
    for entry in boot_info.memory_map(MapDirection::Forward) {
        match entry.typ {
            BootMemoryType::Free | BootMemoryType::InUse => stats.total += entry.range.size,
            BootMemoryType::Reserved => stats.reserved += entry.range.size,
            BootMemoryType::BootloaderReclaimable | BootMemoryType::AcpiReclaimable => {
                stats.reclaimable += entry.range.size
            }
            BootMemoryType::Unusable | BootMemoryType::Unknown => {
                stats.unavailable += entry.range.size
            }
        }
    }

    let allocator = FRAME_ALLOCATOR.call_once(|| FrameAllocator::new(table, stats, direct_map_base));

    // Seed the free list. Pushing each range from its highest frame down
    // leaves the lowest frame at the stack head, so a freshly booted
    // system hands out frames in ascending address order.
    for range in bootstrap.unconsumed_frames() {
        let mut list = FrameList::new();
        let mut frame = range.end();
        loop {
            list.push_frame(frame, table);
            if frame == range.start() {
                break;
            }
            frame = Frame::from_index(frame.index() - 1);
        }
        allocator.deallocate(list);
    }

    debug!(
        "frame allocator: {} KiB total, {} KiB free, bootstrap consumed {} frames",
        allocator.total_bytes() / 1024,
        allocator.free_bytes() / 1024,
        bootstrap.consumed_frame_count(),
    );
    Ok(allocator)
}

/// The system-wide frame allocator, or `None` before memory init.
pub fn get() -> Option<&'static FrameAllocator> {
    FRAME_ALLOCATOR.get()
}

/// Pops one frame off the system-wide free list.
///
/// Panics before memory init.
pub fn allocate_frame() -> Result<Frame, FramesExhausted> {
    get().expect("frame allocator used before memory init").allocate()
}

/// Returns a batch of frames to the system-wide free list.
///
/// Panics before memory init.
pub fn deallocate_frames(list: FrameList) {
    get().expect("frame allocator used before memory init").deallocate(list)
}

/// A debugging function that logs the allocator's counters.
#[doc(hidden)]
pub fn dump_state() {
    if let Some(allocator) = get() {
        debug!(
            "frame allocator: total {} free {} reserved {} reclaimable {} unavailable {}",
            allocator.total_bytes(),
            allocator.free_bytes(),
            allocator.reserved_bytes(),
            allocator.reclaimable_bytes(),
            allocator.unavailable_bytes(),
        );
    } else {
        debug!("frame allocator: not yet initialized");
    }
}
