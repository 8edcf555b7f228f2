//! The virtual memory subsystem: the architecture paging contract, the
//! [`PageTable`] mapping engine, kernel page-fault classification, and the
//! memory-init sequence that brings the whole core up from the boot
//! memory map.
//!
//! Init order (see [`init`]): bootstrap allocator, page descriptor table
//! (written through the boot environment's direct map), memory layout,
//! frame allocator (taking over every frame the bootstrap allocator did
//! not consume), then the kernel page table with the direct map, kernel
//! sections, and descriptor array mapped and the large regions'
//! top-level entries pre-filled. Switching to the new table is the boot
//! orchestrator's job, not ours.

#![no_std]

mod arch;
mod fault;
mod mapper;


pub use arch::{ArchPageTableOps, BackingDecision, TopLevelDecision};
pub use fault::{classify_kernel_page_fault, report_fatal_kernel_fault, KernelFaultDisposition};
pub use mapper::PageTable;
pub use memory_layout::kernel_regions;

use boot_info::{BootInformation, MapDirection};
use bootstrap_allocator::BootstrapAllocator;
use core::fmt;
use core::mem::size_of;
use frame_allocator::{FrameAllocator, FramesExhausted};
use kernel_config::memory::PAGE_SIZE;
use log::{debug, info};
use memory_layout::{assign_standard_regions, KernelSection, MemoryLayout, RegionType};
use memory_structs::{
    FlushTarget, FrameRange, MapType, PageRange, PhysicalAddress,
};
use page_descriptors::{PageDescriptor, PageDescriptorTable};
use resource_arena::Arena;
use spin::Once;

/// Mapping-level errors.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MapError {
    /// A mapping was already present where one was being installed.
    /// This signals a logic bug; orchestrators treat it as fatal.
    AlreadyMapped,
    /// The architecture rejected the mapping parameters, or no mapping
    /// was present where one was expected.
    MappingNotValid,
    /// The frame allocator ran out of physical memory.
    FramesExhausted,
}

impl From<FramesExhausted> for MapError {
    fn from(_: FramesExhausted) -> MapError {
        MapError::FramesExhausted
    }
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MapError::AlreadyMapped => write!(f, "virtual address is already mapped"),
            MapError::MappingNotValid => write!(f, "mapping parameters are not valid"),
            MapError::FramesExhausted => write!(f, "out of physical memory frames"),
        }
    }
}

static ARCH_OPS: Once<&'static dyn ArchPageTableOps> = Once::new();

/// Installs the architecture paging layer. The same object provides the
/// translation-cache flush primitive to the shootdown protocol.
pub fn init_arch<A>(ops: &'static A)
where
    A: ArchPageTableOps + tlb_shootdown::FlushOps,
{
    ARCH_OPS.call_once(|| ops as &'static dyn ArchPageTableOps);
    tlb_shootdown::init_flush_ops(ops);
}

pub(crate) fn arch_ops() -> &'static dyn ArchPageTableOps {
    *ARCH_OPS
        .get()
        .expect("architecture paging layer not installed")
}

static KERNEL_PAGE_TABLE: Once<PageTable> = Once::new();
static KERNEL_ADDRESS_SPACE: Once<Arena> = Once::new();

/// The kernel's page table.
///
/// Panics before memory init.
pub fn kernel_page_table() -> &'static PageTable {
    KERNEL_PAGE_TABLE
        .get()
        .expect("kernel page table used before memory init")
}

/// The arena handing out general-purpose kernel virtual address ranges.
///
/// Panics before memory init.
pub fn kernel_address_space() -> &'static Arena {
    KERNEL_ADDRESS_SPACE
        .get()
        .expect("kernel address space used before memory init")
}

/// Everything [`init`] produces, for the boot orchestrator.
pub struct MemoryInitArtifacts {
    pub layout: &'static MemoryLayout,
    pub frame_allocator: &'static FrameAllocator,
    pub page_table: &'static PageTable,
}

fn section_map_type(typ: RegionType) -> MapType {
    match typ {
        RegionType::ExecutableSection => MapType::kernel_executable(),
        RegionType::WriteableSection => MapType::kernel_read_write(),
        _ => MapType::kernel_read_only(),
    }
}

/// Brings the memory core up from the boot memory map.
///
/// Requires [`init_arch`] to have been called. `sections` describes the
/// kernel ELF image as loaded.
pub fn init<B: BootInformation>(
    boot_info: &B,
    sections: &[KernelSection],
) -> Result<MemoryInitArtifacts, &'static str> {
    let arch = arch_ops();
    let mut bootstrap = BootstrapAllocator::new(boot_info);

    // Size the descriptor array and find the top of physical memory.
    let mut descriptor_count = 0usize;
    let mut highest_physical = PhysicalAddress::zero();
    for entry in boot_info.memory_map(MapDirection::Forward) {
        if entry.range.size == 0 {
            continue;
        }
        let last = entry.range.start + (entry.range.size - 1);
        if last > highest_physical {
            highest_physical = last;
        }
        if entry.typ.is_usable() {
            descriptor_count +=
                FrameRange::from_base_address(entry.range.start, entry.range.size)
                    .size_in_frames();
        }
    }
    if descriptor_count == 0 {
        return Err("boot memory map reports no usable memory");
    }

    // The descriptors are written through the boot environment's direct
    // map, into physically contiguous bootstrap frames.
    let storage_bytes = descriptor_count * size_of::<PageDescriptor>();
    let storage_frames = (storage_bytes + PAGE_SIZE - 1) / PAGE_SIZE;
    let storage_start = bootstrap.allocate_contiguous(storage_frames);
    let storage_va = boot_info.direct_map_address() + storage_start.base_address().value();
    debug!(
        "memory init: {} page descriptors in {} frames at {:?}",
        descriptor_count, storage_frames, storage_va
    );

    let usable = boot_info
        .memory_map(MapDirection::Forward)
        .filter(|entry| entry.typ.is_usable())
        .map(|entry| FrameRange::from_base_address(entry.range.start, entry.range.size));
    let table = unsafe {
        PageDescriptorTable::new_at(
            storage_va.value() as *mut PageDescriptor,
            descriptor_count,
            usable,
        )?
    };
    let table = page_descriptors::init(table);

    let layout = assign_standard_regions(
        sections,
        boot_info.kernel_base_address(),
        boot_info.direct_map_address(),
        highest_physical,
        descriptor_count,
        arch.size_of_top_level_entry(),
    )?;
    let layout = memory_layout::init(layout);

    let direct_map_base = layout
        .region(RegionType::DirectMap)
        .ok_or("layout has no direct map")?
        .range
        .start;
    let allocator = frame_allocator::init(boot_info, &bootstrap, table, Some(direct_map_base))?;

    // Build the kernel page table.
    let root = allocator
        .allocate()
        .map_err(|_| "no frame available for the page table root")?;
    let page_table = PageTable::new(root.base_address());

    let direct_map = layout.region(RegionType::DirectMap).unwrap().range;
    page_table
        .map_to_physical_range_all_page_sizes(
            PageRange::from_virt_addr(direct_map.start, direct_map.size),
            FrameRange::from_base_address(PhysicalAddress::zero(), direct_map.size),
            MapType::kernel_read_write(),
        )
        .map_err(|_| "failed to map the direct map")?;

    let non_cached = layout.region(RegionType::NonCachedDirectMap).unwrap().range;
    page_table
        .map_to_physical_range_all_page_sizes(
            PageRange::from_virt_addr(non_cached.start, non_cached.size),
            FrameRange::from_base_address(PhysicalAddress::zero(), non_cached.size),
            MapType::kernel_uncached(),
        )
        .map_err(|_| "failed to map the non-cached direct map")?;

    for section in sections {
        let region = layout
            .region(section.typ)
            .ok_or("kernel section missing from the layout")?
            .range;
        let physical = layout.physical_from_kernel_section_unsafe(region.start);
        page_table
            .map_to_physical_range_all_page_sizes(
                PageRange::from_virt_addr(region.start, region.size),
                FrameRange::from_base_address(physical, region.size),
                section_map_type(section.typ),
            )
            .map_err(|_| "failed to map a kernel section")?;
    }

    let pages_array = layout.region(RegionType::PagesArray).unwrap().range;
    page_table
        .map_range_to_physical_range(
            PageRange::from_virt_addr(pages_array.start, storage_frames * PAGE_SIZE),
            FrameRange::new(storage_start, storage_start + (storage_frames as u32 - 1)),
            MapType::kernel_read_write(),
            FlushTarget::Kernel,
            TopLevelDecision::Keep,
        )
        .map_err(|_| "failed to map the page descriptor array")?;

    // Pre-fill the top-level entries of the large regions so that every
    // future address space shares them by construction.
    for typ in [
        RegionType::KernelHeap,
        RegionType::SpecialHeap,
        RegionType::KernelStacks,
        RegionType::KernelAddressSpace,
    ] {
        let region = layout.region(typ).unwrap().range;
        page_table
            .fill_top_level(PageRange::from_virt_addr(region.start, region.size))
            .map_err(|_| "failed to pre-fill a region's top-level entries")?;
    }

    let page_table = KERNEL_PAGE_TABLE.call_once(|| page_table);

    let kas = layout.region(RegionType::KernelAddressSpace).unwrap().range;
    let kas_arena = KERNEL_ADDRESS_SPACE.call_once(|| Arena::new("kernel_address_space", PAGE_SIZE));
    kas_arena.add_span(kas.start.value(), kas.size)?;

    info!(
        "memory init complete: {} MiB usable, page table root {:?}",
        allocator.total_bytes() / (1024 * 1024),
        page_table.root(),
    );

    Ok(MemoryInitArtifacts {
        layout,
        frame_allocator: allocator,
        page_table,
    })
}
