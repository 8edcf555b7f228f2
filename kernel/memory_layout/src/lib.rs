//! The static partitioning of the higher-half virtual address space into
//! named regions: kernel ELF sections, the direct map (cached and
//! non-cached), the kernel heap, the special (device) heap, kernel stacks,
//! the page descriptor array, and the general kernel address space.
//!
//! Regions are assigned deterministically once at boot and are immutable
//! afterwards. At most one region of each type exists, all regions are
//! disjoint, and all lie in the higher half.
//!
//! This crate also owns the address-translation helpers between physical
//! addresses and the direct map.

#![no_std]


use boot_info::KernelBaseAddress;
use core::fmt;
use kernel_config::memory::{
    DIRECT_MAP_MINIMUM_SIZE, HIGHER_HALF_START, LARGEST_PAGE_SIZE, PAGE_SIZE,
};
use log::debug;
use memory_structs::{
    PhysicalAddress, PhysicalAddressRange, VirtualAddress, VirtualAddressRange,
};
use page_descriptors::PageDescriptor;
use spin::Once;

/// The purpose of one named virtual memory region.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RegionType {
    WriteableSection,
    ReadonlySection,
    ExecutableSection,
    DebugSection,
    DirectMap,
    NonCachedDirectMap,
    SpecialHeap,
    KernelHeap,
    KernelStacks,
    PagesArray,
    KernelAddressSpace,
}

/// How many region types exist; bounds the region list.
pub const REGION_TYPE_COUNT: usize = 11;

/// One named region of kernel virtual address space.
#[derive(Clone, Copy, Debug)]
pub struct KernelMemoryRegion {
    pub range: VirtualAddressRange,
    pub typ: RegionType,
}

/// The error returned by translation helpers for addresses outside the
/// direct map.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AddressNotInDirectMap;

impl fmt::Display for AddressNotInDirectMap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "address is not within the direct map")
    }
}

/// The assigned region list, kept sorted by start address.
pub struct MemoryLayout {
    regions: [Option<KernelMemoryRegion>; REGION_TYPE_COUNT],
    region_count: usize,
    kernel_base: KernelBaseAddress,
}

impl MemoryLayout {
    pub fn new(kernel_base: KernelBaseAddress) -> MemoryLayout {
        MemoryLayout {
            regions: [None; REGION_TYPE_COUNT],
            region_count: 0,
            kernel_base,
        }
    }

    /// Registers a region, keeping the list sorted by start address.
    ///
    /// Rejects empty ranges, duplicate types, overlaps with existing
    /// regions, and ranges outside the higher half.
    pub fn add_region(&mut self, region: KernelMemoryRegion) -> Result<(), &'static str> {
        if region.range.size == 0 {
            return Err("cannot register an empty memory region");
        }
        if region.range.start.value() < HIGHER_HALF_START {
            return Err("kernel memory regions must lie in the higher half");
        }
        if self.region(region.typ).is_some() {
            return Err("a region of this type is already registered");
        }
        for existing in self.iter() {
            if existing.range.overlaps(&region.range) {
                return Err("kernel memory regions must not overlap");
            }
        }

        let mut insert_at = self.region_count;
        for (i, existing) in self.iter().enumerate() {
            if region.range.start < existing.range.start {
                insert_at = i;
                break;
            }
        }
        let mut i = self.region_count;
        while i > insert_at {
            self.regions[i] = self.regions[i - 1];
            i -= 1;
        }
        self.regions[insert_at] = Some(region);
        self.region_count += 1;
        debug!(
            "memory layout: {:?} at {:?} ({} KiB)",
            region.typ,
            region.range.start,
            region.range.size / 1024
        );
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &KernelMemoryRegion> {
        self.regions[..self.region_count]
            .iter()
            .map(|region| region.as_ref().unwrap())
    }

    /// The region of the given type, if one was assigned.
    pub fn region(&self, typ: RegionType) -> Option<&KernelMemoryRegion> {
        self.iter().find(|region| region.typ == typ)
    }

    /// The type of the region containing `addr`, or `None`.
    pub fn containing_address(&self, addr: VirtualAddress) -> Option<RegionType> {
        self.iter()
            .find(|region| region.range.contains_address(addr))
            .map(|region| region.typ)
    }

    /// The first gap between registered regions (searching the higher half
    /// in address order) that fits `size` bytes at `align` alignment.
    pub fn find_free_range(&self, size: usize, align: usize) -> Option<VirtualAddressRange> {
        assert!(align.is_power_of_two());
        if size == 0 {
            return None;
        }
        let mut candidate = align_up(HIGHER_HALF_START, align)?;
        for region in self.iter() {
            let region_start = region.range.start.value();
            let last = candidate.checked_add(size - 1)?;
            if last < region_start {
                return Some(VirtualAddressRange::new(VirtualAddress::new(candidate), size));
            }
            let past_region = region.range.end().value();
            if past_region > candidate {
                candidate = align_up(past_region, align)?;
            }
        }
        candidate.checked_add(size - 1)?;
        Some(VirtualAddressRange::new(VirtualAddress::new(candidate), size))
    }

    /// Finds a free range and registers it as the region of type `typ`.
    pub fn assign(
        &mut self,
        typ: RegionType,
        size: usize,
        align: usize,
    ) -> Result<VirtualAddressRange, &'static str> {
        let range = self
            .find_free_range(size, align)
            .ok_or("no free virtual range large enough")?;
        self.add_region(KernelMemoryRegion { range, typ })?;
        Ok(range)
    }

    /// The virtual address of `pa` within the direct map.
    pub fn direct_map_from_physical(
        &self,
        pa: PhysicalAddress,
    ) -> Result<VirtualAddress, AddressNotInDirectMap> {
        let region = self.region(RegionType::DirectMap).ok_or(AddressNotInDirectMap)?;
        if pa.value() < region.range.size {
            Ok(region.range.start + pa.value())
        } else {
            Err(AddressNotInDirectMap)
        }
    }

    /// The virtual address of `pa` within the non-cached direct map.
    pub fn non_cached_direct_map_from_physical(
        &self,
        pa: PhysicalAddress,
    ) -> Result<VirtualAddress, AddressNotInDirectMap> {
        let region = self
            .region(RegionType::NonCachedDirectMap)
            .ok_or(AddressNotInDirectMap)?;
        if pa.value() < region.range.size {
            Ok(region.range.start + pa.value())
        } else {
            Err(AddressNotInDirectMap)
        }
    }

    pub fn direct_map_from_physical_range(
        &self,
        range: PhysicalAddressRange,
    ) -> Result<VirtualAddressRange, AddressNotInDirectMap> {
        let start = self.direct_map_from_physical(range.start)?;
        if range.size > 0 {
            // The last byte must translate too.
            self.direct_map_from_physical(range.start + (range.size - 1))?;
        }
        Ok(VirtualAddressRange::new(start, range.size))
    }

    /// The physical address a direct-map virtual address refers to.
    pub fn physical_from_direct_map(
        &self,
        va: VirtualAddress,
    ) -> Result<PhysicalAddress, AddressNotInDirectMap> {
        let region = self.region(RegionType::DirectMap).ok_or(AddressNotInDirectMap)?;
        if region.range.contains_address(va) {
            Ok(PhysicalAddress::new(va - region.range.start))
        } else {
            Err(AddressNotInDirectMap)
        }
    }

    pub fn physical_range_from_direct_map(
        &self,
        range: VirtualAddressRange,
    ) -> Result<PhysicalAddressRange, AddressNotInDirectMap> {
        let start = self.physical_from_direct_map(range.start)?;
        if range.size > 0 {
            self.physical_from_direct_map(range.start + (range.size - 1))?;
        }
        Ok(PhysicalAddressRange::new(start, range.size))
    }

    /// Translates an address inside a kernel ELF section to its physical
    /// address using the kernel image's load offset.
    ///
    /// No checking is performed: the caller must know `va` lies within a
    /// kernel section.
    pub fn physical_from_kernel_section_unsafe(&self, va: VirtualAddress) -> PhysicalAddress {
        self.kernel_base.physical + (va - self.kernel_base.virt)
    }

    pub fn kernel_base(&self) -> KernelBaseAddress {
        self.kernel_base
    }
}

fn align_up(value: usize, align: usize) -> Option<usize> {
    let mask = align - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

/// One kernel ELF section to be registered in the layout.
#[derive(Clone, Copy, Debug)]
pub struct KernelSection {
    pub range: VirtualAddressRange,
    pub typ: RegionType,
}

/// Performs the deterministic region assignment:
///
/// 1. kernel ELF sections at their load addresses, widened to whole pages;
/// 2. the direct map at the boot-supplied base, sized to cover all of
///    physical memory (at least 4 GiB), rounded up for huge-page mapping,
///    then a same-sized slot for its non-cached alias;
/// 3. one top-level-entry-sized slot each for the kernel heap, special
///    heap, kernel stacks, and kernel address space;
/// 4. the page descriptor array, sized for every usable frame.
pub fn assign_standard_regions(
    sections: &[KernelSection],
    kernel_base: KernelBaseAddress,
    direct_map_base: VirtualAddress,
    highest_physical_address: PhysicalAddress,
    page_descriptor_count: usize,
    top_level_entry_size: usize,
) -> Result<MemoryLayout, &'static str> {
    let mut layout = MemoryLayout::new(kernel_base);

    for section in sections {
        let start = section.range.start.align_down_to_page();
        let size = section.range.end().align_up_to_page() - start;
        layout.add_region(KernelMemoryRegion {
            range: VirtualAddressRange::new(start, size),
            typ: section.typ,
        })?;
    }

    let direct_map_size = {
        let needed = highest_physical_address.value() + 1;
        let needed = if needed < DIRECT_MAP_MINIMUM_SIZE {
            DIRECT_MAP_MINIMUM_SIZE
        } else {
            needed
        };
        align_up(needed, LARGEST_PAGE_SIZE).ok_or("physical memory size overflows the direct map")?
    };
    layout.add_region(KernelMemoryRegion {
        range: VirtualAddressRange::new(direct_map_base, direct_map_size),
        typ: RegionType::DirectMap,
    })?;
    layout.assign(RegionType::NonCachedDirectMap, direct_map_size, LARGEST_PAGE_SIZE)?;

    for typ in [
        RegionType::KernelHeap,
        RegionType::SpecialHeap,
        RegionType::KernelStacks,
        RegionType::KernelAddressSpace,
    ] {
        layout.assign(typ, top_level_entry_size, top_level_entry_size)?;
    }

    let pages_array_size = align_up(
        core::mem::size_of::<PageDescriptor>() * page_descriptor_count,
        PAGE_SIZE,
    )
    .ok_or("page descriptor array size overflows")?;
    layout.assign(RegionType::PagesArray, pages_array_size, PAGE_SIZE)?;

    Ok(layout)
}

static MEMORY_LAYOUT: Once<MemoryLayout> = Once::new();

/// Installs the system-wide memory layout. Called once during memory init.
pub fn init(layout: MemoryLayout) -> &'static MemoryLayout {
    MEMORY_LAYOUT.call_once(|| layout)
}

/// The system-wide layout, or `None` before memory init.
pub fn get() -> Option<&'static MemoryLayout> {
    MEMORY_LAYOUT.get()
}

/// The system-wide layout.
///
/// Panics before memory init.
pub fn kernel_regions() -> &'static MemoryLayout {
    get().expect("memory layout used before memory init")
}
