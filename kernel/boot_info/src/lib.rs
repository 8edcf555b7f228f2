//! The contract between the memory core and the boot environment.
//!
//! A concrete boot protocol crate (Limine, multiboot2, UEFI, ...) implements
//! [`BootInformation`] over its own in-memory structures; the memory core
//! only ever consumes this trait.

#![no_std]

use memory_structs::{PhysicalAddress, PhysicalAddressRange, VirtualAddress};

/// The classification of one boot memory map entry.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BootMemoryType {
    /// Usable RAM, free for the kernel to take.
    Free,
    /// Usable RAM that the boot environment placed something in
    /// (the kernel image, boot modules, early page tables).
    InUse,
    /// Firmware-reserved; never usable.
    Reserved,
    /// Reclaimable once the boot environment's data is no longer needed.
    BootloaderReclaimable,
    /// Reclaimable once the ACPI tables have been consumed.
    AcpiReclaimable,
    /// Defective or otherwise unusable RAM.
    Unusable,
    /// Anything the boot protocol did not classify.
    Unknown,
}

impl BootMemoryType {
    /// Whether frames of this type may ever back kernel allocations.
    pub fn is_usable(&self) -> bool {
        matches!(self, BootMemoryType::Free | BootMemoryType::InUse)
    }
}

/// One entry of the boot memory map.
#[derive(Clone, Copy, Debug)]
pub struct BootMemoryRegion {
    pub range: PhysicalAddressRange,
    pub typ: BootMemoryType,
}

/// Which way to walk the boot memory map.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MapDirection {
    /// Lowest physical address first.
    Forward,
    /// Highest physical address first.
    Reverse,
}

/// The physical and virtual load addresses of the kernel image.
#[derive(Clone, Copy, Debug)]
pub struct KernelBaseAddress {
    pub physical: PhysicalAddress,
    pub virt: VirtualAddress,
}

/// Everything the memory core needs from the boot environment.
pub trait BootInformation {
    type MemoryRegions<'a>: Iterator<Item = BootMemoryRegion>
    where
        Self: 'a;

    /// The boot memory map, walked in the given direction.
    /// Entries are non-overlapping and sorted by physical address.
    fn memory_map(&self, direction: MapDirection) -> Self::MemoryRegions<'_>;

    /// The virtual base at which the boot environment mapped all of
    /// physical memory.
    fn direct_map_address(&self) -> VirtualAddress;

    /// Where the kernel image was loaded.
    fn kernel_base_address(&self) -> KernelBaseAddress;

    /// The address of the ACPI RSDP, if the platform provided one.
    fn rsdp(&self) -> Option<PhysicalAddress>;
}
