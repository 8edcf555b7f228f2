//! Classification of page faults that hit kernel memory.

use log::error;
use memory_layout::{MemoryLayout, RegionType};
use memory_structs::PageFaultDetails;

/// What the kernel should do about a fault in kernel space.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum KernelFaultDisposition {
    /// Unrecoverable; halt with diagnostics.
    Fatal(&'static str),
    /// The fault hit the named region; the owning subsystem decides.
    Region(RegionType),
}

/// Classifies a kernel-space fault against the memory layout.
///
/// Faults outside every known region, in the kernel image sections, or in
/// the direct map are unconditionally fatal: nothing in those regions is
/// ever legitimately unmapped or protection-restricted.
pub fn classify_kernel_page_fault(
    details: &PageFaultDetails,
    layout: &MemoryLayout,
) -> KernelFaultDisposition {
    match layout.containing_address(details.faulting_address) {
        None => KernelFaultDisposition::Fatal("kernel page fault outside all known regions"),
        Some(
            RegionType::WriteableSection
            | RegionType::ReadonlySection
            | RegionType::ExecutableSection
            | RegionType::DebugSection,
        ) => KernelFaultDisposition::Fatal("kernel page fault within a kernel image section"),
        Some(RegionType::DirectMap | RegionType::NonCachedDirectMap) => {
            KernelFaultDisposition::Fatal("kernel page fault within the direct map")
        }
        Some(region) => KernelFaultDisposition::Region(region),
    }
}

/// Logs full fault details and halts. The terminal path for every
/// [`KernelFaultDisposition::Fatal`] classification.
pub fn report_fatal_kernel_fault(details: &PageFaultDetails, reason: &'static str) -> ! {
    error!("{reason}: {details}");
    panic!("{reason}: {details}");
}
