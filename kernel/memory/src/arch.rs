//! The contract between the mapping engine and the architecture's paging
//! primitives. A concrete architecture crate implements these traits; the
//! engine never touches page-table entries itself.

use crate::MapError;
use memory_structs::{Frame, FrameRange, MapType, Page, PageRange, PhysicalAddress};

/// What to do with the physical frame backing an unmapped page.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BackingDecision {
    /// The caller owns the frame; leave it alone.
    Keep,
    /// The frame came from the frame allocator; reclaim it.
    Free,
}

/// What to do with page-table levels emptied (or touched) by an operation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TopLevelDecision {
    /// Keep intermediate tables for future mappings of the range.
    Keep,
    /// Free intermediate tables that became empty.
    Free,
    /// Do not even inspect intermediate tables.
    Nop,
}

/// The per-architecture paging primitives.
///
/// Implementations may allocate intermediate page-table frames from the
/// system frame allocator, which is live before the first mapping call.
pub trait ArchPageTableOps: Send + Sync {
    /// Installs a single mapping `page -> frame`.
    ///
    /// Returns [`MapError::AlreadyMapped`] if any mapping is present at
    /// `page`; overmapping is a logic bug, not a request.
    fn map_single_page(
        &self,
        root: PhysicalAddress,
        page: Page,
        frame: Frame,
        map_type: MapType,
    ) -> Result<(), MapError>;

    /// Removes the mapping at `page`, returning the frame it pointed to.
    ///
    /// Returns [`MapError::MappingNotValid`] if no mapping is present.
    fn unmap_single_page(
        &self,
        root: PhysicalAddress,
        page: Page,
        backing: BackingDecision,
        top_level: TopLevelDecision,
    ) -> Result<Frame, MapError>;

    /// Rewrites the attributes of the mapping at `page`, if one is
    /// present. Returns whether one was.
    fn update_single_page(
        &self,
        root: PhysicalAddress,
        page: Page,
        new_type: MapType,
    ) -> Result<bool, MapError>;

    /// The span of virtual address space one top-level table entry covers.
    fn size_of_top_level_entry(&self) -> usize;

    /// Pre-allocates the top-level entries covering `range`, so that page
    /// tables sharing this root agree on them forever after.
    fn fill_top_level(&self, root: PhysicalAddress, range: PageRange) -> Result<(), MapError>;

    /// Maps `pages` to `frames` using the largest page sizes that fit.
    /// Init-time only; no flushing is performed.
    fn map_to_physical_range_all_page_sizes(
        &self,
        root: PhysicalAddress,
        pages: PageRange,
        frames: FrameRange,
        map_type: MapType,
    ) -> Result<(), MapError>;
}
