//! Range-level mapping operations over one page table, batched with the
//! flush protocol.

use crate::arch::{ArchPageTableOps, BackingDecision, TopLevelDecision};
use crate::{arch_ops, MapError};
use core::fmt;
use memory_structs::{
    FlushTarget, Frame, FrameRange, MapType, Page, PageRange, PhysicalAddress, VirtualRangeBatch,
};
use page_descriptors::FrameList;
use spin::Mutex;

/// A top-level page table plus the mutex serializing changes to it.
///
/// The mutex guards the table structure only; it is deliberately separate
/// from any allocator lock so that holding it does not serialize arena
/// bookkeeping.
pub struct PageTable {
    root: PhysicalAddress,
    lock: Mutex<()>,
}

impl PageTable {
    /// Wraps the table whose top level lives in the frame at `root`.
    pub fn new(root: PhysicalAddress) -> PageTable {
        PageTable {
            root,
            lock: Mutex::new(()),
        }
    }

    /// The physical address of the table's top level.
    pub fn root(&self) -> PhysicalAddress {
        self.root
    }

    /// Installs a single mapping.
    pub fn map_single_page(
        &self,
        page: Page,
        frame: Frame,
        map_type: MapType,
    ) -> Result<(), MapError> {
        let arch = arch_ops();
        let _guard = self.lock.lock();
        arch.map_single_page(self.root, page, frame, map_type)
    }

    /// Maps every page of `range` to a freshly allocated physical frame.
    ///
    /// On any failure the pages already installed are unmapped and their
    /// frames reclaimed, so the operation is all-or-nothing. New mappings
    /// need no shootdown of their own; `flush_target` scopes the flush of
    /// a failed attempt's unwind.
    pub fn map_range_and_back_with_physical_frames(
        &self,
        range: PageRange,
        map_type: MapType,
        flush_target: FlushTarget,
        top_level: TopLevelDecision,
    ) -> Result<(), MapError> {
        let arch = arch_ops();
        let _guard = self.lock.lock();
        let mut mapped = 0usize;
        for page in range.iter() {
            let result = frame_allocator::allocate_frame()
                .map_err(MapError::from)
                .and_then(|frame| {
                    arch.map_single_page(self.root, page, frame, map_type)
                        .map_err(|error| {
                            // The frame never made it into the table.
                            let mut lost = FrameList::new();
                            let table = frame_allocator::get()
                                .expect("mapping before the frame allocator is live")
                                .table();
                            lost.push_frame(frame, table);
                            frame_allocator::deallocate_frames(lost);
                            error
                        })
                });
            if let Err(error) = result {
                self.unwind_mapped(
                    arch,
                    range,
                    mapped,
                    flush_target,
                    BackingDecision::Free,
                    top_level,
                );
                return Err(error);
            }
            mapped += 1;
        }
        Ok(())
    }

    /// Maps `pages` to the caller-supplied `frames`, which must be the
    /// same length. The caller keeps ownership of the frames.
    pub fn map_range_to_physical_range(
        &self,
        pages: PageRange,
        frames: FrameRange,
        map_type: MapType,
        flush_target: FlushTarget,
        top_level: TopLevelDecision,
    ) -> Result<(), MapError> {
        if pages.size_in_pages() != frames.size_in_frames() {
            return Err(MapError::MappingNotValid);
        }
        let arch = arch_ops();
        let _guard = self.lock.lock();
        let mut mapped = 0usize;
        for (page, frame) in pages.iter().zip(frames.iter()) {
            if let Err(error) = arch.map_single_page(self.root, page, frame, map_type) {
                self.unwind_mapped(
                    arch,
                    pages,
                    mapped,
                    flush_target,
                    BackingDecision::Keep,
                    top_level,
                );
                return Err(error);
            }
            mapped += 1;
        }
        Ok(())
    }

    /// Unmaps every range in `batch`, reclaiming backing frames per
    /// `backing`, and ships coalesced flush notifications through the
    /// shootdown protocol.
    pub fn unmap(
        &self,
        batch: &VirtualRangeBatch,
        flush_target: FlushTarget,
        backing: BackingDecision,
        top_level: TopLevelDecision,
    ) -> Result<(), MapError> {
        let arch = arch_ops();
        let _guard = self.lock.lock();
        self.unmap_ranges_locked(arch, batch.as_slice(), flush_target, backing, top_level)
    }

    /// Rewrites the attributes of the present mappings in each range.
    /// Absent entries are skipped silently; the count of pages actually
    /// updated is returned so callers who expected full coverage can tell.
    ///
    /// Each entry carries the range's previous attributes; a flush is
    /// shipped only for transitions that tighten access or change cache
    /// attributes.
    pub fn change_protection(
        &self,
        changes: &[(PageRange, MapType)],
        new_type: MapType,
        flush_target: FlushTarget,
    ) -> Result<usize, MapError> {
        let arch = arch_ops();
        let _guard = self.lock.lock();
        let mut flush_batch = VirtualRangeBatch::new();
        let mut updated = 0usize;
        let mut failure = None;

        'outer: for (range, previous) in changes {
            for page in range.iter() {
                match arch.update_single_page(self.root, page, new_type) {
                    Ok(true) => updated += 1,
                    Ok(false) => {}
                    Err(error) => {
                        failure = Some(error);
                        break 'outer;
                    }
                }
            }
            if previous.change_requires_flush(&new_type) {
                if flush_batch.is_full() {
                    tlb_shootdown::submit_and_wait(&flush_batch, flush_target);
                    flush_batch.clear();
                }
                flush_batch.append(*range);
            }
        }

        if !flush_batch.is_empty() {
            tlb_shootdown::submit_and_wait(&flush_batch, flush_target);
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(updated),
        }
    }

    /// Pre-allocates the top-level entries covering `range`.
    pub fn fill_top_level(&self, range: PageRange) -> Result<(), MapError> {
        let arch = arch_ops();
        let _guard = self.lock.lock();
        arch.fill_top_level(self.root, range)
    }

    /// Init-time bulk mapping with large pages; see
    /// [`ArchPageTableOps::map_to_physical_range_all_page_sizes`].
    pub fn map_to_physical_range_all_page_sizes(
        &self,
        pages: PageRange,
        frames: FrameRange,
        map_type: MapType,
    ) -> Result<(), MapError> {
        let arch = arch_ops();
        let _guard = self.lock.lock();
        arch.map_to_physical_range_all_page_sizes(self.root, pages, frames, map_type)
    }

    /// The core unmap walk. Caller holds the table lock.
    fn unmap_ranges_locked(
        &self,
        arch: &'static dyn ArchPageTableOps,
        ranges: &[PageRange],
        flush_target: FlushTarget,
        backing: BackingDecision,
        top_level: TopLevelDecision,
    ) -> Result<(), MapError> {
        let mut flush_batch = VirtualRangeBatch::new();
        let mut freed = FrameList::new();
        let mut failure = None;

        'outer: for range in ranges {
            for page in range.iter() {
                match arch.unmap_single_page(self.root, page, backing, top_level) {
                    Ok(frame) => {
                        if backing == BackingDecision::Free {
                            let table = frame_allocator::get()
                                .expect("unmapping before the frame allocator is live")
                                .table();
                            freed.push_frame(frame, table);
                        }
                    }
                    Err(error) => {
                        failure = Some(error);
                        break 'outer;
                    }
                }
            }
            if flush_batch.is_full() {
                tlb_shootdown::submit_and_wait(&flush_batch, flush_target);
                flush_batch.clear();
            }
            flush_batch.append(*range);
        }

        // Even a failed walk must flush what it tore down and reclaim the
        // frames it collected.
        if !flush_batch.is_empty() {
            tlb_shootdown::submit_and_wait(&flush_batch, flush_target);
        }
        if !freed.is_empty() {
            frame_allocator::deallocate_frames(freed);
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Unwinds the first `mapped` pages of `range` after a failed map.
    fn unwind_mapped(
        &self,
        arch: &'static dyn ArchPageTableOps,
        range: PageRange,
        mapped: usize,
        flush_target: FlushTarget,
        backing: BackingDecision,
        top_level: TopLevelDecision,
    ) {
        if mapped == 0 {
            return;
        }
        let sub = PageRange::new(range.start(), range.start() + (mapped - 1));
        if let Err(error) =
            self.unmap_ranges_locked(arch, &[sub], flush_target, backing, top_level)
        {
            panic!("failed to unwind a partial mapping of {sub:?}: {error:?}");
        }
    }
}

impl fmt::Debug for PageTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PageTable(root: {:?})", self.root)
    }
}
