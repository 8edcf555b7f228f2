//! A throwaway bump allocator over the boot memory map.
//!
//! This is the only source of physical frames between kernel entry and the
//! point where the page descriptor table and the real frame allocator are
//! live. It can only ever hand frames out; it is torn down by giving every
//! still-unconsumed frame to the real allocator's free list.

#![no_std]

use boot_info::{BootInformation, BootMemoryType, MapDirection};
use kernel_config::memory::MAX_BOOTSTRAP_REGIONS;
use log::debug;
use memory_structs::{Frame, FrameRange};

/// One free entry of the boot memory map, with a bump cursor.
#[derive(Clone, Copy, Debug)]
struct FreePhysicalRegion {
    start_frame: Frame,
    /// Frames below this offset have been handed out.
    first_free_frame_index: u32,
    frame_count: u32,
}

/// The boot-time bump allocator. Write-once: frames leave and never return.
pub struct BootstrapAllocator {
    regions: [Option<FreePhysicalRegion>; MAX_BOOTSTRAP_REGIONS],
    region_count: usize,
}

impl BootstrapAllocator {
    /// Builds the allocator from the free entries of the boot memory map.
    ///
    /// Panics if the map has more than [`MAX_BOOTSTRAP_REGIONS`] free
    /// entries; such a map indicates a broken boot environment.
    pub fn new<B: BootInformation>(boot_info: &B) -> BootstrapAllocator {
        let mut regions: [Option<FreePhysicalRegion>; MAX_BOOTSTRAP_REGIONS] =
            [None; MAX_BOOTSTRAP_REGIONS];
        let mut region_count = 0;

        for entry in boot_info.memory_map(MapDirection::Forward) {
            if entry.typ != BootMemoryType::Free {
                continue;
            }
            let range = FrameRange::from_base_address(entry.range.start, entry.range.size);
            if range.is_empty() {
                continue;
            }
            assert!(
                region_count < MAX_BOOTSTRAP_REGIONS,
                "boot memory map has more than {} free regions",
                MAX_BOOTSTRAP_REGIONS,
            );
            debug!("bootstrap allocator: adding free region {:?}", range);
            regions[region_count] = Some(FreePhysicalRegion {
                start_frame: range.start(),
                first_free_frame_index: 0,
                frame_count: range.size_in_frames() as u32,
            });
            region_count += 1;
        }

        BootstrapAllocator {
            regions,
            region_count,
        }
    }

    /// Hands out the next free frame.
    ///
    /// Panics when no frames remain: running out of physical memory during
    /// early boot is unrecoverable.
    pub fn allocate(&mut self) -> Frame {
        for region in self.regions[..self.region_count].iter_mut().flatten() {
            if region.first_free_frame_index < region.frame_count {
                let frame = region.start_frame + region.first_free_frame_index;
                region.first_free_frame_index += 1;
                return frame;
            }
        }
        panic!("bootstrap allocator exhausted all physical memory");
    }

    /// Hands out `count` physically contiguous frames, returning the first.
    ///
    /// Panics when no single region has that many frames left.
    pub fn allocate_contiguous(&mut self, count: usize) -> Frame {
        assert!(count > 0);
        for region in self.regions[..self.region_count].iter_mut().flatten() {
            let remaining = region.frame_count - region.first_free_frame_index;
            if remaining as usize >= count {
                let frame = region.start_frame + region.first_free_frame_index;
                region.first_free_frame_index += count as u32;
                return frame;
            }
        }
        panic!("bootstrap allocator cannot provide {count} contiguous frames");
    }

    /// The bootstrap allocator cannot take frames back; it is torn down
    /// wholesale once the real allocator is constructed.
    pub fn deallocate(&mut self, frame: Frame) {
        panic!("cannot deallocate {frame:?}: the bootstrap allocator is write-once");
    }

    /// How many frames this allocator has handed out so far.
    pub fn consumed_frame_count(&self) -> usize {
        self.regions[..self.region_count]
            .iter()
            .flatten()
            .map(|region| region.first_free_frame_index as usize)
            .sum()
    }

    /// The frames this allocator has handed out, one range per region.
    /// Used at teardown to mark those frames as in use.
    pub fn consumed_frames(&self) -> impl Iterator<Item = FrameRange> + '_ {
        self.regions[..self.region_count]
            .iter()
            .flatten()
            .filter(|region| region.first_free_frame_index > 0)
            .map(|region| {
                FrameRange::new(
                    region.start_frame,
                    region.start_frame + (region.first_free_frame_index - 1),
                )
            })
    }

    /// The frames this allocator never handed out, one range per region.
    /// At teardown these seed the real allocator's free list.
    pub fn unconsumed_frames(&self) -> impl Iterator<Item = FrameRange> + '_ {
        self.regions[..self.region_count]
            .iter()
            .flatten()
            .filter(|region| region.first_free_frame_index < region.frame_count)
            .map(|region| {
                FrameRange::new(
                    region.start_frame + region.first_free_frame_index,
                    region.start_frame + (region.frame_count - 1),
                )
            })
    }
}

#[cfg(test)]
mod test;
