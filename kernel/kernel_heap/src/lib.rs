//! The kernel heap: three stacked resource arenas over the frame
//! allocator and the mapping engine.
//!
//! 1. `heap_address_space`: page-quantum, no source, seeded with the
//!    kernel-heap region's virtual range. Hands out address space only.
//! 2. `heap_pages`: page-quantum, imports from the address-space arena
//!    through a custom source that also backs the imported span with
//!    freshly allocated frames and maps it read/write-kernel. Releasing
//!    unmaps and reclaims the frames.
//! 3. `heap_objects`: 16-byte quantum, imports pages from `heap_pages`,
//!    with quantum caches for every size class up to 512 bytes. This is
//!    the arena the generic allocation interface sits on.
//!
//! Two free variants exist: the sized free, where the caller passes the
//! length back, and the non-sized C free, where a C-readable
//! [`Allocation`] header is prepended to each allocation so `free(ptr)`
//! can find its receipt. The C pair exists for the ACPI runtime.
//!
//! The special heap is a sibling: a single arena over the special-heap
//! region with no backing import; callers bring their own physical range
//! (device BARs, MMIO) and attributes.
//!
//! This crate also provides the standard [`SlabBacking`] implementations
//! and feeds the resource arenas' boundary-tag pool from a slab cache
//! once the heap is live.

#![no_std]


use core::fmt;
use core::mem::size_of;
use core::ptr::{self, NonNull};
use kernel_config::memory::{
    HEAP_OBJECT_QUANTUM, HEAP_QUANTUM_CACHE_MAX, PAGE_SIZE, STATIC_BOUNDARY_TAGS,
};
use log::{debug, info};
use memory::{BackingDecision, MapError, PageTable, TopLevelDecision};
use memory_structs::{
    FlushTarget, Frame, FrameRange, MapType, PageRange, PhysicalAddress, PhysicalAddressRange,
    VirtualAddress, VirtualAddressRange, VirtualRangeBatch,
};
use page_descriptors::FrameList;
use resource_arena::{
    AllocPolicy, Allocation, Arena, ArenaError, SpanSource, Tag,
};
use slab_cache::{LastSlabPolicy, ObjectCache, SlabBacking, SlabError};
use spin::Once;
use static_assertions::const_assert_eq;

// The non-sized-free header must stay pointer-math compatible with the
// object arena's quantum.
const_assert_eq!(core::mem::size_of::<Allocation>(), HEAP_OBJECT_QUANTUM);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HeapError {
    /// The arena stack could not satisfy the request.
    OutOfMemory,
    /// The caller asked for zero bytes.
    ZeroLength,
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HeapError::OutOfMemory => write!(f, "kernel heap is out of memory"),
            HeapError::ZeroLength => write!(f, "zero-length heap request"),
        }
    }
}

fn map_arena_error(error: ArenaError) -> HeapError {
    match error {
        ArenaError::ZeroLength => HeapError::ZeroLength,
        ArenaError::RequestedLengthUnavailable => HeapError::OutOfMemory,
    }
}

/// The source behind the heap page arena: address space from the arena
/// below, backing frames from the frame allocator, mappings through the
/// kernel page table.
struct MappedSpanSource {
    address_space: &'static Arena,
    page_table: &'static PageTable,
}

impl SpanSource for MappedSpanSource {
    fn import(&self, len: usize, policy: AllocPolicy) -> Result<Allocation, ArenaError> {
        let span = self.address_space.allocate(len, policy)?;
        let range = PageRange::from_virt_addr(VirtualAddress::new(span.base()), span.len());
        match self.page_table.map_range_and_back_with_physical_frames(
            range,
            MapType::kernel_read_write(),
            FlushTarget::Kernel,
            TopLevelDecision::Keep,
        ) {
            Ok(()) => {
                #[cfg(debug_assertions)]
                unsafe {
                    ptr::write_bytes(
                        span.base() as *mut u8,
                        kernel_config::memory::HEAP_POISON_BYTE,
                        span.len(),
                    );
                }
                Ok(span)
            }
            Err(MapError::AlreadyMapped) => {
                panic!("heap import found an existing mapping at {:#X}", span.base())
            }
            Err(_) => {
                self.address_space.deallocate(span);
                Err(ArenaError::RequestedLengthUnavailable)
            }
        }
    }

    fn release(&self, span: Allocation) {
        let range = PageRange::from_virt_addr(VirtualAddress::new(span.base()), span.len());
        let batch = VirtualRangeBatch::with_range(range);
        self.page_table
            .unmap(
                &batch,
                FlushTarget::Kernel,
                BackingDecision::Free,
                TopLevelDecision::Keep,
            )
            .unwrap_or_else(|error| {
                panic!("failed to unmap heap span {:#X}: {error}", span.base())
            });
        self.address_space.deallocate(span);
    }
}

/// The generic kernel allocation interface over the object arena.
pub struct Heap {
    address_space_arena: &'static Arena,
    page_arena: &'static Arena,
    object_arena: &'static Arena,
}

impl Heap {
    /// Allocates `len` bytes.
    ///
    /// Panics on alignments above the object quantum (16): the heap does
    /// not support them, and silently misaligning is worse than halting.
    pub fn alloc(&self, len: usize, align: usize) -> Result<NonNull<u8>, HeapError> {
        assert!(
            align <= HEAP_OBJECT_QUANTUM,
            "kernel heap cannot align to {align} (maximum {HEAP_OBJECT_QUANTUM})",
        );
        let allocation = self
            .object_arena
            .allocate(len, AllocPolicy::InstantFit)
            .map_err(map_arena_error)?;
        Ok(NonNull::new(allocation.base() as *mut u8).unwrap())
    }

    /// The sized free: the caller passes the allocation's length back.
    pub fn free_sized(&self, item: NonNull<u8>, len: usize) {
        self.object_arena
            .deallocate(Allocation::from_raw_parts(item.as_ptr() as usize, len));
    }

    /// Attempts to grow or shrink an allocation in place. Returns whether
    /// the existing block can hold `new_len`.
    pub fn resize(&self, _item: NonNull<u8>, old_len: usize, new_len: usize) -> bool {
        round_up_quantum(new_len) == round_up_quantum(old_len)
    }

    /// Moves an allocation to a new length, copying the common prefix.
    pub fn remap(
        &self,
        item: NonNull<u8>,
        old_len: usize,
        new_len: usize,
    ) -> Result<NonNull<u8>, HeapError> {
        if self.resize(item, old_len, new_len) {
            return Ok(item);
        }
        let new = self.alloc(new_len, HEAP_OBJECT_QUANTUM)?;
        let copy_len = if old_len < new_len { old_len } else { new_len };
        unsafe { ptr::copy_nonoverlapping(item.as_ptr(), new.as_ptr(), copy_len) };
        self.free_sized(item, old_len);
        Ok(new)
    }

    pub fn address_space_arena(&self) -> &'static Arena {
        self.address_space_arena
    }

    pub fn page_arena(&self) -> &'static Arena {
        self.page_arena
    }

    pub fn object_arena(&self) -> &'static Arena {
        self.object_arena
    }
}

fn round_up_quantum(len: usize) -> usize {
    ((len + HEAP_OBJECT_QUANTUM - 1) / HEAP_OBJECT_QUANTUM) * HEAP_OBJECT_QUANTUM
}

static HEAP_ADDRESS_SPACE_ARENA: Once<Arena> = Once::new();
static HEAP_PAGE_SOURCE: Once<MappedSpanSource> = Once::new();
static HEAP_PAGE_ARENA: Once<Arena> = Once::new();
static HEAP_OBJECT_ARENA: Once<Arena> = Once::new();
static HEAP: Once<Heap> = Once::new();

static TAG_BACKING: Once<HeapPageBacking> = Once::new();
static TAG_CACHE: Once<ObjectCache<[Tag; 8]>> = Once::new();

/// Builds the three-arena stack over the kernel-heap region and wires the
/// boundary-tag cache. Called once, after [`memory::init`].
pub fn init(
    heap_region: VirtualAddressRange,
    page_table: &'static PageTable,
) -> Result<&'static Heap, &'static str> {
    if HEAP.is_completed() {
        return Err("kernel heap was already initialized");
    }

    let address_space =
        HEAP_ADDRESS_SPACE_ARENA.call_once(|| Arena::new("heap_address_space", PAGE_SIZE));
    address_space.add_span(heap_region.start.value(), heap_region.size)?;

    let source = HEAP_PAGE_SOURCE.call_once(|| MappedSpanSource {
        address_space,
        page_table,
    });
    let page_arena = HEAP_PAGE_ARENA.call_once(|| Arena::with_source("heap_pages", PAGE_SIZE, source));
    let object_arena = HEAP_OBJECT_ARENA.call_once(|| {
        Arena::with_source("heap_objects", HEAP_OBJECT_QUANTUM, page_arena)
            .with_quantum_caches(HEAP_QUANTUM_CACHE_MAX)
    });

    let heap = HEAP.call_once(|| Heap {
        address_space_arena: address_space,
        page_arena,
        object_arena,
    });

    // With the page arena live, arenas no longer have to survive on the
    // static boundary-tag pool alone.
    let backing = TAG_BACKING.call_once(|| HeapPageBacking::new(page_arena));
    TAG_CACHE.call_once(|| ObjectCache::new("boundary_tags", LastSlabPolicy::Keep, backing));
    replenish_boundary_tags()?;

    info!(
        "kernel heap initialized over {:?} ({} MiB)",
        heap_region.start,
        heap_region.size / (1024 * 1024),
    );
    Ok(heap)
}

/// The kernel heap, or `None` before [`init`].
pub fn get() -> Option<&'static Heap> {
    HEAP.get()
}

/// The kernel heap.
///
/// Panics before [`init`].
pub fn heap() -> &'static Heap {
    get().expect("kernel heap used before init")
}

/// Tops the boundary-tag pool back up from the tag cache. Cheap when the
/// pool is already healthy; the kernel calls this from its maintenance
/// path.
pub fn replenish_boundary_tags() -> Result<(), &'static str> {
    let cache = TAG_CACHE.get().ok_or("kernel heap not initialized")?;
    while resource_arena::available_tags() < STATIC_BOUNDARY_TAGS {
        let chunk = cache
            .allocate()
            .map_err(|_| "cannot grow the boundary tag pool")?;
        // Donated permanently; the pool owns the tags from here on.
        let tags: &'static mut [Tag] =
            unsafe { core::slice::from_raw_parts_mut(chunk.as_ptr().cast::<Tag>(), 8) };
        resource_arena::provide_tag_storage(tags);
        debug!("boundary tag pool refilled to {}", resource_arena::available_tags());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// The C-callable allocator pair (non-sized free), used by the ACPI runtime.
// ---------------------------------------------------------------------------

/// C `malloc`: prepends an [`Allocation`] header so the pointer alone is
/// enough to free. Returns null on failure or before heap init.
#[no_mangle]
pub extern "C" fn cascade_malloc(size: usize) -> *mut u8 {
    let heap = match get() {
        Some(heap) => heap,
        None => return ptr::null_mut(),
    };
    if size == 0 {
        return ptr::null_mut();
    }
    let allocation = match heap
        .object_arena
        .allocate(size + size_of::<Allocation>(), AllocPolicy::InstantFit)
    {
        Ok(allocation) => allocation,
        Err(_) => return ptr::null_mut(),
    };
    let base = allocation.base() as *mut Allocation;
    unsafe {
        base.write(allocation);
        base.add(1).cast::<u8>()
    }
}

/// C `free` for pointers from [`cascade_malloc`]. Ignores null.
#[no_mangle]
pub extern "C" fn cascade_free(item: *mut u8) {
    if item.is_null() {
        return;
    }
    let allocation = unsafe { item.cast::<Allocation>().sub(1).read() };
    heap().object_arena.deallocate(allocation);
}

/// C sized free, for callers that do track lengths. `size` is the size
/// originally passed to [`cascade_malloc`].
#[no_mangle]
pub extern "C" fn cascade_free_sized(item: *mut u8, size: usize) {
    if item.is_null() {
        return;
    }
    let base = unsafe { item.cast::<Allocation>().sub(1) };
    heap().object_arena.deallocate(Allocation::from_raw_parts(
        base as usize,
        size + size_of::<Allocation>(),
    ));
}

// ---------------------------------------------------------------------------
// Slab backings.
// ---------------------------------------------------------------------------

/// Slab memory out of the heap page arena.
pub struct HeapPageBacking {
    arena: &'static Arena,
}

impl HeapPageBacking {
    pub fn new(arena: &'static Arena) -> HeapPageBacking {
        HeapPageBacking { arena }
    }
}

impl SlabBacking for HeapPageBacking {
    fn acquire(&self, len: usize) -> Result<VirtualAddress, SlabError> {
        self.arena
            .allocate(len, AllocPolicy::InstantFit)
            .map(|allocation| VirtualAddress::new(allocation.base()))
            .map_err(|_| SlabError::BackingExhausted)
    }

    fn release(&self, base: VirtualAddress, len: usize) {
        self.arena
            .deallocate(Allocation::from_raw_parts(base.value(), len));
    }
}

/// Slab memory straight from the frame allocator, addressed through the
/// direct map. Single pages only, so restricted to small-item caches.
pub struct PmmBacking {
    direct_map_base: VirtualAddress,
}

impl PmmBacking {
    pub fn new(direct_map_base: VirtualAddress) -> PmmBacking {
        PmmBacking { direct_map_base }
    }
}

impl SlabBacking for PmmBacking {
    fn acquire(&self, len: usize) -> Result<VirtualAddress, SlabError> {
        assert_eq!(len, PAGE_SIZE);
        let frame = frame_allocator::allocate_frame().map_err(|_| SlabError::BackingExhausted)?;
        Ok(self.direct_map_base + frame.base_address().value())
    }

    fn release(&self, base: VirtualAddress, len: usize) {
        assert_eq!(len, PAGE_SIZE);
        let frame = Frame::from_address(PhysicalAddress::new(base - self.direct_map_base));
        let table = frame_allocator::get()
            .expect("slab release before the frame allocator is live")
            .table();
        let mut list = FrameList::new();
        list.push_frame(frame, table);
        frame_allocator::deallocate_frames(list);
    }

    fn single_page_only(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// The special heap.
// ---------------------------------------------------------------------------

/// Virtual address space for device memory: callers bring the physical
/// range and mapping attributes, the special heap brings the addresses.
pub struct SpecialHeap {
    arena: &'static Arena,
    page_table: &'static PageTable,
}

static SPECIAL_ARENA: Once<Arena> = Once::new();
static SPECIAL_HEAP: Once<SpecialHeap> = Once::new();

/// Builds the special heap over the special-heap region.
pub fn init_special(
    region: VirtualAddressRange,
    page_table: &'static PageTable,
) -> Result<&'static SpecialHeap, &'static str> {
    if SPECIAL_HEAP.is_completed() {
        return Err("special heap was already initialized");
    }
    let arena = SPECIAL_ARENA.call_once(|| Arena::new("special_heap", PAGE_SIZE));
    arena.add_span(region.start.value(), region.size)?;
    Ok(SPECIAL_HEAP.call_once(|| SpecialHeap { arena, page_table }))
}

/// The special heap.
///
/// Panics before [`init_special`].
pub fn special_heap() -> &'static SpecialHeap {
    SPECIAL_HEAP.get().expect("special heap used before init")
}

impl SpecialHeap {
    /// Maps `physical` (device memory the caller owns) at a fresh virtual
    /// range with the caller's attributes, returning that range.
    pub fn allocate_special(
        &self,
        size: usize,
        physical: PhysicalAddressRange,
        map_type: MapType,
    ) -> Result<VirtualAddressRange, &'static str> {
        assert!(physical.start.is_page_aligned());
        assert_eq!(physical.size, size);
        assert_eq!(size % PAGE_SIZE, 0);

        let span = self
            .arena
            .allocate(size, AllocPolicy::InstantFit)
            .map_err(|_| "special heap address space exhausted")?;
        let range = span.to_virtual_range();
        self.page_table
            .map_range_to_physical_range(
                PageRange::from_virt_addr(range.start, range.size),
                FrameRange::from_base_address(physical.start, physical.size),
                map_type,
                FlushTarget::Kernel,
                TopLevelDecision::Keep,
            )
            .map_err(|error| {
                self.arena.deallocate(span);
                log::error!("special heap mapping failed: {error}");
                "failed to map device memory"
            })?;
        Ok(range)
    }

    /// Tears down a mapping made by [`SpecialHeap::allocate_special`].
    /// The physical range stays with the caller.
    pub fn deallocate_special(&self, range: VirtualAddressRange) {
        let batch =
            VirtualRangeBatch::with_range(PageRange::from_virt_addr(range.start, range.size));
        self.page_table
            .unmap(
                &batch,
                FlushTarget::Kernel,
                BackingDecision::Keep,
                TopLevelDecision::Keep,
            )
            .unwrap_or_else(|error| {
                panic!("failed to unmap special heap range {:?}: {error}", range.start)
            });
        self.arena.deallocate(Allocation::from_virtual_range(range));
    }

    pub fn arena(&self) -> &'static Arena {
        self.arena
    }
}
