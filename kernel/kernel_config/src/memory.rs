//! The memory constants that the Cascade kernel assumes.
//!
//! Current higher-half layout, from low to high:
//! * kernel ELF sections, at wherever the boot environment loaded them.
//! * the direct map of all physical memory, at the boot-supplied base.
//! * one top-level-entry-sized slot each for the kernel heap, the special
//!   (device) heap, kernel stacks, and the general kernel address space,
//!   assigned at init time to the first free gaps.
//! * the page descriptor array.

/// The lower 12 bits of a virtual address are the offset within a page.
pub const PAGE_SHIFT: usize = 12;
/// Page size is 4096 bytes, 4KiB pages.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// The largest page size any supported architecture can map (1 GiB).
/// The direct map is aligned up to this so it can use huge mappings.
pub const LARGEST_PAGE_SHIFT: usize = 30;
pub const LARGEST_PAGE_SIZE: usize = 1 << LARGEST_PAGE_SHIFT;

/// Start of the higher-half virtual address range that belongs to the kernel.
pub const HIGHER_HALF_START: usize = 0xFFFF_8000_0000_0000;

/// Value: 512 GiB. The span covered by one top-level page table entry.
pub const ADDRESSABILITY_PER_TOP_LEVEL_ENTRY: usize = 1 << (PAGE_SHIFT + 27);

/// The minimum size of the direct map, regardless of how little RAM exists.
pub const DIRECT_MAP_MINIMUM_SIZE: usize = 4 * 1024 * 1024 * 1024;

/// The maximum number of executors (logical CPUs) the kernel supports.
pub const MAX_CPUS: usize = 64;

/// The bootstrap allocator refuses boot memory maps with more free entries
/// than this; such maps indicate a broken boot environment.
pub const MAX_BOOTSTRAP_REGIONS: usize = 64;

/// The maximum number of contiguous usable physical regions tracked by the
/// page descriptor table.
pub const MAX_PAGE_REGIONS: usize = 64;

/// How many ranges a flush batch can carry before it must be shipped
/// through the TLB shootdown protocol (or force-merged).
pub const FLUSH_BATCH_CAPACITY: usize = 16;

/// Two ranges whose gap is at most this many bytes are merged into one
/// flush entry; over-flushing a small gap is cheaper than a second IPI.
pub const FLUSH_BATCH_MERGE_SLACK: usize = 2 * PAGE_SIZE;

/// The minimum allocation granularity of the kernel heap's object arena.
pub const HEAP_OBJECT_QUANTUM: usize = 16;

/// Object-arena allocations at or below this size are served from
/// per-size-class quantum caches.
pub const HEAP_QUANTUM_CACHE_MAX: usize = 512;

/// How many pre-formed allocations one quantum-cache size class retains.
pub const QUANTUM_CACHE_MAGAZINE_CAPACITY: usize = 16;

/// The largest number of size classes any arena's quantum caching can use.
pub const MAX_QUANTUM_CACHE_CLASSES: usize = 32;

/// Power-of-two freelist buckets per resource arena. One per bit of `usize`.
pub const ARENA_FREELIST_BUCKETS: usize = usize::BITS as usize;

/// Buckets in each arena's allocation hash index.
pub const ARENA_HASH_BUCKETS: usize = 64;

/// Boundary tags available before the kernel heap can refill the tag pool.
pub const STATIC_BOUNDARY_TAGS: usize = 128;

/// Items per slab for large-item caches (small-item caches pack as many
/// items as fit in one page).
pub const LARGE_ITEMS_PER_SLAB: usize = 8;

/// Debug builds fill freshly allocated frames with this byte.
pub const FRAME_POISON_BYTE: u8 = 0xF7;

/// Debug builds fill freshly imported heap pages with this byte.
pub const HEAP_POISON_BYTE: u8 = 0xD9;
