//! Boundary tags and the global tag pool.
//!
//! Every arena segment (span marker, free range, allocated range) is
//! described by one [`Tag`]. Tags are never heap-allocated by the arena
//! itself: they come from a global pool seeded with static storage, which
//! the kernel heap tops up once it is live (the heap sits on arenas, so
//! the arena cannot sit on the heap).

use core::cell::UnsafeCell;
use core::ptr;
use kernel_config::memory::STATIC_BOUNDARY_TAGS;
use spin::{Mutex, Once};

/// What a tag describes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum TagKind {
    /// Marks the start of a span; carries the span's full extent.
    Span { imported: bool },
    /// A free segment within a span.
    Free,
    /// An allocated segment within a span.
    Allocated,
}

/// One boundary tag.
///
/// `seg_prev`/`seg_next` chain every tag of an arena in address order;
/// `chain_prev`/`chain_next` chain a tag into exactly one of the arena's
/// freelist buckets (free segments) or its allocation hash (allocated
/// segments). Span markers sit in neither chain.
pub struct Tag {
    pub(crate) base: usize,
    pub(crate) len: usize,
    pub(crate) kind: TagKind,
    pub(crate) seg_prev: *mut Tag,
    pub(crate) seg_next: *mut Tag,
    pub(crate) chain_prev: *mut Tag,
    pub(crate) chain_next: *mut Tag,
}

impl Tag {
    /// An inert tag, the state of pool storage before first use.
    pub const fn empty() -> Tag {
        Tag {
            base: 0,
            len: 0,
            kind: TagKind::Free,
            seg_prev: ptr::null_mut(),
            seg_next: ptr::null_mut(),
            chain_prev: ptr::null_mut(),
            chain_next: ptr::null_mut(),
        }
    }
}

impl Default for Tag {
    fn default() -> Tag {
        Tag::empty()
    }
}

// Tags only move between the pool and arenas, always behind a lock.
unsafe impl Send for Tag {}

struct TagPool {
    /// Free tags, singly chained through `chain_next`.
    head: *mut Tag,
    available: usize,
}

unsafe impl Send for TagPool {}

static TAG_POOL: Mutex<TagPool> = Mutex::new(TagPool {
    head: ptr::null_mut(),
    available: 0,
});

struct StaticTagStorage(UnsafeCell<[Tag; STATIC_BOUNDARY_TAGS]>);

// Accessed exactly once, under the seeding Once.
unsafe impl Sync for StaticTagStorage {}

static STATIC_TAGS: StaticTagStorage = StaticTagStorage(UnsafeCell::new({
    const EMPTY: Tag = Tag::empty();
    [EMPTY; STATIC_BOUNDARY_TAGS]
}));

static SEED: Once<()> = Once::new();

fn ensure_seeded() {
    SEED.call_once(|| {
        let tags: &'static mut [Tag; STATIC_BOUNDARY_TAGS] =
            unsafe { &mut *STATIC_TAGS.0.get() };
        let mut pool = TAG_POOL.lock();
        for tag in tags.iter_mut() {
            tag.chain_next = pool.head;
            pool.head = tag;
            pool.available += 1;
        }
    });
}

/// Donates additional tag storage to the pool. The kernel heap calls this
/// once its own caches are live, so arenas never run the static pool dry.
pub fn provide_tag_storage(tags: &'static mut [Tag]) {
    ensure_seeded();
    let mut pool = TAG_POOL.lock();
    for tag in tags.iter_mut() {
        tag.chain_next = pool.head;
        pool.head = tag;
        pool.available += 1;
    }
}

/// How many tags the pool currently holds.
pub fn available_tags() -> usize {
    ensure_seeded();
    TAG_POOL.lock().available
}

/// Takes one tag out of the pool, initialized to the given shape.
///
/// Panics when the pool is empty: an arena that cannot describe its own
/// segments cannot make progress, and recovery at this level is impossible.
pub(crate) fn alloc_tag(base: usize, len: usize, kind: TagKind) -> *mut Tag {
    ensure_seeded();
    let mut pool = TAG_POOL.lock();
    let tag_ptr = pool.head;
    assert!(
        !tag_ptr.is_null(),
        "resource arena ran out of boundary tags ({} static)",
        STATIC_BOUNDARY_TAGS,
    );
    let tag = unsafe { &mut *tag_ptr };
    pool.head = tag.chain_next;
    pool.available -= 1;
    drop(pool);

    tag.base = base;
    tag.len = len;
    tag.kind = kind;
    tag.seg_prev = ptr::null_mut();
    tag.seg_next = ptr::null_mut();
    tag.chain_prev = ptr::null_mut();
    tag.chain_next = ptr::null_mut();
    tag_ptr
}

/// Returns a tag to the pool.
pub(crate) fn free_tag(tag_ptr: *mut Tag) {
    let mut pool = TAG_POOL.lock();
    let tag = unsafe { &mut *tag_ptr };
    tag.chain_next = pool.head;
    pool.head = tag_ptr;
    pool.available += 1;
}
