//! A general-purpose resource arena: a range allocator with a configurable
//! minimum granularity (the quantum), power-of-two freelists, an allocation
//! hash, optional per-size-class quantum caches, and optional chaining to a
//! source arena through import/release callbacks.
//!
//! Arenas allocate *ranges of numbers*; most arenas in the kernel manage
//! virtual address ranges, but nothing here assumes that. The kernel heap
//! stacks three of these (address space -> mapped pages -> objects), and the
//! special heap and kernel address space are single arenas.
//!
//! Every byte of an arena's universe is covered by exactly one boundary
//! tag; adjacent free tags are coalesced on release; a span imported from a
//! source is returned to it only once the span is entirely free again, in
//! exactly the shape it was imported.
//!
//! Locking: one mutex per arena guards the tag structures. Each quantum
//! cache class has its own lock. The arena lock is *never* held across a
//! call into the source, so a source arena (or a mapping-backed import) can
//! take its own locks freely.

#![no_std]

mod tag;

#[cfg(test)]
mod test;

pub use tag::{available_tags, provide_tag_storage, Tag};

use core::fmt;
use kernel_config::memory::{
    ARENA_FREELIST_BUCKETS, ARENA_HASH_BUCKETS, MAX_QUANTUM_CACHE_CLASSES,
    QUANTUM_CACHE_MAGAZINE_CAPACITY,
};
use memory_structs::{VirtualAddress, VirtualAddressRange};
use spin::Mutex;
use static_assertions::assert_eq_size;
use tag::{alloc_tag, free_tag, TagKind};

/// An opaque receipt for one arena allocation. The caller must present it
/// unchanged on free.
///
/// The layout is C-visible because the kernel heap's non-sized-free path
/// prepends one of these to each C allocation.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Allocation {
    base: u64,
    len: usize,
}

assert_eq_size!(Allocation, [u8; 16]);

impl Allocation {
    /// Reconstructs a receipt from its raw parts. Only for callers that
    /// stored a receipt in a C-visible place (the heap's free header);
    /// fabricating receipts is a logic bug the arena will panic on.
    pub fn from_raw_parts(base: usize, len: usize) -> Allocation {
        Allocation {
            base: base as u64,
            len,
        }
    }

    pub fn base(&self) -> usize {
        self.base as usize
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Lossless view of this allocation as a virtual address range.
    pub fn to_virtual_range(&self) -> VirtualAddressRange {
        VirtualAddressRange::new(VirtualAddress::new(self.base as usize), self.len)
    }

    pub fn from_virtual_range(range: VirtualAddressRange) -> Allocation {
        Allocation {
            base: range.start.value() as u64,
            len: range.size,
        }
    }
}

/// How an arena picks among fitting free segments.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AllocPolicy {
    /// The tightest fit, scanning the smallest matching size bucket.
    BestFit,
    /// The first segment from a bucket guaranteed to fit; O(1).
    InstantFit,
    /// Continue scanning from wherever the previous allocation ended.
    NextFit,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ArenaError {
    /// The caller asked for zero bytes.
    ZeroLength,
    /// Nothing fits and the source (if any) could not help either.
    RequestedLengthUnavailable,
}

impl fmt::Display for ArenaError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ArenaError::ZeroLength => write!(f, "zero-length arena request"),
            ArenaError::RequestedLengthUnavailable => {
                write!(f, "no arena range of the requested length is available")
            }
        }
    }
}

/// Where an arena gets spans when its own freelists run dry, and where it
/// returns them once they are entirely free again.
///
/// A source arena itself is a `SpanSource` (import forwards to `allocate`,
/// release to `deallocate`); the heap's page arena overrides both to also
/// install and tear down page-table mappings.
pub trait SpanSource: Send + Sync {
    fn import(&self, len: usize, policy: AllocPolicy) -> Result<Allocation, ArenaError>;
    fn release(&self, span: Allocation);
}

/// A snapshot of an arena's bookkeeping, for diagnostics and tests.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct ArenaStats {
    pub total: usize,
    pub free: usize,
    pub spans: usize,
    pub allocations: usize,
    pub free_segments: usize,
}

struct ArenaInner {
    /// Every tag of this arena, in address order. Span markers precede
    /// their segments.
    seg_head: *mut Tag,
    /// Free segments bucketed by floor(log2(len)).
    free_lists: [*mut Tag; ARENA_FREELIST_BUCKETS],
    /// Allocated segments, hashed by base.
    alloc_hash: [*mut Tag; ARENA_HASH_BUCKETS],
    /// Where `NextFit` resumes scanning.
    next_fit_cursor: usize,
    quantum: usize,
    total: usize,
    free: usize,
    span_count: usize,
    free_segment_count: usize,
    allocated_count: usize,
}

unsafe impl Send for ArenaInner {}

fn bucket_of(len: usize) -> usize {
    debug_assert!(len > 0);
    (usize::BITS - 1 - len.leading_zeros()) as usize
}

fn round_up(len: usize, quantum: usize) -> usize {
    ((len + quantum - 1) / quantum) * quantum
}

impl ArenaInner {
    fn new(quantum: usize) -> ArenaInner {
        ArenaInner {
            seg_head: core::ptr::null_mut(),
            free_lists: [core::ptr::null_mut(); ARENA_FREELIST_BUCKETS],
            alloc_hash: [core::ptr::null_mut(); ARENA_HASH_BUCKETS],
            next_fit_cursor: 0,
            quantum,
            total: 0,
            free: 0,
            span_count: 0,
            free_segment_count: 0,
            allocated_count: 0,
        }
    }

    fn freelist_insert(&mut self, tag: *mut Tag) {
        unsafe {
            let k = bucket_of((*tag).len);
            (*tag).chain_prev = core::ptr::null_mut();
            (*tag).chain_next = self.free_lists[k];
            if !self.free_lists[k].is_null() {
                (*self.free_lists[k]).chain_prev = tag;
            }
            self.free_lists[k] = tag;
        }
        self.free_segment_count += 1;
    }

    fn freelist_remove(&mut self, tag: *mut Tag) {
        unsafe {
            if (*tag).chain_prev.is_null() {
                self.free_lists[bucket_of((*tag).len)] = (*tag).chain_next;
            } else {
                (*(*tag).chain_prev).chain_next = (*tag).chain_next;
            }
            if !(*tag).chain_next.is_null() {
                (*(*tag).chain_next).chain_prev = (*tag).chain_prev;
            }
            (*tag).chain_prev = core::ptr::null_mut();
            (*tag).chain_next = core::ptr::null_mut();
        }
        self.free_segment_count -= 1;
    }

    fn hash_bucket(&self, base: usize) -> usize {
        (base / self.quantum) % ARENA_HASH_BUCKETS
    }

    fn hash_insert(&mut self, tag: *mut Tag) {
        unsafe {
            let b = self.hash_bucket((*tag).base);
            (*tag).chain_prev = core::ptr::null_mut();
            (*tag).chain_next = self.alloc_hash[b];
            if !self.alloc_hash[b].is_null() {
                (*self.alloc_hash[b]).chain_prev = tag;
            }
            self.alloc_hash[b] = tag;
        }
    }

    fn hash_remove(&mut self, base: usize) -> Option<*mut Tag> {
        let b = self.hash_bucket(base);
        unsafe {
            let mut cur = self.alloc_hash[b];
            while !cur.is_null() {
                if (*cur).base == base {
                    if (*cur).chain_prev.is_null() {
                        self.alloc_hash[b] = (*cur).chain_next;
                    } else {
                        (*(*cur).chain_prev).chain_next = (*cur).chain_next;
                    }
                    if !(*cur).chain_next.is_null() {
                        (*(*cur).chain_next).chain_prev = (*cur).chain_prev;
                    }
                    (*cur).chain_prev = core::ptr::null_mut();
                    (*cur).chain_next = core::ptr::null_mut();
                    return Some(cur);
                }
                cur = (*cur).chain_next;
            }
        }
        None
    }

    /// Inserts `tag` into the segment list after `prev` (or at the head).
    fn seg_insert_after(&mut self, prev: *mut Tag, tag: *mut Tag) {
        unsafe {
            if prev.is_null() {
                (*tag).seg_prev = core::ptr::null_mut();
                (*tag).seg_next = self.seg_head;
                if !self.seg_head.is_null() {
                    (*self.seg_head).seg_prev = tag;
                }
                self.seg_head = tag;
            } else {
                (*tag).seg_prev = prev;
                (*tag).seg_next = (*prev).seg_next;
                if !(*prev).seg_next.is_null() {
                    (*(*prev).seg_next).seg_prev = tag;
                }
                (*prev).seg_next = tag;
            }
        }
    }

    fn seg_remove(&mut self, tag: *mut Tag) {
        unsafe {
            if (*tag).seg_prev.is_null() {
                self.seg_head = (*tag).seg_next;
            } else {
                (*(*tag).seg_prev).seg_next = (*tag).seg_next;
            }
            if !(*tag).seg_next.is_null() {
                (*(*tag).seg_next).seg_prev = (*tag).seg_prev;
            }
            (*tag).seg_prev = core::ptr::null_mut();
            (*tag).seg_next = core::ptr::null_mut();
        }
    }

    /// Adds a span (and its initial free segment) covering `[base, base+len)`.
    fn insert_span(&mut self, base: usize, len: usize, imported: bool) {
        let mut prev = core::ptr::null_mut();
        let mut cur = self.seg_head;
        unsafe {
            while !cur.is_null() && (*cur).base <= base {
                prev = cur;
                cur = (*cur).seg_next;
            }
        }
        let span = alloc_tag(base, len, TagKind::Span { imported });
        self.seg_insert_after(prev, span);
        let free0 = alloc_tag(base, len, TagKind::Free);
        self.seg_insert_after(span, free0);
        self.freelist_insert(free0);
        self.total += len;
        self.free += len;
        self.span_count += 1;
    }

    /// Finds a free segment of at least `len` bytes per `policy`.
    fn take_fit(&mut self, len: usize, policy: AllocPolicy) -> Option<*mut Tag> {
        match policy {
            AllocPolicy::InstantFit => {
                let floor = bucket_of(len);
                let start = if len.is_power_of_two() { floor } else { floor + 1 };
                for k in start..ARENA_FREELIST_BUCKETS {
                    if !self.free_lists[k].is_null() {
                        return Some(self.free_lists[k]);
                    }
                }
                if start > floor {
                    // No guaranteed bucket had anything; first fit among
                    // the segments that merely might fit.
                    let mut cur = self.free_lists[floor];
                    unsafe {
                        while !cur.is_null() {
                            if (*cur).len >= len {
                                return Some(cur);
                            }
                            cur = (*cur).chain_next;
                        }
                    }
                }
                None
            }
            AllocPolicy::BestFit => {
                for k in bucket_of(len)..ARENA_FREELIST_BUCKETS {
                    let mut best: *mut Tag = core::ptr::null_mut();
                    let mut cur = self.free_lists[k];
                    unsafe {
                        while !cur.is_null() {
                            if (*cur).len >= len
                                && (best.is_null() || (*cur).len < (*best).len)
                            {
                                best = cur;
                            }
                            cur = (*cur).chain_next;
                        }
                    }
                    if !best.is_null() {
                        return Some(best);
                    }
                }
                None
            }
            AllocPolicy::NextFit => {
                let cursor = self.next_fit_cursor;
                let mut first_fit: *mut Tag = core::ptr::null_mut();
                let mut after_cursor: *mut Tag = core::ptr::null_mut();
                let mut cur = self.seg_head;
                unsafe {
                    while !cur.is_null() {
                        if (*cur).kind == TagKind::Free && (*cur).len >= len {
                            if first_fit.is_null() {
                                first_fit = cur;
                            }
                            if (*cur).base >= cursor {
                                after_cursor = cur;
                                break;
                            }
                        }
                        cur = (*cur).seg_next;
                    }
                }
                if !after_cursor.is_null() {
                    Some(after_cursor)
                } else if !first_fit.is_null() {
                    Some(first_fit)
                } else {
                    None
                }
            }
        }
    }

    /// Carves `len` bytes off the front of the free segment `tag`.
    fn split_and_allocate(&mut self, tag: *mut Tag, len: usize) -> Allocation {
        self.freelist_remove(tag);
        unsafe {
            if (*tag).len > len {
                let rem = alloc_tag((*tag).base + len, (*tag).len - len, TagKind::Free);
                self.seg_insert_after(tag, rem);
                self.freelist_insert(rem);
                (*tag).len = len;
            }
            (*tag).kind = TagKind::Allocated;
            self.hash_insert(tag);
            self.allocated_count += 1;
            self.free -= len;
            self.next_fit_cursor = (*tag).base + len;
            Allocation {
                base: (*tag).base as u64,
                len: (*tag).len,
            }
        }
    }

    /// Frees the allocation at `base`, coalescing with free neighbors.
    ///
    /// If that restores an imported span to its full, free, original shape,
    /// removes the span and returns its `(base, len)` so the caller can
    /// hand it back to the source (outside the arena lock).
    fn release_allocation(&mut self, base: usize, len: usize) -> Option<(usize, usize)> {
        let tag = self
            .hash_remove(base)
            .unwrap_or_else(|| panic!("arena: freeing unknown allocation at {base:#X}"));
        unsafe {
            assert!(
                (*tag).len == len,
                "arena: allocation at {:#X} freed with length {} but allocated with {}",
                base,
                len,
                (*tag).len,
            );
            self.allocated_count -= 1;
            self.free += (*tag).len;
            (*tag).kind = TagKind::Free;

            // Coalesce with the following segment.
            let next = (*tag).seg_next;
            if !next.is_null() && (*next).kind == TagKind::Free {
                self.freelist_remove(next);
                self.seg_remove(next);
                (*tag).len += (*next).len;
                free_tag(next);
            }

            // Coalesce into the preceding segment.
            let prev = (*tag).seg_prev;
            let merged = if !prev.is_null() && (*prev).kind == TagKind::Free {
                self.freelist_remove(prev);
                (*prev).len += (*tag).len;
                self.seg_remove(tag);
                free_tag(tag);
                prev
            } else {
                tag
            };
            self.freelist_insert(merged);

            // A fully free imported span goes home to its source.
            let span = (*merged).seg_prev;
            if !span.is_null()
                && (*span).kind == (TagKind::Span { imported: true })
                && (*span).base == (*merged).base
                && (*span).len == (*merged).len
            {
                let span_base = (*span).base;
                let span_len = (*span).len;
                self.freelist_remove(merged);
                self.seg_remove(merged);
                self.seg_remove(span);
                free_tag(merged);
                free_tag(span);
                self.total -= span_len;
                self.free -= span_len;
                self.span_count -= 1;
                return Some((span_base, span_len));
            }
        }
        None
    }
}

/// A magazine of pre-formed allocations for one quantum-cache size class.
struct Magazine {
    slots: [Allocation; QUANTUM_CACHE_MAGAZINE_CAPACITY],
    len: usize,
}

impl Magazine {
    const fn new() -> Magazine {
        Magazine {
            slots: [Allocation { base: 0, len: 0 }; QUANTUM_CACHE_MAGAZINE_CAPACITY],
            len: 0,
        }
    }

    fn pop(&mut self) -> Option<Allocation> {
        if self.len == 0 {
            None
        } else {
            self.len -= 1;
            Some(self.slots[self.len])
        }
    }

    fn push(&mut self, allocation: Allocation) -> Result<(), Allocation> {
        if self.len == QUANTUM_CACHE_MAGAZINE_CAPACITY {
            Err(allocation)
        } else {
            self.slots[self.len] = allocation;
            self.len += 1;
            Ok(())
        }
    }
}

struct QuantumCaches {
    max_len: usize,
    classes: [Mutex<Magazine>; MAX_QUANTUM_CACHE_CLASSES],
}

/// A resource arena. See the crate documentation.
pub struct Arena {
    name: &'static str,
    quantum: usize,
    inner: Mutex<ArenaInner>,
    source: Option<&'static dyn SpanSource>,
    quantum_caches: Option<QuantumCaches>,
}

impl Arena {
    /// Creates an arena with no source. Spans are added with
    /// [`Arena::add_span`].
    pub fn new(name: &'static str, quantum: usize) -> Arena {
        assert!(quantum > 0, "arena quantum must be non-zero");
        Arena {
            name,
            quantum,
            inner: Mutex::new(ArenaInner::new(quantum)),
            source: None,
            quantum_caches: None,
        }
    }

    /// Creates an arena that imports spans from `source` on shortage.
    pub fn with_source(
        name: &'static str,
        quantum: usize,
        source: &'static dyn SpanSource,
    ) -> Arena {
        let mut arena = Arena::new(name, quantum);
        arena.source = Some(source);
        arena
    }

    /// Enables per-size-class caching of allocations up to `max_len` bytes.
    /// Must be called before the arena is shared.
    pub fn with_quantum_caches(mut self, max_len: usize) -> Arena {
        assert!(max_len % self.quantum == 0);
        assert!(max_len / self.quantum <= MAX_QUANTUM_CACHE_CLASSES);
        const MAG: Mutex<Magazine> = Mutex::new(Magazine::new());
        self.quantum_caches = Some(QuantumCaches {
            max_len,
            classes: [MAG; MAX_QUANTUM_CACHE_CLASSES],
        });
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn quantum(&self) -> usize {
        self.quantum
    }

    /// Seeds the arena with an externally provided range.
    /// Only valid for arenas without a source.
    pub fn add_span(&self, base: usize, len: usize) -> Result<(), &'static str> {
        if self.source.is_some() {
            return Err("cannot add spans to an arena that has a source");
        }
        if len == 0 {
            return Err("cannot add an empty span");
        }
        if base % self.quantum != 0 || len % self.quantum != 0 {
            return Err("span base and length must be quantum multiples");
        }
        log::debug!("arena {}: adding span {:#X}..{:#X}", self.name, base, base + len);
        self.inner.lock().insert_span(base, len, false);
        Ok(())
    }

    /// Allocates `len` bytes (rounded up to the quantum) using `policy`.
    pub fn allocate(&self, len: usize, policy: AllocPolicy) -> Result<Allocation, ArenaError> {
        if len == 0 {
            return Err(ArenaError::ZeroLength);
        }
        let len = round_up(len, self.quantum);

        if let Some(caches) = &self.quantum_caches {
            if len <= caches.max_len {
                let class = len / self.quantum - 1;
                if let Some(allocation) = caches.classes[class].lock().pop() {
                    return Ok(allocation);
                }
            }
        }

        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(tag) = inner.take_fit(len, policy) {
                    return Ok(inner.split_and_allocate(tag, len));
                }
            }
            // The arena lock is dropped across the import so the source can
            // take its own locks (it may be another arena, or a mapping
            // operation that takes the page-table mutex).
            let source = match self.source {
                Some(source) => source,
                None => return Err(ArenaError::RequestedLengthUnavailable),
            };
            let span = source
                .import(len, policy)
                .map_err(|_| ArenaError::RequestedLengthUnavailable)?;
            log::trace!(
                "arena {}: imported span {:#X} + {:#X}",
                self.name,
                span.base(),
                span.len()
            );
            self.inner.lock().insert_span(span.base(), span.len(), true);
        }
    }

    /// Returns an allocation to the arena.
    ///
    /// Panics if `allocation` does not correspond to a live allocation:
    /// a mismatched free is a logic bug, not a recoverable condition.
    pub fn deallocate(&self, allocation: Allocation) {
        let len = round_up(allocation.len(), self.quantum);
        let allocation = Allocation::from_raw_parts(allocation.base(), len);

        if let Some(caches) = &self.quantum_caches {
            if len <= caches.max_len {
                let class = len / self.quantum - 1;
                if caches.classes[class].lock().push(allocation).is_ok() {
                    return;
                }
            }
        }

        self.release_to_tags(allocation);
    }

    fn release_to_tags(&self, allocation: Allocation) {
        let released = self
            .inner
            .lock()
            .release_allocation(allocation.base(), allocation.len());
        if let Some((base, len)) = released {
            // Only imported spans are ever returned, so a source exists.
            self.source
                .expect("imported span without a source")
                .release(Allocation::from_raw_parts(base, len));
        }
    }

    /// Pushes every cached quantum-class allocation back into the tag
    /// structures, releasing empty imported spans along the way.
    pub fn drain_quantum_caches(&self) {
        if let Some(caches) = &self.quantum_caches {
            for class in caches.classes.iter() {
                loop {
                    let allocation = match class.lock().pop() {
                        Some(allocation) => allocation,
                        None => break,
                    };
                    self.release_to_tags(allocation);
                }
            }
        }
    }

    pub fn stats(&self) -> ArenaStats {
        let inner = self.inner.lock();
        ArenaStats {
            total: inner.total,
            free: inner.free,
            spans: inner.span_count,
            allocations: inner.allocated_count,
            free_segments: inner.free_segment_count,
        }
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let stats = self.stats();
        write!(
            f,
            "Arena({}, quantum {}, {}/{} bytes free)",
            self.name, self.quantum, stats.free, stats.total
        )
    }
}

/// The default import/release behavior: forward to the source arena.
impl SpanSource for Arena {
    fn import(&self, len: usize, policy: AllocPolicy) -> Result<Allocation, ArenaError> {
        self.allocate(len, policy)
    }

    fn release(&self, span: Allocation) {
        self.deallocate(span)
    }
}
