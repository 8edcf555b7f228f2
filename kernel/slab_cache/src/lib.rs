//! A slab object cache: fixed-size items carved out of page-sized (or
//! larger) slabs, with constructed-object caching.
//!
//! A cache keeps two intrusive doubly-linked lists of slabs: `available`
//! (at least one free item) and `full` (none). Small items live together
//! with their slab record in a single page: the record sits at the tail of
//! the page, items pack from the base, and each item slot reserves room for
//! a free-list node after the payload. Large items get a separately
//! acquired backing range and per-item descriptors kept in a cache-global
//! index keyed by item address.
//!
//! Items are constructed once when their slab is created and destructed
//! only when the slab is destroyed, so a cache hit hands back an object
//! that is already in its constructed state.
//!
//! Where slab memory comes from is a [`SlabBacking`] given at cache
//! creation; the kernel heap provides backings over its page arena and,
//! for small-item caches, directly over the frame allocator through the
//! direct map.

#![no_std]

extern crate alloc;

#[cfg(test)]
mod test;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use core::cell::Cell;
use core::fmt;
use core::mem::{align_of, size_of};
use core::ptr::{self, NonNull};
use intrusive_collections::{intrusive_adapter, LinkedList, LinkedListLink, UnsafeRef};
use kernel_config::memory::{LARGE_ITEMS_PER_SLAB, PAGE_SIZE};
use log::trace;
use memory_structs::VirtualAddress;
use spin::Mutex;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SlabError {
    /// The backing could not provide slab memory.
    BackingExhausted,
    /// An item constructor reported failure.
    ConstructorFailed,
}

impl fmt::Display for SlabError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SlabError::BackingExhausted => write!(f, "no memory for a new slab"),
            SlabError::ConstructorFailed => write!(f, "slab item constructor failed"),
        }
    }
}

/// What to do with a slab whose last item was just returned.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LastSlabPolicy {
    /// Keep the final slab alive indefinitely so the cache never goes
    /// entirely cold.
    Keep,
    /// Always release an empty slab, destructing its items.
    Free,
}

/// Where a cache gets (and returns) the memory backing its slabs.
pub trait SlabBacking: Send + Sync {
    /// Acquires `len` bytes of mapped, writable memory. For backings that
    /// can only produce single pages, `len` is always `PAGE_SIZE`.
    fn acquire(&self, len: usize) -> Result<VirtualAddress, SlabError>;
    fn release(&self, base: VirtualAddress, len: usize);
    /// Whether this backing can only produce one page at a time
    /// (the frame-allocator backing). Such backings are restricted to
    /// small-item caches.
    fn single_page_only(&self) -> bool {
        false
    }
}

/// Constructs an item in place. Runs once per item, at slab creation.
pub type ItemCtor = fn(NonNull<u8>) -> Result<(), SlabError>;
/// Destructs an item in place. Runs once per item, at slab destruction.
pub type ItemDtor = fn(NonNull<u8>);

/// A free-list node. For small items it lives inside the item slot, after
/// the payload; for large items it is the first field of the descriptor.
#[repr(C)]
struct FreeNode {
    next: *mut FreeNode,
}

/// Descriptor for one large item.
#[repr(C)]
struct LargeItem {
    node: FreeNode,
    item: *mut u8,
    slab: *mut Slab,
}

/// The per-slab record. For small-item slabs this lives at
/// `page_end - size_of::<Slab>()`; for large-item slabs it is allocated
/// separately.
struct Slab {
    link: LinkedListLink,
    free_head: Cell<*mut FreeNode>,
    allocated: Cell<u32>,
    /// Base of the item storage.
    base: usize,
    /// Length of the acquired backing.
    storage_len: usize,
    large: bool,
}

intrusive_adapter!(SlabAdapter = UnsafeRef<Slab>: Slab { link: LinkedListLink });

struct CacheInner {
    available: LinkedList<SlabAdapter>,
    full: LinkedList<SlabAdapter>,
    slab_count: usize,
    items_out: usize,
    /// Large items only: item address -> descriptor.
    large_index: BTreeMap<usize, *mut LargeItem>,
}

unsafe impl Send for CacheInner {}

/// A snapshot of a cache's bookkeeping.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct CacheStats {
    pub slab_count: usize,
    pub available_slabs: usize,
    pub full_slabs: usize,
    pub items_out: usize,
    pub items_per_slab: usize,
}

const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// A slab cache with runtime-configured item size, alignment, and
/// constructor/destructor. See [`ObjectCache`] for the typed wrapper.
pub struct RawCache {
    name: &'static str,
    item_size: usize,
    ctor: Option<ItemCtor>,
    dtor: Option<ItemDtor>,
    last_slab: LastSlabPolicy,
    backing: &'static dyn SlabBacking,
    small: bool,
    /// Byte pitch between consecutive items.
    slot_size: usize,
    /// Small items: offset of the free-list node within a slot.
    node_offset: usize,
    items_per_slab: usize,
    inner: Mutex<CacheInner>,
    /// Serializes slab creation so a burst of misses makes one slab.
    allocate_mutex: Mutex<()>,
}

impl RawCache {
    pub fn new(
        name: &'static str,
        item_size: usize,
        item_align: usize,
        ctor: Option<ItemCtor>,
        dtor: Option<ItemDtor>,
        last_slab: LastSlabPolicy,
        backing: &'static dyn SlabBacking,
    ) -> RawCache {
        assert!(item_size > 0);
        assert!(item_align.is_power_of_two());
        assert!(item_align <= PAGE_SIZE);

        let effective_item_size = align_up(item_size, item_align);
        let small = effective_item_size <= (PAGE_SIZE - size_of::<Slab>()) / 8;
        assert!(
            small || !backing.single_page_only(),
            "cache {}: a single-page backing cannot serve large items",
            name,
        );

        let (slot_size, node_offset, items_per_slab) = if small {
            let node_offset = align_up(item_size, align_of::<FreeNode>());
            let slot_align = if item_align > align_of::<FreeNode>() {
                item_align
            } else {
                align_of::<FreeNode>()
            };
            let slot_size = align_up(node_offset + size_of::<FreeNode>(), slot_align);
            let items = (PAGE_SIZE - size_of::<Slab>()) / slot_size;
            (slot_size, node_offset, items)
        } else {
            (effective_item_size, 0, LARGE_ITEMS_PER_SLAB)
        };
        assert!(items_per_slab > 0);

        RawCache {
            name,
            item_size,
            ctor,
            dtor,
            last_slab,
            backing,
            small,
            slot_size,
            node_offset,
            items_per_slab,
            inner: Mutex::new(CacheInner {
                available: LinkedList::new(SlabAdapter::new()),
                full: LinkedList::new(SlabAdapter::new()),
                slab_count: 0,
                items_out: 0,
                large_index: BTreeMap::new(),
            }),
            allocate_mutex: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn item_size(&self) -> usize {
        self.item_size
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            slab_count: inner.slab_count,
            available_slabs: inner.available.iter().count(),
            full_slabs: inner.full.iter().count(),
            items_out: inner.items_out,
            items_per_slab: self.items_per_slab,
        }
    }

    /// Allocates one item per slot of `out`, writing the item pointers.
    ///
    /// On failure every item already taken by this call is returned, so
    /// the call is all-or-nothing.
    pub fn allocate(&self, out: &mut [Option<NonNull<u8>>]) -> Result<(), SlabError> {
        let mut filled = 0;
        let mut inner = self.inner.lock();
        while filled < out.len() {
            if inner.available.is_empty() {
                drop(inner);
                if let Err(error) = self.grow() {
                    // Roll back the partial batch.
                    for slot in out[..filled].iter_mut() {
                        let item = slot.take().unwrap();
                        self.deallocate(&[item]);
                    }
                    return Err(error);
                }
                inner = self.inner.lock();
                continue;
            }

            let slab_ptr = {
                let front = inner.available.front();
                front.get().unwrap() as *const Slab as *mut Slab
            };
            unsafe {
                let node = (*slab_ptr).free_head.get();
                debug_assert!(!node.is_null(), "available slab with no free items");
                (*slab_ptr).free_head.set((*node).next);
                (*slab_ptr)
                    .allocated
                    .set((*slab_ptr).allocated.get() + 1);
                inner.items_out += 1;

                let item = if (*slab_ptr).large {
                    (*(node as *mut LargeItem)).item
                } else {
                    (node as usize - self.node_offset) as *mut u8
                };
                out[filled] = Some(NonNull::new_unchecked(item));
                filled += 1;

                if (*slab_ptr).free_head.get().is_null() {
                    // Slab just went full.
                    let slab = inner.available.pop_front().unwrap();
                    inner.full.push_front(slab);
                }
            }
        }
        Ok(())
    }

    /// Returns the given items to their slabs.
    ///
    /// Panics on items that were not allocated from this cache.
    pub fn deallocate(&self, items: &[NonNull<u8>]) {
        let mut inner = self.inner.lock();
        for &item in items {
            let (slab_ptr, node) = if self.small {
                let page_base = item.as_ptr() as usize & !(PAGE_SIZE - 1);
                let slab = (page_base + PAGE_SIZE - size_of::<Slab>()) as *mut Slab;
                let node = (item.as_ptr() as usize + self.node_offset) as *mut FreeNode;
                (slab, node)
            } else {
                let descriptor = *inner
                    .large_index
                    .get(&(item.as_ptr() as usize))
                    .unwrap_or_else(|| {
                        panic!("cache {}: item was not allocated here", self.name)
                    });
                unsafe { ((*descriptor).slab, &mut (*descriptor).node as *mut FreeNode) }
            };

            unsafe {
                let was_full = (*slab_ptr).free_head.get().is_null();
                (*node).next = (*slab_ptr).free_head.get();
                (*slab_ptr).free_head.set(node);
                let allocated = (*slab_ptr).allocated.get();
                assert!(allocated > 0, "cache {}: double free", self.name);
                (*slab_ptr).allocated.set(allocated - 1);
                inner.items_out -= 1;

                if was_full {
                    let slab = inner
                        .full
                        .cursor_mut_from_ptr(slab_ptr)
                        .remove()
                        .unwrap();
                    inner.available.push_front(slab);
                }

                if (*slab_ptr).allocated.get() == 0 {
                    let destroy = match self.last_slab {
                        LastSlabPolicy::Free => true,
                        LastSlabPolicy::Keep => inner.slab_count > 1,
                    };
                    if destroy {
                        self.destroy_slab(&mut inner, slab_ptr);
                    }
                }
            }
        }
    }

    /// Tears the cache down, destroying its remaining (empty) slabs.
    ///
    /// Panics if any item is still outstanding.
    pub fn deinit(&self) {
        let mut inner = self.inner.lock();
        assert!(
            inner.full.is_empty() && inner.items_out == 0,
            "cache {}: deinitialized with {} items outstanding",
            self.name,
            inner.items_out,
        );
        loop {
            let slab_ptr = match inner.available.front().get() {
                Some(slab) => slab as *const Slab as *mut Slab,
                None => break,
            };
            unsafe { self.destroy_slab(&mut inner, slab_ptr) };
        }
        assert!(
            inner.large_index.is_empty(),
            "cache {}: stale large-item descriptors at deinit",
            self.name,
        );
    }

    /// Creates one new slab, unless another thread beat us to it.
    fn grow(&self) -> Result<(), SlabError> {
        let _serialized = self.allocate_mutex.lock();
        if !self.inner.lock().available.is_empty() {
            return Ok(());
        }

        let slab_ptr = if self.small {
            self.new_small_slab()?
        } else {
            self.new_large_slab()?
        };

        let mut inner = self.inner.lock();
        if !self.small {
            // Register every item of the new slab in the address index.
            unsafe {
                let mut node = (*slab_ptr).free_head.get();
                while !node.is_null() {
                    let descriptor = node as *mut LargeItem;
                    inner
                        .large_index
                        .insert((*descriptor).item as usize, descriptor);
                    node = (*descriptor).node.next;
                }
            }
        }
        inner
            .available
            .push_front(unsafe { UnsafeRef::from_raw(slab_ptr) });
        inner.slab_count += 1;
        trace!("cache {}: grew to {} slabs", self.name, inner.slab_count);
        Ok(())
    }

    /// Builds a one-page slab: items from the page base, record at the tail.
    fn new_small_slab(&self) -> Result<*mut Slab, SlabError> {
        let base = self.backing.acquire(PAGE_SIZE)?;
        let base = base.value();
        let slab_ptr = (base + PAGE_SIZE - size_of::<Slab>()) as *mut Slab;
        unsafe {
            slab_ptr.write(Slab {
                link: LinkedListLink::new(),
                free_head: Cell::new(ptr::null_mut()),
                allocated: Cell::new(0),
                base,
                storage_len: PAGE_SIZE,
                large: false,
            });

            let mut head: *mut FreeNode = ptr::null_mut();
            for i in 0..self.items_per_slab {
                let item = (base + i * self.slot_size) as *mut u8;
                if let Some(ctor) = self.ctor {
                    if ctor(NonNull::new_unchecked(item)).is_err() {
                        self.unwind_constructed(base, i);
                        self.backing
                            .release(VirtualAddress::new(base), PAGE_SIZE);
                        return Err(SlabError::ConstructorFailed);
                    }
                }
                let node = (item as usize + self.node_offset) as *mut FreeNode;
                (*node).next = head;
                head = node;
            }
            (*slab_ptr).free_head.set(head);
        }
        Ok(slab_ptr)
    }

    /// Builds a large-item slab: a separately acquired backing range, a
    /// heap-allocated record, and one heap-allocated descriptor per item.
    fn new_large_slab(&self) -> Result<*mut Slab, SlabError> {
        let storage_len = self.items_per_slab * self.slot_size;
        let base = self.backing.acquire(storage_len)?;
        let base = base.value();
        let slab_ptr = Box::into_raw(Box::new(Slab {
            link: LinkedListLink::new(),
            free_head: Cell::new(ptr::null_mut()),
            allocated: Cell::new(0),
            base,
            storage_len,
            large: true,
        }));

        let mut head: *mut FreeNode = ptr::null_mut();
        for i in 0..self.items_per_slab {
            let item = (base + i * self.slot_size) as *mut u8;
            if let Some(ctor) = self.ctor {
                if ctor(unsafe { NonNull::new_unchecked(item) }).is_err() {
                    unsafe {
                        self.unwind_constructed(base, i);
                        // Free the descriptors built so far.
                        let mut node = head;
                        while !node.is_null() {
                            let descriptor = node as *mut LargeItem;
                            node = (*descriptor).node.next;
                            drop(Box::from_raw(descriptor));
                        }
                        drop(Box::from_raw(slab_ptr));
                    }
                    self.backing.release(VirtualAddress::new(base), storage_len);
                    return Err(SlabError::ConstructorFailed);
                }
            }
            let descriptor = Box::into_raw(Box::new(LargeItem {
                node: FreeNode { next: head },
                item,
                slab: slab_ptr,
            }));
            head = unsafe { &mut (*descriptor).node as *mut FreeNode };
        }
        unsafe {
            (*slab_ptr).free_head.set(head);
        }
        Ok(slab_ptr)
    }

    /// Calls destructors, in reverse construction order, on the first
    /// `constructed` items of a slab being unwound.
    unsafe fn unwind_constructed(&self, base: usize, constructed: usize) {
        if let Some(dtor) = self.dtor {
            for i in (0..constructed).rev() {
                let item = (base + i * self.slot_size) as *mut u8;
                dtor(NonNull::new_unchecked(item));
            }
        }
    }

    /// Destroys an entirely free slab: destructs every item, releases the
    /// backing, and drops the bookkeeping.
    unsafe fn destroy_slab(&self, inner: &mut CacheInner, slab_ptr: *mut Slab) {
        let slab = inner
            .available
            .cursor_mut_from_ptr(slab_ptr)
            .remove()
            .expect("empty slab not on the available list");
        drop(slab);
        inner.slab_count -= 1;

        let base = (*slab_ptr).base;
        let storage_len = (*slab_ptr).storage_len;
        let large = (*slab_ptr).large;

        if let Some(dtor) = self.dtor {
            for i in (0..self.items_per_slab).rev() {
                let item = (base + i * self.slot_size) as *mut u8;
                dtor(NonNull::new_unchecked(item));
            }
        }

        if large {
            let mut node = (*slab_ptr).free_head.get();
            while !node.is_null() {
                let descriptor = node as *mut LargeItem;
                node = (*descriptor).node.next;
                inner.large_index.remove(&((*descriptor).item as usize));
                drop(Box::from_raw(descriptor));
            }
            drop(Box::from_raw(slab_ptr));
        }

        self.backing.release(VirtualAddress::new(base), storage_len);
        trace!("cache {}: released a slab, {} remain", self.name, inner.slab_count);
    }
}

impl fmt::Debug for RawCache {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let stats = self.stats();
        write!(
            f,
            "RawCache({}, {} B items, {} slabs, {} out)",
            self.name, self.item_size, stats.slab_count, stats.items_out
        )
    }
}

fn construct_default<T: Default>(item: NonNull<u8>) -> Result<(), SlabError> {
    unsafe { item.cast::<T>().as_ptr().write(T::default()) };
    Ok(())
}

fn destruct_in_place<T>(item: NonNull<u8>) {
    unsafe { ptr::drop_in_place(item.cast::<T>().as_ptr()) };
}

/// A typed slab cache of `T`s, each initialized to `T::default()` when its
/// slab is created.
pub struct ObjectCache<T: Default + 'static> {
    raw: RawCache,
    _marker: core::marker::PhantomData<fn() -> T>,
}

impl<T: Default + 'static> ObjectCache<T> {
    pub fn new(
        name: &'static str,
        last_slab: LastSlabPolicy,
        backing: &'static dyn SlabBacking,
    ) -> ObjectCache<T> {
        ObjectCache {
            raw: RawCache::new(
                name,
                size_of::<T>(),
                align_of::<T>(),
                Some(construct_default::<T>),
                Some(destruct_in_place::<T>),
                last_slab,
                backing,
            ),
            _marker: core::marker::PhantomData,
        }
    }

    pub fn allocate(&self) -> Result<NonNull<T>, SlabError> {
        let mut out = [None];
        self.raw.allocate(&mut out)?;
        Ok(out[0].unwrap().cast::<T>())
    }

    pub fn deallocate(&self, item: NonNull<T>) {
        self.raw.deallocate(&[item.cast::<u8>()]);
    }

    pub fn stats(&self) -> CacheStats {
        self.raw.stats()
    }

    pub fn raw(&self) -> &RawCache {
        &self.raw
    }
}
