extern crate std;

use self::std::alloc::{alloc, dealloc, Layout};
use self::std::boxed::Box;
use self::std::collections::HashMap;
use self::std::sync::Mutex as StdMutex;
use self::std::vec::Vec;

use super::*;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Hands out page-aligned host memory and tracks what is outstanding.
struct TestBacking {
    outstanding: StdMutex<HashMap<usize, usize>>,
    only_pages: bool,
}

impl TestBacking {
    fn leaked(only_pages: bool) -> &'static TestBacking {
        Box::leak(Box::new(TestBacking {
            outstanding: StdMutex::new(HashMap::new()),
            only_pages,
        }))
    }

    fn outstanding_count(&self) -> usize {
        self.outstanding.lock().unwrap().len()
    }
}

impl SlabBacking for TestBacking {
    fn acquire(&self, len: usize) -> Result<VirtualAddress, SlabError> {
        let layout = Layout::from_size_align(len, PAGE_SIZE).unwrap();
        let ptr = unsafe { alloc(layout) };
        if ptr.is_null() {
            return Err(SlabError::BackingExhausted);
        }
        self.outstanding.lock().unwrap().insert(ptr as usize, len);
        Ok(VirtualAddress::new(ptr as usize))
    }

    fn release(&self, base: VirtualAddress, len: usize) {
        let recorded = self
            .outstanding
            .lock()
            .unwrap()
            .remove(&base.value())
            .expect("released a range that was never acquired");
        assert_eq!(recorded, len);
        let layout = Layout::from_size_align(len, PAGE_SIZE).unwrap();
        unsafe { dealloc(base.value() as *mut u8, layout) };
    }

    fn single_page_only(&self) -> bool {
        self.only_pages
    }
}

fn take_one(cache: &RawCache) -> NonNull<u8> {
    let mut out = [None];
    cache.allocate(&mut out).unwrap();
    out[0].unwrap()
}

#[test]
fn small_items_pack_into_one_page() {
    let backing = TestBacking::leaked(false);
    let cache = RawCache::new("pack", 64, 8, None, None, LastSlabPolicy::Free, backing);
    let per_slab = cache.stats().items_per_slab;
    assert!(per_slab > 40, "64-byte items should pack densely");

    let mut out: Vec<Option<NonNull<u8>>> = Vec::new();
    out.resize(per_slab, None);
    cache.allocate(&mut out).unwrap();

    let first_page = out[0].unwrap().as_ptr() as usize & !(PAGE_SIZE - 1);
    for slot in &out {
        let addr = slot.unwrap().as_ptr() as usize;
        // Every item of the first slab lives in the same page, below the
        // slab record at the page tail.
        assert_eq!(addr & !(PAGE_SIZE - 1), first_page);
        assert!(addr % 8 == 0);
    }
    assert_eq!(cache.stats().slab_count, 1);
    assert_eq!(cache.stats().full_slabs, 1);

    // One more item forces a second slab.
    let extra = take_one(&cache);
    assert_eq!(cache.stats().slab_count, 2);

    cache.deallocate(&[extra]);
    let items: Vec<NonNull<u8>> = out.iter().map(|slot| slot.unwrap()).collect();
    cache.deallocate(&items);
    assert_eq!(cache.stats().slab_count, 0);
    assert_eq!(backing.outstanding_count(), 0);
}

static KEEP_CTOR: AtomicUsize = AtomicUsize::new(0);
static KEEP_DTOR: AtomicUsize = AtomicUsize::new(0);

fn keep_ctor(item: NonNull<u8>) -> Result<(), SlabError> {
    KEEP_CTOR.fetch_add(1, Ordering::SeqCst);
    unsafe { item.as_ptr().write_bytes(0x5A, 64) };
    Ok(())
}

fn keep_dtor(_item: NonNull<u8>) {
    KEEP_DTOR.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn keep_policy_retains_exactly_one_slab() {
    let backing = TestBacking::leaked(false);
    let cache = RawCache::new(
        "keep",
        64,
        8,
        Some(keep_ctor),
        Some(keep_dtor),
        LastSlabPolicy::Keep,
        backing,
    );

    let mut out: Vec<Option<NonNull<u8>>> = Vec::new();
    out.resize(100, None);
    cache.allocate(&mut out).unwrap();
    let constructed = KEEP_CTOR.load(Ordering::SeqCst);
    assert!(constructed >= 100);

    let items: Vec<NonNull<u8>> = out.iter().map(|slot| slot.unwrap()).collect();
    cache.deallocate(&items);

    let stats = cache.stats();
    assert_eq!(stats.slab_count, 1);
    assert_eq!(stats.available_slabs, 1);
    assert_eq!(stats.full_slabs, 0);
    assert_eq!(stats.items_out, 0);
    // The kept slab's items stay constructed.
    assert_eq!(KEEP_DTOR.load(Ordering::SeqCst), constructed - stats.items_per_slab);
    assert_eq!(backing.outstanding_count(), 1);
}

static ONCE_CTOR: AtomicUsize = AtomicUsize::new(0);
static ONCE_DTOR: AtomicUsize = AtomicUsize::new(0);

fn once_ctor(item: NonNull<u8>) -> Result<(), SlabError> {
    ONCE_CTOR.fetch_add(1, Ordering::SeqCst);
    unsafe { item.as_ptr().write_bytes(0xC3, 32) };
    Ok(())
}

fn once_dtor(_item: NonNull<u8>) {
    ONCE_DTOR.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn constructors_and_destructors_run_exactly_once_per_item() {
    let backing = TestBacking::leaked(false);
    let cache = RawCache::new(
        "once",
        32,
        8,
        Some(once_ctor),
        Some(once_dtor),
        LastSlabPolicy::Free,
        backing,
    );

    // Two rounds of allocate/free over the same slab must not re-run
    // constructors: a cache hit hands back a constructed object.
    let a = take_one(&cache);
    let after_first = ONCE_CTOR.load(Ordering::SeqCst);
    let per_slab = cache.stats().items_per_slab;
    assert_eq!(after_first % per_slab, 0);

    let b = take_one(&cache);
    assert_eq!(ONCE_CTOR.load(Ordering::SeqCst), after_first);
    cache.deallocate(&[b]);
    cache.deallocate(&[a]);

    // The slab was destroyed (policy Free), so every constructed item was
    // destructed exactly once.
    assert_eq!(ONCE_DTOR.load(Ordering::SeqCst), ONCE_CTOR.load(Ordering::SeqCst));
    assert_eq!(backing.outstanding_count(), 0);
}

static FAIL_CTOR_CALLS: AtomicUsize = AtomicUsize::new(0);
static FAIL_DTOR_CALLS: AtomicUsize = AtomicUsize::new(0);

fn failing_ctor(_item: NonNull<u8>) -> Result<(), SlabError> {
    let n = FAIL_CTOR_CALLS.fetch_add(1, Ordering::SeqCst);
    if n == 3 {
        Err(SlabError::ConstructorFailed)
    } else {
        Ok(())
    }
}

fn failing_dtor(_item: NonNull<u8>) {
    FAIL_DTOR_CALLS.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn constructor_failure_unwinds_the_slab() {
    let backing = TestBacking::leaked(false);
    let cache = RawCache::new(
        "ctor-fail",
        128,
        8,
        Some(failing_ctor),
        Some(failing_dtor),
        LastSlabPolicy::Free,
        backing,
    );

    let mut out = [None];
    assert_eq!(cache.allocate(&mut out), Err(SlabError::ConstructorFailed));
    // The three successfully constructed items were destructed again.
    assert_eq!(FAIL_DTOR_CALLS.load(Ordering::SeqCst), 3);
    assert_eq!(cache.stats().slab_count, 0);
    assert_eq!(backing.outstanding_count(), 0);
}

#[test]
fn large_items_use_separate_backing_and_an_index() {
    let backing = TestBacking::leaked(false);
    let cache = RawCache::new("large", 1024, 64, None, None, LastSlabPolicy::Free, backing);
    assert_eq!(cache.stats().items_per_slab, LARGE_ITEMS_PER_SLAB);

    let mut out: Vec<Option<NonNull<u8>>> = Vec::new();
    out.resize(LARGE_ITEMS_PER_SLAB + 2, None);
    cache.allocate(&mut out).unwrap();
    assert_eq!(cache.stats().slab_count, 2);

    let mut addresses: Vec<usize> = out
        .iter()
        .map(|slot| slot.unwrap().as_ptr() as usize)
        .collect();
    addresses.sort_unstable();
    addresses.dedup();
    assert_eq!(addresses.len(), LARGE_ITEMS_PER_SLAB + 2);
    for addr in &addresses {
        assert_eq!(addr % 64, 0);
    }

    let items: Vec<NonNull<u8>> = out.iter().map(|slot| slot.unwrap()).collect();
    cache.deallocate(&items);
    assert_eq!(cache.stats().slab_count, 0);
    assert_eq!(backing.outstanding_count(), 0);
    // Nothing left behind in the large-item index.
    cache.deinit();
}

#[test]
#[should_panic]
fn single_page_backings_reject_large_items() {
    let backing = TestBacking::leaked(true);
    RawCache::new("too-big", 1024, 8, None, None, LastSlabPolicy::Free, backing);
}

#[test]
#[should_panic]
fn deinit_with_outstanding_items_panics() {
    let backing = TestBacking::leaked(false);
    let cache = RawCache::new("leaky", 64, 8, None, None, LastSlabPolicy::Free, backing);
    let _item = take_one(&cache);
    cache.deinit();
}

#[derive(Clone, Copy)]
struct Counter {
    value: u64,
    tag: u32,
}

impl Default for Counter {
    fn default() -> Counter {
        Counter {
            value: 41,
            tag: 0xBEEF,
        }
    }
}

#[test]
fn object_cache_hands_out_constructed_values() {
    let backing = TestBacking::leaked(false);
    let cache: ObjectCache<Counter> = ObjectCache::new("typed", LastSlabPolicy::Keep, backing);

    let mut item = cache.allocate().unwrap();
    let value = unsafe { item.as_mut() };
    assert_eq!(value.value, 41);
    assert_eq!(value.tag, 0xBEEF);
    value.value += 1;
    cache.deallocate(item);

    // LIFO within the slab free list: the same slot comes back, still in
    // whatever state the previous holder left it (caches hold constructed
    // objects, not zeroed memory).
    let again = cache.allocate().unwrap();
    assert_eq!(again.as_ptr() as usize, item.as_ptr() as usize);
    cache.deallocate(again);
}
