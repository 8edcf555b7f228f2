extern crate std;

use self::std::boxed::Box;
use self::std::vec::Vec;

use super::*;

/// Keeps the shared static tag pool from running dry when the whole test
/// suite runs in one process.
fn grow_tag_pool() {
    use self::std::sync::Once;
    static GROW: Once = Once::new();
    GROW.call_once(|| {
        let mut tags: Vec<Tag> = Vec::new();
        tags.resize_with(4096, Tag::empty);
        provide_tag_storage(Box::leak(tags.into_boxed_slice()));
    });
}

fn arena_with_span(name: &'static str, quantum: usize, base: usize, len: usize) -> Arena {
    grow_tag_pool();
    let arena = Arena::new(name, quantum);
    arena.add_span(base, len).unwrap();
    arena
}

#[test]
fn zero_length_requests_fail_without_mutation() {
    let arena = arena_with_span("zero", 16, 0x1000, 0x1000);
    let before = arena.stats();
    assert_eq!(arena.allocate(0, AllocPolicy::InstantFit), Err(ArenaError::ZeroLength));
    assert_eq!(arena.stats(), before);
}

#[test]
fn oversized_requests_fail_without_mutation() {
    let arena = arena_with_span("oversized", 16, 0x1000, 0x1000);
    let before = arena.stats();
    assert_eq!(
        arena.allocate(0x2000, AllocPolicy::BestFit),
        Err(ArenaError::RequestedLengthUnavailable)
    );
    assert_eq!(arena.stats(), before);
}

#[test]
fn lengths_round_up_to_the_quantum() {
    let arena = arena_with_span("rounding", 16, 0x1000, 0x1000);
    let allocation = arena.allocate(5, AllocPolicy::InstantFit).unwrap();
    assert_eq!(allocation.len(), 16);
    assert_eq!(allocation.base() % 16, 0);
    arena.deallocate(allocation);
}

#[test]
fn bookkeeping_closes_back_to_the_initial_state() {
    let arena = arena_with_span("closure", 16, 0x10_0000, 0x10_000);
    let initial = arena.stats();
    assert_eq!(initial.free_segments, 1);
    assert_eq!(initial.allocations, 0);

    let mut outstanding = Vec::new();
    for len in [16, 48, 256, 1024, 32, 4096, 80] {
        outstanding.push(arena.allocate(len, AllocPolicy::InstantFit).unwrap());
    }
    // Free in an order that exercises both coalescing directions.
    outstanding.swap(0, 5);
    outstanding.swap(2, 6);
    for allocation in outstanding.drain(..) {
        arena.deallocate(allocation);
    }

    assert_eq!(arena.stats(), initial);
}

#[test]
fn allocations_do_not_overlap() {
    let arena = arena_with_span("overlap", 16, 0x1000, 0x2000);
    let mut taken: Vec<Allocation> = Vec::new();
    for len in [16, 64, 112, 256, 16, 512] {
        let a = arena.allocate(len, AllocPolicy::InstantFit).unwrap();
        for b in &taken {
            let disjoint = a.base() + a.len() <= b.base() || b.base() + b.len() <= a.base();
            assert!(disjoint, "{a:?} overlaps {b:?}");
        }
        taken.push(a);
    }
    for a in taken {
        arena.deallocate(a);
    }
}

#[test]
fn best_fit_prefers_the_tightest_hole() {
    let arena = arena_with_span("bestfit", 16, 0x1000, 0x2000);
    // Carve the span into alternating holes of 64 and 256 bytes.
    let a = arena.allocate(64, AllocPolicy::InstantFit).unwrap();
    let gap1 = arena.allocate(64, AllocPolicy::InstantFit).unwrap();
    let b = arena.allocate(256, AllocPolicy::InstantFit).unwrap();
    let gap2 = arena.allocate(256, AllocPolicy::InstantFit).unwrap();
    let _tail_guard = arena.allocate(16, AllocPolicy::InstantFit).unwrap();
    arena.deallocate(gap1);
    arena.deallocate(gap2);

    // The tightest hole for 64 bytes is the freed 64-byte one.
    let got = arena.allocate(64, AllocPolicy::BestFit).unwrap();
    assert_eq!(got.base(), a.base() + a.len());
    assert_eq!(got.len(), 64);

    // And a 256-byte request lands in the 256-byte hole.
    let got2 = arena.allocate(256, AllocPolicy::BestFit).unwrap();
    assert_eq!(got2.base(), b.base() + b.len());
}

#[test]
fn next_fit_resumes_after_the_previous_allocation() {
    let arena = arena_with_span("nextfit", 16, 0x1000, 0x1000);
    let first = arena.allocate(64, AllocPolicy::NextFit).unwrap();
    let second = arena.allocate(64, AllocPolicy::NextFit).unwrap();
    assert_eq!(second.base(), first.base() + 64);

    // Freeing the first leaves a hole behind the cursor; next-fit keeps
    // moving forward instead of reusing it.
    arena.deallocate(first);
    let third = arena.allocate(64, AllocPolicy::NextFit).unwrap();
    assert_eq!(third.base(), second.base() + 64);
}

#[test]
fn free_segments_coalesce() {
    let arena = arena_with_span("coalesce", 16, 0x1000, 0x1000);
    let a = arena.allocate(256, AllocPolicy::InstantFit).unwrap();
    let b = arena.allocate(256, AllocPolicy::InstantFit).unwrap();
    let c = arena.allocate(256, AllocPolicy::InstantFit).unwrap();

    // Free the middle last so both directions of merging run.
    arena.deallocate(a);
    arena.deallocate(c);
    // `a` sits alone; `c` merged forward into the span's tail segment.
    let mid = arena.stats();
    assert_eq!(mid.free_segments, 2);
    arena.deallocate(b);

    let after = arena.stats();
    assert_eq!(after.free_segments, 1);
    assert_eq!(after.free, 0x1000);
}

#[test]
fn imports_come_from_the_source_and_go_back_whole() {
    grow_tag_pool();
    let parent: &'static Arena = Box::leak(Box::new(Arena::new("import-parent", 0x1000)));
    parent.add_span(0x100_0000, 0x10_0000).unwrap();
    let child = Arena::with_source("import-child", 16, parent);

    let parent_initial = parent.stats();
    assert_eq!(child.stats().total, 0);

    // First allocation forces an import of one parent quantum.
    let a = child.allocate(16, AllocPolicy::InstantFit).unwrap();
    assert_eq!(child.stats().total, 0x1000);
    assert_eq!(parent.stats().allocations, 1);

    // A second allocation is satisfied from the imported span.
    let b = child.allocate(16, AllocPolicy::InstantFit).unwrap();
    assert_eq!(child.stats().spans, 1);

    // The span is only released once it is entirely free.
    child.deallocate(a);
    assert_eq!(parent.stats().allocations, 1);
    child.deallocate(b);
    assert_eq!(parent.stats(), parent_initial);
    assert_eq!(child.stats().total, 0);
}

#[test]
fn exhausted_source_surfaces_as_unavailable() {
    grow_tag_pool();
    let parent: &'static Arena = Box::leak(Box::new(Arena::new("dry-parent", 0x1000)));
    parent.add_span(0x200_0000, 0x1000).unwrap();
    let child = Arena::with_source("dry-child", 16, parent);

    let a = child.allocate(0x1000, AllocPolicy::InstantFit).unwrap();
    assert_eq!(
        child.allocate(0x1000, AllocPolicy::InstantFit),
        Err(ArenaError::RequestedLengthUnavailable)
    );
    child.deallocate(a);
}

#[test]
fn quantum_caches_recycle_small_allocations() {
    grow_tag_pool();
    let arena =
        Arena::new("qcache", 16).with_quantum_caches(512);
    arena.add_span(0x40_0000, 0x10_0000).unwrap();

    let a = arena.allocate(500, AllocPolicy::InstantFit).unwrap();
    assert_eq!(a.len(), 512);
    arena.deallocate(a);

    // The free went into the magazine: the arena still counts it as out.
    assert_eq!(arena.stats().allocations, 1);

    // The next same-class request is served straight from the magazine.
    let b = arena.allocate(512, AllocPolicy::InstantFit).unwrap();
    assert_eq!(b, a);
    arena.deallocate(b);

    // Draining pushes the cached allocation back through the tags.
    arena.drain_quantum_caches();
    let stats = arena.stats();
    assert_eq!(stats.allocations, 0);
    assert_eq!(stats.free, 0x10_0000);
    assert_eq!(stats.free_segments, 1);
}

#[test]
#[should_panic]
fn freeing_an_unknown_allocation_panics() {
    let arena = arena_with_span("bad-free", 16, 0x8000, 0x1000);
    arena.deallocate(Allocation::from_raw_parts(0x8000, 16));
}
