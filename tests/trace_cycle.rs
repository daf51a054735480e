use std::sync::Arc;

use poolgc::address::WORD;
use poolgc::test_utils::WordPool;
use poolgc::{
    AccessSet, Address, Arena, ArenaConfig, Color, Pool, PoolError, TraceId, TraceReason,
    TraceSet, TraceState,
};

fn arena() -> Arc<Arena> {
    Arena::new(ArenaConfig::default()).unwrap()
}

/// A heap of three segments: `y` in the first points at `x` in the second,
/// and `z` sits alone in the third.
struct Heap {
    pool: Arc<Pool>,
    x: Address,
    y: Address,
    z: Address,
}

fn three_segment_heap(arena: &Arena) -> Heap {
    let pool = WordPool::create(arena).unwrap();
    let first = pool.create_buffer();
    let second = pool.create_buffer();
    let third = pool.create_buffer();

    WordPool::allocate(&first, &[]).unwrap();
    let x = WordPool::allocate(&second, &[]).unwrap();
    let y = WordPool::allocate(&first, &[x]).unwrap();
    let z = WordPool::allocate(&third, &[]).unwrap();
    drop((first, second, third));

    assert_eq!(arena.segment_count(), 3);
    Heap { pool, x, y, z }
}

fn root_table(arena: &Arena, refs: &[Address]) -> Box<[usize]> {
    let table: Box<[usize]> = refs.iter().map(|r| r.as_usize()).collect();
    let base = Address::from_ptr(table.as_ptr());
    unsafe { arena.root_create_table(base, base + table.len() * WORD) };
    table
}

#[test]
fn collect_keeps_reachable_segments_and_reclaims_the_rest() {
    let arena = arena();
    let heap = three_segment_heap(&arena);
    let _roots = root_table(&arena, &[heap.y]);

    let stats = arena.collect().unwrap();
    assert_eq!(stats.condemned_segments, 3);
    assert_eq!(stats.scanned_segments, 2);
    assert_eq!(stats.reclaimed_segments, 1);
    assert_eq!(WordPool::reclaimed(&heap.pool), 1);

    assert!(arena.segment_of(heap.x).is_some());
    assert!(arena.segment_of(heap.y).is_some());
    assert!(arena.segment_of(heap.z).is_none());
    assert_eq!(unsafe { WordPool::references(heap.y) }, vec![heap.x]);

    let after = arena.stats();
    assert_eq!(after.segment_count, 2);
    assert_eq!(after.live_traces, 0);
    assert_eq!(after.traces_completed, 1);
    assert_eq!(after.flips, 1);
}

#[test]
fn condemned_segment_without_references_is_reclaimed() {
    let arena = arena();
    let pool = WordPool::create(&arena).unwrap();
    let buffer = pool.create_buffer();
    let object = WordPool::allocate(&buffer, &[]).unwrap();
    buffer.empty();
    let seg = arena.segment_of(object).unwrap();

    let trace = arena.trace_create(TraceReason::Explicit).unwrap();
    arena.trace_condemn(&trace, &seg).unwrap();
    assert_eq!(seg.color(trace.id()), Some(Color::White));
    assert_eq!(trace.condemned().len(), 1);
    arena.trace_start(&trace).unwrap();
    arena.trace_flip(&trace).unwrap();
    assert!(seg.protection_mode().contains(AccessSet::READ));

    let stats = arena.trace_run(&trace).unwrap();
    assert_eq!(stats.scanned_segments, 0);
    assert_eq!(stats.reclaimed_segments, 1);
    assert_eq!(stats.reclaimed_bytes, seg.size());
    assert!(arena.segment(seg.id()).is_none());
    assert_eq!(pool.segment_count(), 0);
    assert_eq!(arena.committed(), 0);
}

#[test]
fn trace_advances_in_bounded_steps() {
    let arena = arena();
    let heap = three_segment_heap(&arena);
    let _roots = root_table(&arena, &[heap.y]);
    let seg_x = arena.segment_of(heap.x).unwrap();
    let seg_y = arena.segment_of(heap.y).unwrap();

    let trace = arena.trace_create(TraceReason::Explicit).unwrap();
    assert_eq!(arena.trace_condemn_pool(&trace, &heap.pool).unwrap(), 3);
    arena.trace_start(&trace).unwrap();
    assert_eq!(trace.state(), TraceState::Started);
    assert!(arena.busy_traces().contains(trace.id()));
    assert!(arena.flipped_traces().is_empty());

    arena.trace_flip(&trace).unwrap();
    assert_eq!(seg_y.color(trace.id()), Some(Color::Grey));
    assert_eq!(seg_x.color(trace.id()), Some(Color::White));
    assert!(seg_y.protection_mode().contains(AccessSet::READ));
    assert!(seg_x.protection_mode().contains(AccessSet::READ));

    let mut steps = 0;
    let mut state = trace.state();
    while state != TraceState::Done {
        state = arena.trace_advance(&trace).unwrap();
        steps += 1;
    }
    // Enter scanning, scan two segments, finish scanning, reclaim.
    assert_eq!(steps, 5);

    assert_eq!(seg_y.color(trace.id()), None);
    assert!(seg_y.protection_mode().is_empty());
    assert!(seg_x.protection_mode().is_empty());
    assert!(arena.trace(trace.id()).is_none());
    assert_eq!(
        arena.trace_advance(&trace),
        Err(PoolError::InvalidTraceState {
            trace: trace.id(),
            expected: TraceState::Flipped,
            actual: TraceState::Done,
        })
    );
}

#[test]
fn root_functions_keep_objects_alive() {
    let arena = arena();
    let heap = three_segment_heap(&arena);
    let z = heap.z;
    let root = arena.root_create_fn(move |ss| {
        let mut reference = z;
        ss.fix(&mut reference)
    });

    let stats = arena.collect().unwrap();
    assert_eq!(stats.reclaimed_segments, 2);
    assert!(arena.segment_of(heap.z).is_some());

    assert!(arena.root_destroy(root));
    assert!(!arena.root_destroy(root));
    arena.collect().unwrap();
    assert_eq!(arena.segment_count(), 0);
    assert_eq!(arena.committed(), 0);
}

#[test]
fn objects_allocated_after_flip_survive() {
    let arena = arena();
    let heap = three_segment_heap(&arena);
    let buffer = heap.pool.create_buffer();

    let trace = arena.trace_create(TraceReason::Explicit).unwrap();
    arena.trace_condemn_pool(&trace, &heap.pool).unwrap();
    arena.trace_start(&trace).unwrap();
    arena.trace_flip(&trace).unwrap();

    let fresh = WordPool::allocate(&buffer, &[]).unwrap();
    let seg = arena.segment_of(fresh).unwrap();
    assert_eq!(seg.color(trace.id()), Some(Color::Black));
    assert!(seg.protection_mode().is_empty());

    let stats = arena.trace_run(&trace).unwrap();
    assert_eq!(stats.reclaimed_segments, 3);
    assert_eq!(arena.segment_count(), 1);
    assert!(arena.segment_of(fresh).is_some());
}

#[test]
fn overlapping_traces_keep_independent_colors() {
    let arena = arena();
    let heap = three_segment_heap(&arena);
    let roots = root_table(&arena, &[heap.y]);
    let seg_y = arena.segment_of(heap.y).unwrap();

    let first = arena.trace_create(TraceReason::Explicit).unwrap();
    let second = arena.trace_create(TraceReason::Explicit).unwrap();
    assert_ne!(first.id(), second.id());
    arena.trace_condemn_pool(&first, &heap.pool).unwrap();
    arena.trace_condemn_pool(&second, &heap.pool).unwrap();

    let stats = arena.trace_run(&first).unwrap();
    assert_eq!(stats.reclaimed_segments, 1);
    assert_eq!(seg_y.color(first.id()), None);
    assert_eq!(seg_y.color(second.id()), Some(Color::White));
    assert_eq!(second.state(), TraceState::Inactive);

    // The second trace still sees the root at its own flip.
    let stats = arena.trace_run(&second).unwrap();
    assert_eq!(stats.reclaimed_segments, 0);
    assert_eq!(arena.segment_count(), 2);
    drop(roots);
}

#[test]
fn interleaved_flipped_traces_scan_and_reclaim_together() {
    let arena = arena();
    let heap = three_segment_heap(&arena);
    let _roots = root_table(&arena, &[heap.y]);
    let seg_x = arena.segment_of(heap.x).unwrap();
    let seg_y = arena.segment_of(heap.y).unwrap();
    let seg_z = arena.segment_of(heap.z).unwrap();

    let first = arena.trace_create(TraceReason::Explicit).unwrap();
    let second = arena.trace_create(TraceReason::Explicit).unwrap();
    assert_eq!(arena.trace_condemn_pool(&first, &heap.pool).unwrap(), 3);
    assert_eq!(arena.trace_condemn_pool(&second, &heap.pool).unwrap(), 3);
    arena.trace_start(&first).unwrap();
    arena.trace_start(&second).unwrap();
    arena.trace_flip(&first).unwrap();
    arena.trace_flip(&second).unwrap();

    let flipped = arena.flipped_traces();
    assert!(flipped.contains(first.id()) && flipped.contains(second.id()));
    for trace in [&first, &second] {
        assert_eq!(seg_y.color(trace.id()), Some(Color::Grey));
        assert_eq!(seg_x.color(trace.id()), Some(Color::White));
        assert_eq!(seg_z.color(trace.id()), Some(Color::White));
    }

    assert_eq!(arena.trace_advance(&first).unwrap(), TraceState::Scanning);
    assert_eq!(arena.trace_advance(&second).unwrap(), TraceState::Scanning);
    assert_eq!(first.state(), TraceState::Scanning);
    assert_eq!(second.state(), TraceState::Scanning);

    // One scan of y serves both traces and greys x for both.
    assert_eq!(arena.trace_advance(&first).unwrap(), TraceState::Scanning);
    for trace in [&first, &second] {
        assert_eq!(seg_y.color(trace.id()), Some(Color::Black));
        assert_eq!(seg_x.color(trace.id()), Some(Color::Grey));
        assert_eq!(seg_z.color(trace.id()), Some(Color::White));
    }

    let mut done = [false, false];
    while !done.iter().all(|d| *d) {
        for (index, trace) in [&first, &second].into_iter().enumerate() {
            if !done[index] {
                done[index] = arena.trace_advance(trace).unwrap() == TraceState::Done;
            }
        }
    }

    let reclaimed =
        first.stats().reclaimed_segments + second.stats().reclaimed_segments;
    assert_eq!(reclaimed, 1);
    assert_eq!(arena.segment_count(), 2);
    assert!(arena.segment_of(heap.x).is_some());
    assert!(arena.segment_of(heap.y).is_some());
    assert!(arena.segment_of(heap.z).is_none());
    assert!(seg_y.trace_set().is_empty());
    assert!(arena.busy_traces().is_empty());
    assert_eq!(arena.stats().traces_completed, 2);
}

#[test]
fn blackening_for_one_trace_leaves_the_other_alone() {
    let arena = arena();
    let heap = three_segment_heap(&arena);
    let seg = arena.segment_of(heap.y).unwrap();
    let (t1, t2) = (TraceId::new(0), TraceId::new(1));

    seg.set_color(t1, Color::Grey).unwrap();
    seg.set_color(t2, Color::White).unwrap();
    heap.pool.blacken(&seg, TraceSet::single(t1));

    assert_eq!(seg.color(t1), Some(Color::Black));
    assert_eq!(seg.color(t2), Some(Color::White));
    assert_eq!(seg.black_set(), TraceSet::single(t1));
    assert_eq!(seg.white_set(), TraceSet::single(t2));
    assert_eq!(
        seg.set_color(t1, Color::Grey),
        Err(PoolError::BackwardColor { trace: t1 })
    );
}

#[test]
fn destroying_an_unflipped_trace_drops_its_colors() {
    let arena = arena();
    let heap = three_segment_heap(&arena);

    let trace = arena.trace_create(TraceReason::Explicit).unwrap();
    arena.trace_condemn_pool(&trace, &heap.pool).unwrap();
    arena.trace_start(&trace).unwrap();
    arena.trace_destroy(&trace).unwrap();

    for seg in arena.segments() {
        assert!(seg.trace_set().is_empty());
        assert!(seg.protection_mode().is_empty());
    }
    assert_eq!(arena.segment_count(), 3);
    assert!(arena.busy_traces().is_empty());

    let flipped = arena.trace_create(TraceReason::Explicit).unwrap();
    arena.trace_start(&flipped).unwrap();
    arena.trace_flip(&flipped).unwrap();
    assert!(matches!(
        arena.trace_destroy(&flipped),
        Err(PoolError::InvalidTraceState {
            actual: TraceState::Flipped,
            ..
        })
    ));
    arena.trace_run(&flipped).unwrap();
}

#[test]
fn collect_reports_trace_exhaustion() {
    let arena = Arena::new(ArenaConfig::default().with_max_traces(1)).unwrap();
    let _held = arena.trace_create(TraceReason::Explicit).unwrap();
    assert_eq!(arena.collect().err(), Some(PoolError::TraceLimit));
}

#[test]
fn collect_leaves_non_collectible_pools_alone() {
    let arena = arena();
    let manual = poolgc::test_utils::ManualPool::create(&arena, false).unwrap();
    let range = manual.alloc(256).unwrap();

    let stats = arena.collect().unwrap();
    assert_eq!(stats.condemned_segments, 0);
    assert!(arena.segment_of(range.base()).is_some());
}
