use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::thread;

use poolgc::address::WORD;
use poolgc::test_utils::WordPool;
use poolgc::{AccessSet, Address, Arena, ArenaConfig, FaultDescriptor, TraceReason, TraceState};
use rayon::prelude::*;

fn root_table(arena: &Arena, refs: &[Address]) -> Box<[usize]> {
    let table: Box<[usize]> = refs.iter().map(|r| r.as_usize()).collect();
    let base = Address::from_ptr(table.as_ptr());
    unsafe { arena.root_create_table(base, base + table.len() * WORD) };
    table
}

#[test]
fn parallel_buffers_hand_out_disjoint_objects() {
    let arena = Arena::new(ArenaConfig::default()).unwrap();
    let pool = WordPool::create(&arena).unwrap();

    let per_thread: Vec<Vec<Address>> = (0..8)
        .into_par_iter()
        .map(|_| {
            let buffer = pool.create_buffer();
            let mut objects = Vec::with_capacity(200);
            for i in 0..200 {
                let refs: Vec<Address> = objects.last().copied().into_iter().take(i % 2).collect();
                objects.push(WordPool::allocate(&buffer, &refs).unwrap());
            }
            objects
        })
        .collect();
    assert_eq!(pool.buffer_count(), 0);

    let all: HashSet<Address> = per_thread.iter().flatten().copied().collect();
    assert_eq!(all.len(), 8 * 200);

    // Keep the first thread's objects; everything else only shares their
    // segments by chance.
    let kept = &per_thread[0];
    let kept_segments: BTreeSet<_> = kept
        .iter()
        .map(|object| arena.segment_of(*object).unwrap().id())
        .collect();
    let _roots = root_table(&arena, kept);

    arena.collect().unwrap();
    assert_eq!(arena.segment_count(), kept_segments.len());
    for object in kept {
        assert!(arena.segment_of(*object).is_some());
    }
}

#[test]
fn faulting_threads_race_the_collector() {
    let arena = Arena::new(ArenaConfig::default()).unwrap();
    let pool = WordPool::create(&arena).unwrap();

    // One chain per buffer, so each chain lives in its own segment and
    // points into the previous chain's segment.
    let buffers: Vec<_> = (0..6).map(|_| pool.create_buffer()).collect();
    let mut heads = Vec::new();
    let mut previous: Option<Address> = None;
    for buffer in &buffers {
        let mut head = WordPool::allocate(buffer, &previous.into_iter().collect::<Vec<_>>()).unwrap();
        for _ in 0..50 {
            head = WordPool::allocate(buffer, &[head]).unwrap();
        }
        heads.push(head);
        previous = Some(head);
    }
    drop(buffers);
    let _roots = root_table(&arena, &heads);
    let before = arena.segment_count();

    let trace = arena.trace_create(TraceReason::Explicit).unwrap();
    arena.trace_condemn_pool(&trace, &pool).unwrap();
    arena.trace_start(&trace).unwrap();
    arena.trace_flip(&trace).unwrap();

    let arena_ref: &Arc<Arena> = &arena;
    thread::scope(|scope| {
        for head in heads.iter().copied() {
            scope.spawn(move || {
                let fault = FaultDescriptor::new(head, AccessSet::READ);
                arena_ref.handle_fault(&fault).unwrap();
            });
        }
        while arena_ref.trace_advance(&trace).unwrap() != TraceState::Done {}
    });

    let stats = trace.stats();
    assert_eq!(stats.reclaimed_segments, 0);
    assert_eq!(arena.segment_count(), before);
    for segment in arena.segments() {
        assert!(segment.trace_set().is_empty());
        assert!(segment.protection_mode().is_empty());
    }
}
