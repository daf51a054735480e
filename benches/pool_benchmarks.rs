//! Benchmarks for allocation, class composition, tracing and fault dispatch

use criterion::{BatchSize, BenchmarkId, Criterion, criterion_group, criterion_main};
use poolgc::address::WORD;
use poolgc::pool::{Bundle, PoolClass};
use poolgc::test_utils::{ManualPool, WordPool};
use poolgc::{AccessSet, Address, Arena, ArenaConfig, Color, FaultDescriptor, TraceId};
use std::hint::black_box;

fn allocation_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocation");

    group.bench_function("buffer_reserve_commit", |b| {
        let arena = Arena::new(ArenaConfig::default().with_commit_limit(1 << 30)).unwrap();
        let pool = WordPool::create(&arena).unwrap();
        let buffer = pool.create_buffer();
        b.iter(|| black_box(WordPool::allocate(&buffer, &[]).unwrap()));
    });

    group.bench_function("direct_alloc_free", |b| {
        let arena = Arena::new(ArenaConfig::default()).unwrap();
        let pool = ManualPool::create(&arena, false).unwrap();
        b.iter(|| {
            let range = pool.alloc(black_box(256)).unwrap();
            pool.free(range.base(), 256);
        });
    });

    group.finish();
}

fn composition_benchmarks(c: &mut Criterion) {
    c.bench_function("compose_collectible_class", |b| {
        b.iter(|| {
            let class = Bundle::ALL
                .iter()
                .fold(PoolClass::abstract_pool("Bench"), |class, bundle| {
                    class.compose(*bundle)
                });
            black_box(class.unimplemented_slots())
        });
    });
}

fn trace_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("trace");

    for objects in [100usize, 1_000, 10_000] {
        group.bench_with_input(
            BenchmarkId::new("collect_rooted_chain", objects),
            &objects,
            |b, &objects| {
                let arena =
                    Arena::new(ArenaConfig::default().with_commit_limit(1 << 30)).unwrap();
                let pool = WordPool::create(&arena).unwrap();
                let buffer = pool.create_buffer();
                let mut head = WordPool::allocate(&buffer, &[]).unwrap();
                for _ in 1..objects {
                    head = WordPool::allocate(&buffer, &[head]).unwrap();
                }
                buffer.empty();

                let root = Box::new([head.as_usize()]);
                let base = Address::from_ptr(root.as_ptr());
                unsafe { arena.root_create_table(base, base + WORD) };

                b.iter(|| black_box(arena.collect().unwrap()));
            },
        );
    }

    group.bench_function("collect_garbage_segment", |b| {
        let arena = Arena::new(ArenaConfig::default()).unwrap();
        let pool = WordPool::create(&arena).unwrap();
        let buffer = pool.create_buffer();
        b.iter_batched(
            || {
                WordPool::allocate(&buffer, &[]).unwrap();
                buffer.empty();
            },
            |()| black_box(arena.collect().unwrap()),
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

fn barrier_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("barrier");

    let arena = Arena::new(ArenaConfig::default()).unwrap();
    let pool = WordPool::create(&arena).unwrap();
    let buffer = pool.create_buffer();
    let object = WordPool::allocate(&buffer, &[]).unwrap();
    let seg = arena.segment_of(object).unwrap();

    group.bench_function("spurious_fault", |b| {
        let fault = FaultDescriptor::new(object, AccessSet::READ);
        b.iter(|| black_box(arena.handle_fault(black_box(&fault)).unwrap()));
    });

    group.bench_function("not_our_fault", |b| {
        let fault = FaultDescriptor::new(Address::from_usize(WORD), AccessSet::WRITE);
        b.iter(|| black_box(arena.handle_fault(black_box(&fault)).unwrap()));
    });

    group.bench_function("color_lane_update", |b| {
        let trace = TraceId::new(3);
        seg.set_color(trace, Color::Black).unwrap();
        b.iter(|| {
            black_box(seg.advance(trace, Color::Grey));
            black_box(seg.set_color(trace, Color::Black).unwrap())
        });
    });

    group.bench_function("color_sets", |b| {
        b.iter(|| black_box(seg.white_set().union(seg.grey_set())));
    });

    group.bench_function("expose_cover", |b| {
        b.iter(|| {
            let _exposed = arena.shield().expose(&seg).unwrap();
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    allocation_benchmarks,
    composition_benchmarks,
    trace_benchmarks,
    barrier_benchmarks
);
criterion_main!(benches);
