#![no_main]

use libfuzzer_sys::fuzz_target;
use poolgc::address::WORD;
use poolgc::test_utils::WordPool;
use poolgc::{AccessSet, Address, Arena, ArenaConfig, FaultDescriptor, TraceReason, TraceState};

const BUFFERS: usize = 3;
const ROOTS: usize = 8;

/// Root slots registered with the arena, written only through their address.
struct RootTable {
    _slots: Box<[usize; ROOTS]>,
    base: Address,
}

impl RootTable {
    fn register(arena: &Arena) -> Self {
        let mut slots = Box::new([0usize; ROOTS]);
        let base = Address::from_ptr(slots.as_mut_ptr());
        unsafe { arena.root_create_table(base, base + ROOTS * WORD) };
        Self { _slots: slots, base }
    }

    fn set(&self, slot: usize, value: Address) {
        unsafe { (self.base + slot * WORD).store(value.as_usize()) };
    }

    fn live(&self) -> Vec<Address> {
        (0..ROOTS)
            .map(|slot| Address::from_usize(unsafe { (self.base + slot * WORD).load() }))
            .filter(|root| !root.is_zero())
            .collect()
    }
}

/// The mutator is black after a flip, so anything it picks up goes through
/// the read barrier first.
fn touch(arena: &Arena, tracing: bool, object: Address) {
    if tracing {
        arena
            .handle_fault(&FaultDescriptor::new(object, AccessSet::READ))
            .unwrap();
    }
}

/// Forget objects whose segments were reclaimed; rooted ones must survive.
fn retain_live(arena: &Arena, objects: &mut Vec<Address>, roots: &RootTable) {
    for root in roots.live() {
        assert!(arena.segment_of(root).is_some(), "rooted object {root} reclaimed");
    }
    objects.retain(|object| arena.segment_of(*object).is_some());
}

fuzz_target!(|data: &[u8]| {
    let arena = Arena::new(ArenaConfig::default()).unwrap();
    let pool = WordPool::create(&arena).unwrap();
    let buffers: Vec<_> = (0..BUFFERS).map(|_| pool.create_buffer()).collect();
    let roots = RootTable::register(&arena);
    let mut objects: Vec<Address> = Vec::new();
    let mut trace = None;

    for chunk in data.chunks(3) {
        let (op, a, b) = match *chunk {
            [op, a, b] => (op, a as usize, b as usize),
            _ => break,
        };
        match op % 6 {
            // Allocate, optionally pointing at an earlier object.
            0 => {
                let mut refs = Vec::new();
                if !objects.is_empty() && b % 2 == 1 {
                    let target = objects[b % objects.len()];
                    touch(&arena, trace.is_some(), target);
                    refs.push(target);
                }
                objects.push(WordPool::allocate(&buffers[a % BUFFERS], &refs).unwrap());
            }
            // Root an object, or clear a root slot.
            1 => {
                let slot = a % ROOTS;
                if objects.is_empty() || b % 4 == 0 {
                    roots.set(slot, Address::ZERO);
                } else {
                    let target = objects[b % objects.len()];
                    touch(&arena, trace.is_some(), target);
                    roots.set(slot, target);
                }
            }
            // Start and flip a trace over the whole pool.
            2 => {
                if trace.is_none() {
                    buffers[a % BUFFERS].empty();
                    let t = arena.trace_create(TraceReason::Explicit).unwrap();
                    arena.trace_condemn_pool(&t, &pool).unwrap();
                    arena.trace_start(&t).unwrap();
                    arena.trace_flip(&t).unwrap();
                    trace = Some(t);
                }
            }
            // One step of the running trace.
            3 => {
                let done = match &trace {
                    Some(t) => arena.trace_advance(t).unwrap() == TraceState::Done,
                    None => false,
                };
                if done {
                    trace = None;
                    retain_live(&arena, &mut objects, &roots);
                }
            }
            // A mutator access to a known object.
            4 => {
                if !objects.is_empty() {
                    let mode = if b % 2 == 0 { AccessSet::READ } else { AccessSet::WRITE };
                    let fault = FaultDescriptor::new(objects[a % objects.len()], mode);
                    arena.handle_fault(&fault).unwrap();
                }
            }
            // Finish any running trace, then collect everything.
            _ => {
                if let Some(t) = trace.take() {
                    arena.trace_run(&t).unwrap();
                    retain_live(&arena, &mut objects, &roots);
                }
                for buffer in &buffers {
                    buffer.empty();
                }
                arena.collect().unwrap();
                retain_live(&arena, &mut objects, &roots);
            }
        }
    }

    if let Some(t) = trace.take() {
        arena.trace_run(&t).unwrap();
        retain_live(&arena, &mut objects, &roots);
    }
});
