//! Pool instances and capability-checked dispatch.
//!
//! A [`Pool`] pairs a composed [`PoolClass`] with strategy-owned state. All
//! operations go through the class's method table; calling an operation
//! whose slot was never filled is a contract violation and halts.

pub mod class;
pub mod methods;

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

pub use class::{
    Bundle, PoolAttr, PoolClass, PoolState, Slot, SlotKind, AccessMethod, AllocMethod,
    BlackenMethod, BufferEmptyMethod, BufferFillMethod, DescribeMethod, FinishMethod, FixMethod,
    FramePopMethod, FramePopPendingMethod, FramePushMethod, FreeMethod, FreeWalkMethod,
    GreyMethod, InitMethod, RampBeginMethod, RampEndMethod, ReclaimMethod, ScanMethod,
    WalkMethod, WhitenMethod,
};

use crate::address::{AddrRange, Address};
use crate::arena::Arena;
use crate::buffer::{Buffer, BufferId, BufferState, Frame};
use crate::error::{PoolResult, contract_violation};
use crate::scan::ScanState;
use crate::segment::{Segment, SegmentId};
use crate::shield::MutatorFaultContext;
use crate::trace::Trace;
use crate::trace_set::{AccessSet, TraceSet};

/// Arena-unique pool identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct PoolId(pub(crate) u64);

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pool#{}", self.0)
    }
}

/// An allocation-policy instance.
pub struct Pool {
    id: PoolId,
    class: Arc<PoolClass>,
    arena: Weak<Arena>,
    segments: RwLock<Vec<Arc<Segment>>>,
    buffers: DashMap<BufferId, Arc<Mutex<BufferState>>>,
    next_buffer: AtomicU64,
    state: PoolState,
}

impl Pool {
    pub(crate) fn new(id: PoolId, class: Arc<PoolClass>, arena: Weak<Arena>, state: PoolState) -> Self {
        Self {
            id,
            class,
            arena,
            segments: RwLock::new(Vec::new()),
            buffers: DashMap::new(),
            next_buffer: AtomicU64::new(1),
            state,
        }
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    pub fn class(&self) -> &PoolClass {
        &self.class
    }

    pub fn attr(&self) -> PoolAttr {
        self.class.attr()
    }

    /// The owning arena. Using a pool after its arena is gone is a contract
    /// violation.
    #[track_caller]
    pub fn arena(&self) -> Arc<Arena> {
        match self.arena.upgrade() {
            Some(arena) => arena,
            None => panic!("contract violation: {} used after its arena was dropped", self.id),
        }
    }

    pub fn try_arena(&self) -> Option<Arc<Arena>> {
        self.arena.upgrade()
    }

    /// Strategy state, downcast to the type the strategy installed.
    #[track_caller]
    pub fn state<T: Any>(&self) -> &T {
        match self.state.downcast_ref::<T>() {
            Some(state) => state,
            None => panic!(
                "contract violation: {} state is not a {}",
                self.id,
                std::any::type_name::<T>()
            ),
        }
    }

    pub fn try_state<T: Any>(&self) -> Option<&T> {
        self.state.downcast_ref::<T>()
    }

    /// Snapshot of the segments this pool owns.
    pub fn segments(&self) -> Vec<Arc<Segment>> {
        self.segments.read().clone()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.read().len()
    }

    pub(crate) fn add_segment(&self, seg: Arc<Segment>) {
        self.segments.write().push(seg);
    }

    pub(crate) fn remove_segment(&self, id: SegmentId) -> Option<Arc<Segment>> {
        let mut segments = self.segments.write();
        let index = segments.iter().position(|seg| seg.id() == id)?;
        Some(segments.swap_remove(index))
    }

    /// Create a client allocation buffer on this pool.
    #[track_caller]
    pub fn create_buffer(self: &Arc<Self>) -> Buffer {
        if !self.attr().contains(PoolAttr::BUF) {
            contract_violation(self.class.name(), "create_buffer");
        }
        let state = Arc::new(Mutex::new(BufferState::new()));
        let id = self.register_buffer(Arc::clone(&state));
        Buffer::new(id, Arc::clone(self), state)
    }

    pub(crate) fn register_buffer(&self, state: Arc<Mutex<BufferState>>) -> BufferId {
        let id = BufferId(self.next_buffer.fetch_add(1, Ordering::Relaxed));
        self.buffers.insert(id, state);
        id
    }

    pub(crate) fn unregister_buffer(&self, id: BufferId) {
        self.buffers.remove(&id);
    }

    pub(crate) fn buffer_states(&self) -> Vec<Arc<Mutex<BufferState>>> {
        self.buffers.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Unallocated bytes sitting in this pool's buffers.
    pub fn scan_free_size(&self) -> usize {
        self.buffers
            .iter()
            .map(|entry| {
                let state = entry.value().lock();
                if state.limit > state.alloc {
                    state.limit - state.alloc
                } else {
                    0
                }
            })
            .sum()
    }

    /// Run the class initialiser once the pool is registered.
    #[track_caller]
    pub fn init(&self) -> PoolResult<()> {
        self.class.init.resolve(self.class.name(), "init")(self)
    }

    /// Tear down strategy state; segments are freed by the arena afterwards.
    #[track_caller]
    pub fn finish(&self) {
        self.class.finish.resolve(self.class.name(), "finish")(self)
    }

    /// Allocate `size` bytes directly, bypassing any buffer.
    ///
    /// # Panics
    ///
    /// If the class was composed without [`Bundle::AllocFree`] and never
    /// overrode `alloc`.
    #[track_caller]
    pub fn alloc(&self, size: usize) -> PoolResult<AddrRange> {
        self.class.alloc.resolve(self.class.name(), "alloc")(self, size)
    }

    /// Return a block obtained from [`Pool::alloc`].
    #[track_caller]
    pub fn free(&self, base: Address, size: usize) {
        self.class.free.resolve(self.class.name(), "free")(self, base, size)
    }

    /// Find or make room for at least `size` bytes and attach `buffer` to it.
    /// Returns the new `[base, limit)` of the buffer.
    #[track_caller]
    pub fn buffer_fill(&self, buffer: &mut BufferState, size: usize) -> PoolResult<AddrRange> {
        self.class.buffer_fill.resolve(self.class.name(), "buffer_fill")(self, buffer, size)
    }

    /// Give back the unused tail `[init, limit)` of a detaching buffer.
    #[track_caller]
    pub fn buffer_empty(&self, buffer: &mut BufferState, init: Address, limit: Address) {
        self.class.buffer_empty.resolve(self.class.name(), "buffer_empty")(self, buffer, init, limit)
    }

    /// Handle a barrier hit on `seg` at `addr`.
    ///
    /// On return the barrier for `mode` must have been lowered or the access
    /// otherwise satisfied, so the faulting instruction can be retried.
    #[track_caller]
    pub fn access(
        &self,
        seg: &Arc<Segment>,
        addr: Address,
        mode: AccessSet,
        context: &mut MutatorFaultContext<'_>,
    ) -> PoolResult<()> {
        self.class.access.resolve(self.class.name(), "access")(self, seg, addr, mode, context)
    }

    /// Condemn `seg` for `trace`.
    #[track_caller]
    pub fn whiten(&self, seg: &Segment, trace: &Trace) -> PoolResult<()> {
        self.class.whiten.resolve(self.class.name(), "whiten")(self, seg, trace)
    }

    #[track_caller]
    pub fn grey(&self, seg: &Segment, trace: &Trace) {
        self.class.grey.resolve(self.class.name(), "grey")(self, seg, trace)
    }

    #[track_caller]
    pub fn blacken(&self, seg: &Segment, traces: TraceSet) {
        self.class.blacken.resolve(self.class.name(), "blacken")(self, seg, traces)
    }

    /// Fix every reference in `seg`. Returns whether the scan covered the
    /// whole segment, in which case its summary can be narrowed.
    #[track_caller]
    pub fn scan(&self, seg: &Segment, ss: &mut ScanState<'_>) -> PoolResult<bool> {
        self.class.scan.resolve(self.class.name(), "scan")(self, seg, ss)
    }

    /// Preserve the object `reference` points into, updating it if it moved.
    #[track_caller]
    pub fn fix(&self, seg: &Segment, ss: &mut ScanState<'_>, reference: &mut Address) -> PoolResult<()> {
        self.class.fix.resolve(self.class.name(), "fix")(self, seg, ss, reference)
    }

    /// Free whatever of `seg` is still white for `trace`.
    #[track_caller]
    pub fn reclaim(&self, seg: &Arc<Segment>, trace: &Trace) {
        self.class.reclaim.resolve(self.class.name(), "reclaim")(self, seg, trace)
    }

    #[track_caller]
    pub fn ramp_begin(&self, buffer: &BufferState, collect_all: bool) {
        self.class.ramp_begin.resolve(self.class.name(), "ramp_begin")(self, buffer, collect_all)
    }

    #[track_caller]
    pub fn ramp_end(&self, buffer: &BufferState) {
        self.class.ramp_end.resolve(self.class.name(), "ramp_end")(self, buffer)
    }

    #[track_caller]
    pub fn frame_push(&self, buffer: &mut BufferState, frame: &Frame) -> PoolResult<()> {
        self.class.frame_push.resolve(self.class.name(), "frame_push")(self, buffer, frame)
    }

    #[track_caller]
    pub fn frame_pop(&self, buffer: &mut BufferState, frame: &Frame) -> PoolResult<()> {
        self.class.frame_pop.resolve(self.class.name(), "frame_pop")(self, buffer, frame)
    }

    /// Pop `frame` after the buffer has refilled since it was pushed.
    /// Cannot fail.
    #[track_caller]
    pub fn frame_pop_pending(&self, buffer: &mut BufferState, frame: &Frame) {
        self.class
            .frame_pop_pending
            .resolve(self.class.name(), "frame_pop_pending")(self, buffer, frame)
    }

    /// Visit every object in `seg` as `(base, size)`.
    #[track_caller]
    pub fn walk(&self, seg: &Segment, visitor: &mut dyn FnMut(Address, usize)) {
        self.class.walk.resolve(self.class.name(), "walk")(self, seg, visitor)
    }

    /// Visit every free block in the pool.
    #[track_caller]
    pub fn free_walk(&self, visitor: &mut dyn FnMut(Address, usize)) {
        self.class.free_walk.resolve(self.class.name(), "free_walk")(self, visitor)
    }

    pub fn describe(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(
            out,
            "{} class={} attr={:?} segments={} buffers={}",
            self.id,
            self.class.name(),
            self.attr(),
            self.segment_count(),
            self.buffer_count()
        )?;
        self.class.describe.resolve(self.class.name(), "describe")(self, out)
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.id)
            .field("class", &self.class.name())
            .field("attr", &self.attr())
            .finish_non_exhaustive()
    }
}

/// Unallocated bytes across the pool's buffers: `Σ (limit - alloc)` over
/// buffers that still have room.
pub fn pool_scan_free_size(pool: &Pool) -> usize {
    pool.scan_free_size()
}
