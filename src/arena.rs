//! The arena: owner of pools, segments, traces, roots and the shield.
//!
//! Every segment is registered in an id table and an address index, so that
//! scanning can map any candidate reference back to its segment and pool.
//! Up to `max_traces` traces can be live at once; each one owns a two-bit
//! color lane in every segment.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::address::{Address, WORD};
use crate::buffer;
use crate::config::{ArenaConfig, ProtectionMode};
use crate::error::{PoolError, PoolResult};
use crate::pool::{Pool, PoolAttr, PoolClass, PoolId, PoolState};
use crate::roots::{RootId, RootRegistry};
use crate::scan::ScanState;
use crate::segment::{Segment, SegmentId};
use crate::shield::{FaultDescriptor, FaultOutcome, FaultPort, MutatorFaultContext, Protector, Shield, SoftwareProtector};
use crate::trace::{Trace, TraceReason, TraceState, TraceStats};
use crate::trace_set::{AccessSet, Color, RefSet, TraceId, TraceSet};

/// Snapshot of arena-wide counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaStats {
    pub committed_bytes: usize,
    pub segment_count: usize,
    pub pool_count: usize,
    pub live_traces: usize,
    pub traces_completed: usize,
    pub flips: u64,
}

pub struct Arena {
    config: ArenaConfig,
    self_ref: Weak<Arena>,
    pools: DashMap<PoolId, Arc<Pool>>,
    segments: DashMap<SegmentId, Arc<Segment>>,
    /// Segment base address to id.
    seg_index: RwLock<BTreeMap<usize, SegmentId>>,
    traces: Mutex<Vec<Option<Arc<Trace>>>>,
    shield: Shield,
    roots: RootRegistry,
    faults: FaultPort,
    committed: AtomicUsize,
    next_pool: AtomicU64,
    next_segment: AtomicU64,
    traces_completed: AtomicUsize,
    flips: AtomicU64,
}

impl Arena {
    /// Create an arena with the protector named by `config.protection`.
    pub fn new(config: ArenaConfig) -> PoolResult<Arc<Self>> {
        let protector: Box<dyn Protector> = match config.protection {
            ProtectionMode::Software => Box::new(SoftwareProtector::new()),
            #[cfg(unix)]
            ProtectionMode::Mprotect => {
                Box::new(crate::shield::MprotectProtector::new(config.page_size))
            }
            #[cfg(not(unix))]
            ProtectionMode::Mprotect => {
                return Err(PoolError::InvalidConfig(
                    "mprotect protection needs a unix platform".to_string(),
                ));
            }
        };
        Self::with_protector(config, protector)
    }

    pub fn with_protector(config: ArenaConfig, protector: Box<dyn Protector>) -> PoolResult<Arc<Self>> {
        config.validate()?;
        debug!(
            segment_size = config.segment_size,
            commit_limit = config.commit_limit,
            max_traces = config.max_traces,
            protector = protector.name(),
            "arena created"
        );
        Ok(Arc::new_cyclic(|self_ref| Self {
            traces: Mutex::new(vec![None; config.max_traces]),
            config,
            self_ref: self_ref.clone(),
            pools: DashMap::new(),
            segments: DashMap::new(),
            seg_index: RwLock::new(BTreeMap::new()),
            shield: Shield::new(protector),
            roots: RootRegistry::new(),
            faults: FaultPort::new(),
            committed: AtomicUsize::new(0),
            next_pool: AtomicU64::new(1),
            next_segment: AtomicU64::new(1),
            traces_completed: AtomicUsize::new(0),
            flips: AtomicU64::new(0),
        }))
    }

    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    pub fn shield(&self) -> &Shield {
        &self.shield
    }

    pub fn roots(&self) -> &RootRegistry {
        &self.roots
    }

    /// Where barrier hits are queued for [`Arena::process_faults`].
    pub fn fault_port(&self) -> &FaultPort {
        &self.faults
    }

    /// Total bytes held in segments.
    pub fn committed(&self) -> usize {
        self.committed.load(Ordering::Acquire)
    }

    // Pools

    /// Check the class, then create and initialise a pool of it.
    pub fn create_pool(&self, class: PoolClass, state: PoolState) -> PoolResult<Arc<Pool>> {
        class.check()?;
        let id = PoolId(self.next_pool.fetch_add(1, Ordering::Relaxed));
        let pool = Arc::new(Pool::new(id, Arc::new(class), self.self_ref.clone(), state));
        self.pools.insert(id, Arc::clone(&pool));
        if let Err(err) = pool.init() {
            self.pools.remove(&id);
            return Err(err);
        }
        debug!(pool = %id, class = pool.class().name(), attr = ?pool.attr(), "pool created");
        Ok(pool)
    }

    /// Finish the pool and free whatever segments it still holds.
    pub fn destroy_pool(&self, pool: &Arc<Pool>) {
        pool.finish();
        for seg in pool.segments() {
            self.segment_free(&seg);
        }
        self.pools.remove(&pool.id());
        debug!(pool = %pool.id(), "pool destroyed");
    }

    /// The live pool with `id`, if it has not been destroyed.
    pub fn pool_of(&self, id: PoolId) -> Option<Arc<Pool>> {
        self.pools.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn pools(&self) -> Vec<Arc<Pool>> {
        let mut pools: Vec<_> = self
            .pools
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        pools.sort_by_key(|pool| pool.id());
        pools
    }

    // Segments

    fn reserve_commit(&self, size: usize) -> PoolResult<()> {
        let limit = self.config.commit_limit;
        self.committed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |committed| {
                committed.checked_add(size).filter(|total| *total <= limit)
            })
            .map(|_| ())
            .map_err(|committed| PoolError::ResourceExhausted {
                requested: size,
                available: limit.saturating_sub(committed),
            })
    }

    /// Allocate a segment of at least `size` bytes for `pool`.
    ///
    /// Segments of scanning pools start with a universal summary, and are
    /// black for every trace that has already flipped.
    pub fn segment_alloc(&self, pool: &Pool, size: usize) -> PoolResult<Arc<Segment>> {
        let page = self.config.page_size;
        let size = size
            .max(self.config.segment_size)
            .div_ceil(page)
            .checked_mul(page)
            .ok_or(PoolError::ResourceExhausted {
                requested: size,
                available: self.config.commit_limit.saturating_sub(self.committed()),
            })?;
        self.reserve_commit(size)?;

        let id = SegmentId(self.next_segment.fetch_add(1, Ordering::Relaxed));
        let seg = match Segment::allocate(id, pool.id(), size, page) {
            Ok(seg) => Arc::new(seg),
            Err(err) => {
                self.committed.fetch_sub(size, Ordering::AcqRel);
                return Err(err);
            }
        };
        if pool.attr().contains(PoolAttr::SCAN) {
            seg.set_summary(RefSet::UNIVERSE);
            for trace in self.flipped_traces().iter() {
                seg.set_color(trace, Color::Black)?;
            }
        }

        self.seg_index.write().insert(seg.base().as_usize(), id);
        self.segments.insert(id, Arc::clone(&seg));
        pool.add_segment(Arc::clone(&seg));
        debug!(segment = %id, pool = %pool.id(), size, base = %seg.base(), "segment allocated");
        Ok(seg)
    }

    /// Unregister a segment and drop its protection. Its memory is released
    /// once the last reference to it goes away. Freeing twice is a no-op.
    pub fn segment_free(&self, seg: &Segment) {
        if self.segments.remove(&seg.id()).is_none() {
            return;
        }
        self.seg_index.write().remove(&seg.base().as_usize());
        if let Some(pool) = self.pool_of(seg.pool()) {
            pool.remove_segment(seg.id());
        }
        self.shield.release(seg);
        self.committed.fetch_sub(seg.size(), Ordering::AcqRel);
        debug!(segment = %seg.id(), pool = %seg.pool(), size = seg.size(), "segment freed");
    }

    pub fn segment(&self, id: SegmentId) -> Option<Arc<Segment>> {
        self.segments.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// The segment containing `addr`.
    pub fn segment_of(&self, addr: Address) -> Option<Arc<Segment>> {
        let id = {
            let index = self.seg_index.read();
            let (_, id) = index.range(..=addr.as_usize()).next_back()?;
            *id
        };
        let seg = self.segment(id)?;
        seg.contains(addr).then_some(seg)
    }

    /// All registered segments, in allocation order.
    pub fn segments(&self) -> Vec<Arc<Segment>> {
        let mut segments: Vec<_> = self
            .segments
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        segments.sort_by_key(|seg| seg.id());
        segments
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Visit the objects of every segment of `pool`, exposing each segment
    /// while its pool walks it.
    pub fn walk(&self, pool: &Pool, visitor: &mut dyn FnMut(Address, usize)) -> PoolResult<()> {
        for seg in pool.segments() {
            let _exposed = self.shield.expose(&seg)?;
            pool.walk(&seg, visitor);
        }
        Ok(())
    }

    // Traces

    /// The live trace holding `id`. Ids are reused once a trace is done.
    pub fn trace(&self, id: TraceId) -> Option<Arc<Trace>> {
        self.traces.lock().get(id.index()).cloned().flatten()
    }

    fn live_traces(&self) -> Vec<Arc<Trace>> {
        self.traces.lock().iter().flatten().cloned().collect()
    }

    /// Traces that have started and not yet finished.
    pub fn busy_traces(&self) -> TraceSet {
        self.live_traces()
            .iter()
            .filter(|trace| trace.state().is_busy())
            .map(|trace| trace.id())
            .collect()
    }

    /// Traces past their flip, for which the mutator is black.
    pub fn flipped_traces(&self) -> TraceSet {
        self.live_traces()
            .iter()
            .filter(|trace| trace.state().is_flipped())
            .map(|trace| trace.id())
            .collect()
    }

    pub(crate) fn white_zones(&self, traces: TraceSet) -> RefSet {
        self.live_traces()
            .iter()
            .filter(|trace| traces.contains(trace.id()))
            .fold(RefSet::EMPTY, |zones, trace| zones.union(trace.white()))
    }

    /// Claim a free trace identifier.
    pub fn trace_create(&self, reason: TraceReason) -> PoolResult<Arc<Trace>> {
        let mut table = self.traces.lock();
        let index = table
            .iter()
            .position(Option::is_none)
            .ok_or(PoolError::TraceLimit)?;
        let trace = Arc::new(Trace::new(TraceId::new(index), reason));
        table[index] = Some(Arc::clone(&trace));
        debug!(trace = %trace.id(), ?reason, "trace created");
        Ok(trace)
    }

    fn advance_state(&self, trace: &Trace, from: TraceState, to: TraceState) -> PoolResult<()> {
        trace
            .transition(from, to)
            .map_err(|actual| PoolError::InvalidTraceState {
                trace: trace.id(),
                expected: from,
                actual,
            })?;
        debug!(trace = %trace.id(), ?from, ?to, "trace state");
        Ok(())
    }

    fn release_trace(&self, trace: &Trace) {
        let mut table = self.traces.lock();
        if let Some(slot) = table.get_mut(trace.id().index()) {
            if slot.as_ref().is_some_and(|live| std::ptr::eq(live.as_ref(), trace)) {
                *slot = None;
            }
        }
    }

    /// Whiten `seg` for `trace`, adding it to the condemned set.
    pub fn trace_condemn(&self, trace: &Trace, seg: &Arc<Segment>) -> PoolResult<()> {
        let state = trace.state();
        if state != TraceState::Inactive {
            return Err(PoolError::InvalidTraceState {
                trace: trace.id(),
                expected: TraceState::Inactive,
                actual: state,
            });
        }
        if seg.color(trace.id()).is_some() {
            return Ok(());
        }
        let pool = self
            .pool_of(seg.pool())
            .ok_or(PoolError::UnknownSegment(seg.base()))?;
        pool.whiten(seg, trace)?;
        trace.condemn(
            Arc::clone(seg),
            RefSet::of_range(seg.range(), self.config.zone_shift),
        );
        trace!(trace = %trace.id(), segment = %seg.id(), "condemned");
        Ok(())
    }

    /// Condemn every segment of `pool` that no buffer is allocating into.
    /// Returns how many were condemned.
    pub fn trace_condemn_pool(&self, trace: &Trace, pool: &Pool) -> PoolResult<usize> {
        let mut condemned = 0;
        for seg in pool.segments() {
            if seg.has_buffer() {
                continue;
            }
            self.trace_condemn(trace, &seg)?;
            condemned += 1;
        }
        Ok(condemned)
    }

    /// Grey `seg` for `trace` if it has no color yet and its summary says it
    /// may reference the condemned zones, then put up its barriers.
    fn grey_if_summarised(&self, seg: &Segment, pool: &Pool, trace: &Trace) -> PoolResult<bool> {
        if seg.color(trace.id()).is_some()
            || !pool.attr().contains(PoolAttr::SCAN)
            || !seg.summary().intersects(trace.white())
        {
            return Ok(false);
        }
        pool.grey(seg, trace);
        trace.note_greyed();
        self.reshield(seg)?;
        Ok(true)
    }

    fn grey_by_summary(&self, trace: &Trace) -> PoolResult<()> {
        for seg in self.segments() {
            if let Some(pool) = self.pool_of(seg.pool()) {
                self.grey_if_summarised(&seg, &pool, trace)?;
            }
        }
        Ok(())
    }

    /// Choose the grey set: every scannable segment outside the condemned
    /// set whose summary intersects the condemned zones. Segments with
    /// narrowed summaries get a write barrier for as long as a trace is busy.
    pub fn trace_start(&self, trace: &Trace) -> PoolResult<()> {
        self.advance_state(trace, TraceState::Inactive, TraceState::Started)?;
        self.grey_by_summary(trace)?;
        for seg in self.segments() {
            self.reshield(&seg)?;
        }
        debug!(
            trace = %trace.id(),
            condemned = trace.stats().condemned_segments,
            greyed = trace.stats().greyed_segments,
            white = ?trace.white(),
            "trace started"
        );
        Ok(())
    }

    /// Make the mutator black for `trace`.
    ///
    /// Buffers of scanning pools are trapped so that objects reserved before
    /// the flip are re-initialised, late summary changes are picked up, the
    /// roots are scanned, and read barriers go up on every white and grey
    /// segment. Once this returns the trace has to run to completion.
    pub fn trace_flip(&self, trace: &Trace) -> PoolResult<()> {
        self.advance_state(trace, TraceState::Started, TraceState::Flipped)?;
        self.flips.fetch_add(1, Ordering::AcqRel);

        for pool in self.pools() {
            if pool.attr().contains(PoolAttr::SCAN) {
                for state in pool.buffer_states() {
                    buffer::trap(&pool, &mut state.lock());
                }
            }
        }

        self.grey_by_summary(trace)?;

        let mut ss = ScanState::new(self, TraceSet::single(trace.id()));
        self.roots.scan_all(&mut ss)?;
        trace.note_fixed(ss.fixed_count());

        for seg in self.segments() {
            if seg.trace_set().contains(trace.id()) {
                self.reshield(&seg)?;
            }
        }
        debug!(trace = %trace.id(), roots = self.roots.len(), fixed = ss.fixed_count(), "trace flipped");
        Ok(())
    }

    /// Do one bounded step of work: enter scanning, scan one grey segment,
    /// or reclaim. Returns the state after the step.
    pub fn trace_advance(&self, trace: &Trace) -> PoolResult<TraceState> {
        match trace.state() {
            TraceState::Flipped => {
                self.advance_state(trace, TraceState::Flipped, TraceState::Scanning)?;
                Ok(TraceState::Scanning)
            }
            TraceState::Scanning => {
                let grey = self
                    .segments()
                    .into_iter()
                    .find(|seg| seg.grey_set().contains(trace.id()));
                match grey {
                    Some(seg) => {
                        self.scan_segment(&seg, self.flipped_traces())?;
                        Ok(TraceState::Scanning)
                    }
                    None => {
                        self.advance_state(trace, TraceState::Scanning, TraceState::Reclaiming)?;
                        Ok(TraceState::Reclaiming)
                    }
                }
            }
            TraceState::Reclaiming => {
                self.reclaim(trace)?;
                Ok(TraceState::Done)
            }
            actual => Err(PoolError::InvalidTraceState {
                trace: trace.id(),
                expected: TraceState::Flipped,
                actual,
            }),
        }
    }

    fn reclaim(&self, trace: &Trace) -> PoolResult<()> {
        for seg in trace.take_condemned() {
            if seg.color(trace.id()) != Some(Color::White) || self.segment(seg.id()).is_none() {
                continue;
            }
            if let Some(pool) = self.pool_of(seg.pool()) {
                trace!(trace = %trace.id(), segment = %seg.id(), "reclaim");
                trace.note_reclaimed(seg.size());
                pool.reclaim(&seg, trace);
            }
        }

        for seg in self.segments() {
            seg.clear_trace(trace.id());
        }
        self.advance_state(trace, TraceState::Reclaiming, TraceState::Done)?;
        self.release_trace(trace);
        self.traces_completed.fetch_add(1, Ordering::AcqRel);

        for seg in self.segments() {
            self.reshield(&seg)?;
        }
        let stats = trace.stats();
        debug!(
            trace = %trace.id(),
            scanned = stats.scanned_segments,
            reclaimed = stats.reclaimed_segments,
            reclaimed_bytes = stats.reclaimed_bytes,
            "trace done"
        );
        Ok(())
    }

    /// Drive `trace` to `Done`, starting and flipping it first if needed.
    pub fn trace_run(&self, trace: &Trace) -> PoolResult<TraceStats> {
        if trace.state() == TraceState::Inactive {
            self.trace_start(trace)?;
        }
        if trace.state() == TraceState::Started {
            self.trace_flip(trace)?;
        }
        while self.trace_advance(trace)? != TraceState::Done {}
        Ok(trace.stats())
    }

    /// Abandon a trace that has not flipped, dropping its colors.
    pub fn trace_destroy(&self, trace: &Trace) -> PoolResult<()> {
        let state = trace.state();
        let from = match state {
            TraceState::Inactive | TraceState::Started => state,
            actual => {
                return Err(PoolError::InvalidTraceState {
                    trace: trace.id(),
                    expected: TraceState::Inactive,
                    actual,
                });
            }
        };
        self.advance_state(trace, from, TraceState::Done)?;
        trace.take_condemned();
        for seg in self.segments() {
            seg.clear_trace(trace.id());
        }
        self.release_trace(trace);
        for seg in self.segments() {
            self.reshield(&seg)?;
        }
        Ok(())
    }

    /// Collect every collectible pool in one trace.
    pub fn collect(&self) -> PoolResult<TraceStats> {
        let trace = self.trace_create(TraceReason::Collect)?;
        for pool in self.pools() {
            if !pool.attr().contains(PoolAttr::GC) {
                continue;
            }
            if let Err(err) = self.trace_condemn_pool(&trace, &pool) {
                self.trace_destroy(&trace)?;
                return Err(err);
            }
        }
        self.trace_run(&trace)
    }

    // Scanning and barriers

    /// Grey `seg` for those of `traces` it is white for.
    pub fn grey_for(&self, seg: &Segment, traces: TraceSet) -> PoolResult<()> {
        let whites = seg.white_set().inter(traces);
        if whites.is_empty() {
            return Ok(());
        }
        let pool = self
            .pool_of(seg.pool())
            .ok_or(PoolError::UnknownSegment(seg.base()))?;
        for id in whites.iter() {
            if let Some(trace) = self.trace(id) {
                pool.grey(seg, &trace);
                trace.note_greyed();
            }
        }
        self.reshield(seg)
    }

    /// Scan `seg` for those of `traces` it is grey for, then blacken it.
    pub fn scan_segment(&self, seg: &Arc<Segment>, traces: TraceSet) -> PoolResult<()> {
        let _scanning = seg.lock_scan();
        let traces = traces.inter(seg.grey_set());
        if traces.is_empty() {
            return Ok(());
        }
        let pool = self
            .pool_of(seg.pool())
            .ok_or(PoolError::UnknownSegment(seg.base()))?;

        let mut ss = ScanState::new(self, traces);
        let total = {
            let _exposed = self.shield.expose(seg)?;
            pool.scan(seg, &mut ss)?
        };
        if total && !seg.has_buffer() {
            seg.set_summary(ss.summary());
        } else {
            seg.widen_summary(ss.summary());
        }
        pool.blacken(seg, traces);

        for id in traces.iter() {
            if let Some(trace) = self.trace(id) {
                trace.note_scanned(ss.scanned_bytes(), ss.fixed_count());
            }
        }
        trace!(
            segment = %seg.id(),
            ?traces,
            total,
            fixed = ss.fixed_count(),
            summary = ?seg.summary(),
            "segment scanned"
        );
        self.reshield(seg)
    }

    /// Fix the single reference word at `addr` for every flipped trace the
    /// segment is grey for. The caller must have exposed the segment.
    pub(crate) fn scan_single_ref(&self, seg: &Segment, addr: Address) -> PoolResult<()> {
        let traces = seg.grey_set().inter(self.flipped_traces());
        if traces.is_empty() {
            return Ok(());
        }
        let slot = addr.align_down(WORD);
        if slot < seg.base() || slot + WORD > seg.limit() {
            return Err(PoolError::UnknownSegment(addr));
        }
        let mut ss = ScanState::new(self, traces);
        unsafe { ss.fix_slot(slot)? };
        seg.widen_summary(ss.summary());
        trace!(segment = %seg.id(), %slot, fixed = ss.fixed_count(), "single reference scanned");
        Ok(())
    }

    /// Whole-segment access: scan on a read barrier hit, widen the summary
    /// on a write barrier hit, then recompute the barriers.
    pub fn segment_access(&self, seg: &Arc<Segment>, mode: AccessSet) -> PoolResult<()> {
        if mode.contains(AccessSet::READ) {
            self.grey_on_read(seg)?;
            self.scan_segment(seg, self.flipped_traces())?;
        }
        if mode.contains(AccessSet::WRITE) {
            self.note_write(seg)?;
        }
        self.reshield(seg)
    }

    /// Grey `seg` for every flipped trace it is still white for. A segment
    /// the mutator reads is reachable.
    pub(crate) fn grey_on_read(&self, seg: &Segment) -> PoolResult<()> {
        self.grey_for(seg, seg.white_set().inter(self.flipped_traces()))
    }

    /// A write may store any reference: widen the summary and grey the
    /// segment for busy traces that have not flipped yet.
    pub(crate) fn note_write(&self, seg: &Segment) -> PoolResult<()> {
        seg.set_summary(RefSet::UNIVERSE);
        let Some(pool) = self.pool_of(seg.pool()) else {
            return Ok(());
        };
        let unflipped = self.busy_traces().diff(self.flipped_traces());
        for id in unflipped.iter() {
            if let Some(trace) = self.trace(id) {
                self.grey_if_summarised(seg, &pool, &trace)?;
            }
        }
        Ok(())
    }

    /// Recompute the barriers `seg` needs.
    ///
    /// Read barrier while it is white or grey for a flipped trace; write
    /// barrier while any trace is busy and the segment of a scanning pool
    /// has a narrowed summary.
    pub(crate) fn reshield(&self, seg: &Segment) -> PoolResult<()> {
        self.shield.set_with(seg, || self.barrier_mode(seg))
    }

    fn barrier_mode(&self, seg: &Segment) -> AccessSet {
        let mut mode = AccessSet::empty();
        if seg
            .white_set()
            .union(seg.grey_set())
            .intersects(self.flipped_traces())
        {
            mode |= AccessSet::READ;
        }
        if !seg.summary().is_universe()
            && !self.busy_traces().is_empty()
            && self
                .pool_of(seg.pool())
                .is_some_and(|pool| pool.attr().contains(PoolAttr::SCAN))
        {
            mode |= AccessSet::WRITE;
        }
        mode
    }

    // Faults

    /// Dispatch a protection fault to the owning pool's access method.
    pub fn handle_fault(&self, fault: &FaultDescriptor) -> PoolResult<FaultOutcome> {
        let Some(seg) = self.segment_of(fault.address) else {
            return Ok(FaultOutcome::NotOurs);
        };
        let applied = seg.protection_mode();
        let mut mode = fault.mode & applied;
        // A read barrier traps every access.
        if applied.contains(AccessSet::READ) {
            mode |= AccessSet::READ;
        }
        if mode.is_empty() {
            return Ok(FaultOutcome::Spurious);
        }
        let pool = self
            .pool_of(seg.pool())
            .ok_or(PoolError::UnknownSegment(fault.address))?;
        trace!(address = %fault.address, segment = %seg.id(), ?mode, "fault");
        let mut context = MutatorFaultContext::new(fault);
        pool.access(&seg, fault.address, mode, &mut context)?;
        Ok(FaultOutcome::Handled)
    }

    /// Handle every fault queued on the fault port.
    pub fn process_faults(&self) -> usize {
        self.faults.process(self)
    }

    // Roots

    /// Register the reference words in `[base, limit)` as a root.
    ///
    /// # Safety
    /// The words must stay valid, and hold only null or heap references,
    /// until the root is destroyed.
    pub unsafe fn root_create_table(&self, base: Address, limit: Address) -> RootId {
        unsafe { self.roots.create_table(base, limit) }
    }

    /// Register a root that fixes its references through `scan`.
    ///
    /// # Examples
    ///
    /// ```
    /// use poolgc::{Arena, ArenaConfig};
    ///
    /// let arena = Arena::new(ArenaConfig::default()).unwrap();
    /// let root = arena.root_create_fn(|_ss| Ok(()));
    /// assert_eq!(arena.roots().len(), 1);
    /// assert!(arena.root_destroy(root));
    /// assert!(!arena.root_destroy(root));
    /// ```
    pub fn root_create_fn<F>(&self, scan: F) -> RootId
    where
        F: Fn(&mut ScanState<'_>) -> PoolResult<()> + Send + Sync + 'static,
    {
        self.roots.create_fn(scan)
    }

    /// Forget a root. Returns false if it was already gone.
    pub fn root_destroy(&self, id: RootId) -> bool {
        self.roots.destroy(id)
    }

    // Diagnostics

    /// A point-in-time snapshot; counters may move while it is taken.
    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            committed_bytes: self.committed(),
            segment_count: self.segments.len(),
            pool_count: self.pools.len(),
            live_traces: self.live_traces().len(),
            traces_completed: self.traces_completed.load(Ordering::Acquire),
            flips: self.flips.load(Ordering::Acquire),
        }
    }

    /// Dump the arena, then each pool followed by its segments.
    pub fn describe(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let stats = self.stats();
        writeln!(
            out,
            "arena committed={} limit={} segments={} pools={} shield={}",
            stats.committed_bytes,
            self.config.commit_limit,
            stats.segment_count,
            stats.pool_count,
            self.shield.protector().name()
        )?;
        for pool in self.pools() {
            pool.describe(out)?;
            for seg in pool.segments() {
                seg.describe(out)?;
            }
        }
        for trace in self.live_traces() {
            trace.describe(out)?;
        }
        Ok(())
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        for entry in self.segments.iter() {
            self.shield.release(entry.value());
        }
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
