//! Segments: pool-owned, page-aligned address ranges.
//!
//! A segment is the unit the collector colors and the shield protects. Each
//! segment keeps one two-bit color lane per trace identifier packed into a
//! single atomic word, so that the white, grey and black trace sets are
//! always read as one consistent snapshot.

use std::alloc::{self, Layout};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam_utils::Backoff;
use parking_lot::{Mutex, MutexGuard};

use crate::address::{AddrRange, Address};
use crate::error::{PoolError, PoolResult};
use crate::pool::PoolId;
use crate::trace_set::{AccessSet, Color, RefSet, TraceId, TraceSet};

/// Arena-unique segment identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct SegmentId(pub(crate) u64);

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seg#{}", self.0)
    }
}

/// Low bits of every color lane; a lane is non-zero when the segment takes
/// part in that trace.
const LANE_LOW: u64 = 0x5555_5555_5555_5555;
const LANE_HIGH: u64 = 0xAAAA_AAAA_AAAA_AAAA;

/// Protection bookkeeping driven by the shield.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ProtectionState {
    /// Accesses the collector wants trapped.
    pub shield: AccessSet,
    /// Accesses currently trapped by the platform.
    pub applied: AccessSet,
    /// Number of live expose guards.
    pub depth: usize,
}

/// Allocation bookkeeping for segment-buffered pools.
#[derive(Debug, Clone, Copy)]
struct SegmentFill {
    /// First byte not yet handed to a buffer.
    free: Address,
    /// End of the committed objects.
    committed: Address,
    buffered: bool,
}

pub struct Segment {
    id: SegmentId,
    pool: PoolId,
    range: AddrRange,
    layout: Layout,
    colors: AtomicU64,
    summary: AtomicUsize,
    protection: Mutex<ProtectionState>,
    fill: Mutex<SegmentFill>,
    scan_lock: Mutex<()>,
}

impl Segment {
    /// Allocate a zeroed, `align`-aligned block of `size` bytes.
    pub(crate) fn allocate(
        id: SegmentId,
        pool: PoolId,
        size: usize,
        align: usize,
    ) -> PoolResult<Self> {
        let layout = Layout::from_size_align(size, align)
            .map_err(|err| PoolError::InvalidConfig(err.to_string()))?;
        let base = unsafe { alloc::alloc_zeroed(layout) };
        if base.is_null() {
            return Err(PoolError::ResourceExhausted {
                requested: size,
                available: 0,
            });
        }
        let base = Address::from_ptr(base);
        Ok(Self {
            id,
            pool,
            range: AddrRange::with_size(base, size),
            layout,
            colors: AtomicU64::new(0),
            summary: AtomicUsize::new(RefSet::EMPTY.bits()),
            protection: Mutex::new(ProtectionState::default()),
            fill: Mutex::new(SegmentFill {
                free: base,
                committed: base,
                buffered: false,
            }),
            scan_lock: Mutex::new(()),
        })
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    pub fn pool(&self) -> PoolId {
        self.pool
    }

    pub fn range(&self) -> AddrRange {
        self.range
    }

    pub fn base(&self) -> Address {
        self.range.base()
    }

    pub fn limit(&self) -> Address {
        self.range.limit()
    }

    pub fn size(&self) -> usize {
        self.range.size()
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.range.contains(addr)
    }

    /// Color of this segment for `trace`, or `None` if it takes no part.
    pub fn color(&self, trace: TraceId) -> Option<Color> {
        let word = self.colors.load(Ordering::Acquire);
        Color::from_bits(word >> (trace.index() * 2))
    }

    fn lanes_matching(word: u64, color: Color) -> TraceSet {
        let wanted = color.to_bits();
        let mut bits = 0u32;
        for index in 0..TraceSet::CAPACITY {
            if (word >> (index * 2)) & 0b11 == wanted {
                bits |= 1 << index;
            }
        }
        TraceSet::from_bits(bits)
    }

    /// Traces for which this segment is white.
    pub fn white_set(&self) -> TraceSet {
        Self::lanes_matching(self.colors.load(Ordering::Acquire), Color::White)
    }

    /// Traces for which this segment is grey.
    pub fn grey_set(&self) -> TraceSet {
        Self::lanes_matching(self.colors.load(Ordering::Acquire), Color::Grey)
    }

    /// Traces for which this segment is black.
    pub fn black_set(&self) -> TraceSet {
        Self::lanes_matching(self.colors.load(Ordering::Acquire), Color::Black)
    }

    /// Traces this segment takes part in.
    pub fn trace_set(&self) -> TraceSet {
        let word = self.colors.load(Ordering::Acquire);
        let occupied = (word & LANE_LOW) | ((word & LANE_HIGH) >> 1);
        let mut bits = 0u32;
        for index in 0..TraceSet::CAPACITY {
            if (occupied >> (index * 2)) & 1 != 0 {
                bits |= 1 << index;
            }
        }
        TraceSet::from_bits(bits)
    }

    /// Compare-and-swap one color lane, retrying under contention.
    fn update_lane<F>(&self, trace: TraceId, mut decide: F) -> Result<Option<Color>, Option<Color>>
    where
        F: FnMut(Option<Color>) -> Option<Option<Color>>,
    {
        let shift = trace.index() * 2;
        let mask = 0b11u64 << shift;
        let backoff = Backoff::new();
        loop {
            let current = self.colors.load(Ordering::Acquire);
            let old = Color::from_bits(current >> shift);
            let Some(new) = decide(old) else {
                return Err(old);
            };
            let new_bits = new.map_or(0, Color::to_bits) << shift;
            let updated = (current & !mask) | new_bits;
            match self.colors.compare_exchange_weak(
                current,
                updated,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(old),
                Err(_) => backoff.spin(),
            }
        }
    }

    /// Set the color for `trace`, refusing to move it backwards.
    ///
    /// Returns the previous color. Setting the current color again is a no-op.
    pub fn set_color(&self, trace: TraceId, to: Color) -> PoolResult<Option<Color>> {
        self.update_lane(trace, |old| match old {
            Some(current) if current > to => None,
            _ => Some(Some(to)),
        })
        .map_err(|_| PoolError::BackwardColor { trace })
    }

    /// Atomically move `trace` from `from` to `to`.
    ///
    /// Fails if the lane is not currently `from` or if the move would go
    /// backwards along the wavefront.
    pub fn transition(&self, trace: TraceId, from: Option<Color>, to: Color) -> bool {
        if matches!(from, Some(current) if current > to) {
            return false;
        }
        self.update_lane(trace, |old| (old == from).then_some(Some(to)))
            .is_ok()
    }

    /// Move the lane forward to `to` if it is behind; never moves it back.
    ///
    /// Returns `true` if the color changed.
    pub fn advance(&self, trace: TraceId, to: Color) -> bool {
        matches!(
            self.update_lane(trace, |old| match old {
                Some(current) if current >= to => None,
                _ => Some(Some(to)),
            }),
            Ok(_)
        )
    }

    /// Drop all color state for a trace whose cycle has finished.
    pub(crate) fn clear_trace(&self, trace: TraceId) {
        let mask = !(0b11u64 << (trace.index() * 2));
        self.colors.fetch_and(mask, Ordering::AcqRel);
    }

    pub fn summary(&self) -> RefSet {
        RefSet::from_bits(self.summary.load(Ordering::Acquire))
    }

    pub fn set_summary(&self, summary: RefSet) {
        self.summary.store(summary.bits(), Ordering::Release);
    }

    pub fn widen_summary(&self, extra: RefSet) {
        self.summary.fetch_or(extra.bits(), Ordering::AcqRel);
    }

    pub(crate) fn protection(&self) -> MutexGuard<'_, ProtectionState> {
        self.protection.lock()
    }

    /// Accesses the shield currently wants trapped on this segment.
    pub fn shield_mode(&self) -> AccessSet {
        self.protection.lock().shield
    }

    /// Accesses currently trapped by the platform.
    pub fn protection_mode(&self) -> AccessSet {
        self.protection.lock().applied
    }

    /// Serialises scanning of this segment between the collector and
    /// faulting mutator threads.
    pub(crate) fn lock_scan(&self) -> MutexGuard<'_, ()> {
        self.scan_lock.lock()
    }

    /// Hand the unused tail to a buffer if it has room for `size` bytes.
    pub(crate) fn attach_buffer(&self, size: usize) -> Option<AddrRange> {
        let mut fill = self.fill.lock();
        if fill.buffered || self.limit() - fill.free < size {
            return None;
        }
        fill.buffered = true;
        Some(AddrRange::new(fill.free, self.limit()))
    }

    /// Take back the tail from `init` after the buffer detaches.
    pub(crate) fn detach_buffer(&self, init: Address) {
        let mut fill = self.fill.lock();
        debug_assert!(self.range.contains(init) || init == self.limit());
        fill.buffered = false;
        fill.free = init;
        fill.committed = init;
    }

    pub(crate) fn note_committed(&self, init: Address) {
        let mut fill = self.fill.lock();
        fill.committed = init;
    }

    pub fn has_buffer(&self) -> bool {
        self.fill.lock().buffered
    }

    /// End of the objects committed into this segment.
    pub fn committed(&self) -> Address {
        self.fill.lock().committed
    }

    /// Bytes never handed to a buffer.
    pub fn free_size(&self) -> usize {
        let fill = self.fill.lock();
        if fill.buffered { 0 } else { self.limit() - fill.free }
    }

    pub fn describe(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let protection = *self.protection.lock();
        writeln!(
            out,
            "  {} {:?} pool={} white={:?} grey={:?} black={:?} summary={:?} shield={:?} prot={:?}",
            self.id,
            self.range,
            self.pool,
            self.white_set(),
            self.grey_set(),
            self.black_set(),
            self.summary(),
            protection.shield,
            protection.applied,
        )
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.base().to_mut_ptr(), self.layout) };
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("range", &self.range)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment() -> Segment {
        Segment::allocate(SegmentId(1), PoolId(1), 4096, 4096).unwrap()
    }

    #[test]
    fn allocated_segment_is_aligned_and_zeroed() {
        let seg = segment();
        assert!(seg.base().is_aligned(4096));
        assert_eq!(seg.size(), 4096);
        let word: usize = unsafe { (seg.base() + 64).load() };
        assert_eq!(word, 0);
    }

    #[test]
    fn colors_advance_and_refuse_to_go_back() {
        let seg = segment();
        let t = TraceId::new(2);
        assert_eq!(seg.color(t), None);
        assert_eq!(seg.set_color(t, Color::White).unwrap(), None);
        assert!(seg.transition(t, Some(Color::White), Color::Grey));
        assert_eq!(seg.color(t), Some(Color::Grey));
        assert!(!seg.transition(t, Some(Color::Grey), Color::White));
        assert_eq!(
            seg.set_color(t, Color::White),
            Err(PoolError::BackwardColor { trace: t })
        );
        assert!(seg.advance(t, Color::Black));
        assert!(!seg.advance(t, Color::Grey));
        assert_eq!(seg.color(t), Some(Color::Black));
    }

    #[test]
    fn trace_sets_are_derived_from_lanes() {
        let seg = segment();
        let (t0, t1, t5) = (TraceId::new(0), TraceId::new(1), TraceId::new(5));
        seg.set_color(t0, Color::White).unwrap();
        seg.set_color(t1, Color::Grey).unwrap();
        seg.set_color(t5, Color::Black).unwrap();
        assert_eq!(seg.white_set(), TraceSet::single(t0));
        assert_eq!(seg.grey_set(), TraceSet::single(t1));
        assert_eq!(seg.black_set(), TraceSet::single(t5));
        assert_eq!(seg.trace_set(), TraceSet::single(t0).add(t1).add(t5));

        seg.clear_trace(t1);
        assert_eq!(seg.color(t1), None);
        assert_eq!(seg.color(t0), Some(Color::White));
    }

    #[test]
    fn buffer_attach_hands_out_tail_once() {
        let seg = segment();
        let range = seg.attach_buffer(128).unwrap();
        assert_eq!(range, seg.range());
        assert!(seg.attach_buffer(8).is_none());
        seg.note_committed(seg.base() + 256);
        assert_eq!(seg.committed(), seg.base() + 256);
        seg.detach_buffer(seg.base() + 256);
        assert_eq!(seg.free_size(), 4096 - 256);
        assert!(seg.attach_buffer(4096).is_none());
    }
}
