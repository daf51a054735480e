//! Traces: one collection cycle each.
//!
//! A trace moves through `Inactive → Started → Flipped → Scanning →
//! Reclaiming → Done`. The driving operations live on
//! [`Arena`](crate::arena::Arena) because every step touches segments and
//! pools the arena owns; this module holds the per-trace record.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::segment::Segment;
use crate::trace_set::{RefSet, TraceId};

/// Trace lifecycle state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TraceState {
    /// Created; segments may be condemned.
    Inactive = 0,
    /// Condemned set whitened and grey set chosen.
    Started = 1,
    /// Barriers raised and roots scanned. From here the trace must finish.
    Flipped = 2,
    Scanning = 3,
    Reclaiming = 4,
    /// Identifier released.
    Done = 5,
}

impl TraceState {
    fn from_u8(value: u8) -> TraceState {
        match value {
            0 => TraceState::Inactive,
            1 => TraceState::Started,
            2 => TraceState::Flipped,
            3 => TraceState::Scanning,
            4 => TraceState::Reclaiming,
            _ => TraceState::Done,
        }
    }

    /// Started but not finished.
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            TraceState::Started | TraceState::Flipped | TraceState::Scanning | TraceState::Reclaiming
        )
    }

    /// The mutator is black for this trace.
    pub fn is_flipped(self) -> bool {
        matches!(
            self,
            TraceState::Flipped | TraceState::Scanning | TraceState::Reclaiming
        )
    }
}

/// Why a trace was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceReason {
    /// Driven step by step by the client.
    Explicit,
    /// Started by [`Arena::collect`](crate::arena::Arena::collect).
    Collect,
}

/// Work counters for one trace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraceStats {
    pub condemned_segments: usize,
    pub condemned_bytes: usize,
    pub greyed_segments: usize,
    pub scanned_segments: usize,
    pub scanned_bytes: usize,
    pub fixed_refs: usize,
    pub reclaimed_segments: usize,
    pub reclaimed_bytes: usize,
}

#[derive(Default)]
struct TraceCounters {
    condemned_segments: AtomicUsize,
    condemned_bytes: AtomicUsize,
    greyed_segments: AtomicUsize,
    scanned_segments: AtomicUsize,
    scanned_bytes: AtomicUsize,
    fixed_refs: AtomicUsize,
    reclaimed_segments: AtomicUsize,
    reclaimed_bytes: AtomicUsize,
}

pub struct Trace {
    id: TraceId,
    reason: TraceReason,
    state: AtomicU8,
    condemned: Mutex<Vec<Arc<Segment>>>,
    white: AtomicUsize,
    counters: TraceCounters,
}

impl Trace {
    pub(crate) fn new(id: TraceId, reason: TraceReason) -> Self {
        Self {
            id,
            reason,
            state: AtomicU8::new(TraceState::Inactive as u8),
            condemned: Mutex::new(Vec::new()),
            white: AtomicUsize::new(RefSet::EMPTY.bits()),
            counters: TraceCounters::default(),
        }
    }

    pub fn id(&self) -> TraceId {
        self.id
    }

    pub fn reason(&self) -> TraceReason {
        self.reason
    }

    pub fn state(&self) -> TraceState {
        TraceState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`; fails if another caller got there first.
    pub(crate) fn transition(&self, from: TraceState, to: TraceState) -> Result<(), TraceState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(TraceState::from_u8)
    }

    /// Zones holding condemned segments.
    pub fn white(&self) -> RefSet {
        RefSet::from_bits(self.white.load(Ordering::Acquire))
    }

    pub(crate) fn condemn(&self, seg: Arc<Segment>, zones: RefSet) {
        self.white.fetch_or(zones.bits(), Ordering::AcqRel);
        self.counters.condemned_segments.fetch_add(1, Ordering::Relaxed);
        self.counters
            .condemned_bytes
            .fetch_add(seg.size(), Ordering::Relaxed);
        self.condemned.lock().push(seg);
    }

    pub fn condemned(&self) -> Vec<Arc<Segment>> {
        self.condemned.lock().clone()
    }

    pub(crate) fn take_condemned(&self) -> Vec<Arc<Segment>> {
        std::mem::take(&mut *self.condemned.lock())
    }

    pub(crate) fn note_greyed(&self) {
        self.counters.greyed_segments.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_scanned(&self, bytes: usize, fixed: usize) {
        self.counters.scanned_segments.fetch_add(1, Ordering::Relaxed);
        self.counters.scanned_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.counters.fixed_refs.fetch_add(fixed, Ordering::Relaxed);
    }

    pub(crate) fn note_fixed(&self, fixed: usize) {
        self.counters.fixed_refs.fetch_add(fixed, Ordering::Relaxed);
    }

    pub(crate) fn note_reclaimed(&self, bytes: usize) {
        self.counters
            .reclaimed_segments
            .fetch_add(1, Ordering::Relaxed);
        self.counters
            .reclaimed_bytes
            .fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn stats(&self) -> TraceStats {
        let c = &self.counters;
        TraceStats {
            condemned_segments: c.condemned_segments.load(Ordering::Relaxed),
            condemned_bytes: c.condemned_bytes.load(Ordering::Relaxed),
            greyed_segments: c.greyed_segments.load(Ordering::Relaxed),
            scanned_segments: c.scanned_segments.load(Ordering::Relaxed),
            scanned_bytes: c.scanned_bytes.load(Ordering::Relaxed),
            fixed_refs: c.fixed_refs.load(Ordering::Relaxed),
            reclaimed_segments: c.reclaimed_segments.load(Ordering::Relaxed),
            reclaimed_bytes: c.reclaimed_bytes.load(Ordering::Relaxed),
        }
    }

    pub fn describe(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let stats = self.stats();
        writeln!(
            out,
            "trace {} {:?} reason={:?} white={:?}",
            self.id,
            self.state(),
            self.reason,
            self.white()
        )?;
        writeln!(
            out,
            "  condemned {} segments ({} bytes), scanned {} ({} bytes), fixed {}, reclaimed {} ({} bytes)",
            stats.condemned_segments,
            stats.condemned_bytes,
            stats.scanned_segments,
            stats.scanned_bytes,
            stats.fixed_refs,
            stats.reclaimed_segments,
            stats.reclaimed_bytes
        )
    }
}

impl fmt::Debug for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trace")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("reason", &self.reason)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_are_compare_and_swap() {
        let trace = Trace::new(TraceId::new(0), TraceReason::Explicit);
        assert_eq!(trace.state(), TraceState::Inactive);
        trace
            .transition(TraceState::Inactive, TraceState::Started)
            .unwrap();
        assert_eq!(
            trace.transition(TraceState::Inactive, TraceState::Started),
            Err(TraceState::Started)
        );
        assert!(trace.state().is_busy());
        assert!(!trace.state().is_flipped());
    }

    #[test]
    fn busy_and_flipped_partition_the_lifecycle() {
        let flipped: Vec<_> = (0..=5)
            .map(TraceState::from_u8)
            .filter(|s| s.is_flipped())
            .collect();
        assert_eq!(
            flipped,
            vec![
                TraceState::Flipped,
                TraceState::Scanning,
                TraceState::Reclaiming
            ]
        );
        assert!(!TraceState::Done.is_busy());
        assert!(!TraceState::Inactive.is_busy());
    }

    #[test]
    fn describe_reports_counters() {
        let trace = Trace::new(TraceId::new(3), TraceReason::Collect);
        trace.note_scanned(4096, 2);
        trace.note_reclaimed(8192);
        let mut out = String::new();
        trace.describe(&mut out).unwrap();
        assert!(out.starts_with("trace T3 Inactive reason=Collect"));
        assert!(out.contains("fixed 2, reclaimed 1 (8192 bytes)"));
    }
}
