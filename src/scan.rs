//! Scan state threaded through a pool's `scan` and `fix` methods.

use std::fmt;

use tracing::trace;

use crate::address::{Address, WORD};
use crate::arena::Arena;
use crate::error::PoolResult;
use crate::trace_set::{RefSet, TraceSet};

/// One scanning pass on behalf of a set of traces.
///
/// Fixing a reference first rejects it by zone, then by segment color; only
/// references into segments white for one of the scanning traces reach the
/// owning pool's `fix`. Every non-null reference seen is folded into the
/// summary the scanned segment ends up with.
pub struct ScanState<'a> {
    arena: &'a Arena,
    traces: TraceSet,
    white: RefSet,
    zone_shift: u32,
    summary: RefSet,
    fixed: usize,
    scanned: usize,
}

impl<'a> ScanState<'a> {
    pub(crate) fn new(arena: &'a Arena, traces: TraceSet) -> Self {
        Self {
            arena,
            traces,
            white: arena.white_zones(traces),
            zone_shift: arena.config().zone_shift,
            summary: RefSet::EMPTY,
            fixed: 0,
            scanned: 0,
        }
    }

    pub fn arena(&self) -> &'a Arena {
        self.arena
    }

    /// Traces this pass scans for.
    pub fn traces(&self) -> TraceSet {
        self.traces
    }

    /// Union of the white zones of the scanning traces.
    pub fn white(&self) -> RefSet {
        self.white
    }

    /// Zones referenced by everything fixed so far.
    pub fn summary(&self) -> RefSet {
        self.summary
    }

    /// References passed on to a pool's `fix`.
    pub fn fixed_count(&self) -> usize {
        self.fixed
    }

    pub fn scanned_bytes(&self) -> usize {
        self.scanned
    }

    pub fn note_scanned(&mut self, bytes: usize) {
        self.scanned += bytes;
    }

    /// Fix one candidate reference, possibly updating it in place.
    pub fn fix(&mut self, reference: &mut Address) -> PoolResult<()> {
        if reference.is_zero() {
            return Ok(());
        }
        if self.white.contains_addr(*reference, self.zone_shift) {
            if let Some(seg) = self.arena.segment_of(*reference) {
                if seg.white_set().intersects(self.traces) {
                    if let Some(pool) = self.arena.pool_of(seg.pool()) {
                        trace!(reference = %*reference, segment = %seg.id(), "fix");
                        self.fixed += 1;
                        pool.fix(&seg, self, reference)?;
                    }
                }
            }
        }
        self.summary = self.summary.add_addr(*reference, self.zone_shift);
        Ok(())
    }

    /// Fix the reference stored in the word at `slot`, writing it back if
    /// the pool moved it.
    ///
    /// # Safety
    /// `slot` must be a valid, word-aligned, readable and writable address.
    pub unsafe fn fix_slot(&mut self, slot: Address) -> PoolResult<()> {
        debug_assert!(slot.is_aligned(WORD));
        let original = Address::from_usize(unsafe { slot.load::<usize>() });
        let mut reference = original;
        self.fix(&mut reference)?;
        if reference != original {
            unsafe { slot.store(reference.as_usize()) };
        }
        Ok(())
    }
}

impl fmt::Debug for ScanState<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanState")
            .field("traces", &self.traces)
            .field("white", &self.white)
            .field("summary", &self.summary)
            .field("fixed", &self.fixed)
            .field("scanned", &self.scanned)
            .finish()
    }
}
