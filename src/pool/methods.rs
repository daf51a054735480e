//! Generic default methods installed by the capability bundles.
//!
//! None of these know anything about object layout. The `trivial_*` methods
//! are capability-preserving fallbacks expressed in terms of a more basic
//! capability; the `seg_*` methods implement buffering and fault handling on
//! top of arena segments.

use std::fmt;
use std::sync::Arc;

use tracing::{trace, warn};

use super::Pool;
use crate::address::{AddrRange, Address};
use crate::buffer::{BufferState, Frame};
use crate::error::{PoolError, PoolResult};
use crate::segment::Segment;
use crate::shield::MutatorFaultContext;
use crate::trace::Trace;
use crate::trace_set::{AccessSet, Color, RefSet, TraceSet};

pub fn trivial_init(_pool: &Pool) -> PoolResult<()> {
    Ok(())
}

/// Hand every segment the pool still owns back to the arena.
pub fn trivial_finish(pool: &Pool) {
    if let Some(arena) = pool.try_arena() {
        for seg in pool.segments() {
            arena.segment_free(&seg);
        }
    }
}

/// Direct allocation has no capability-preserving generic form; strategies
/// that allocate directly must override it.
pub fn trivial_alloc(pool: &Pool, _size: usize) -> PoolResult<AddrRange> {
    Err(PoolError::Unimplemented {
        class: pool.class().name(),
        operation: "alloc",
    })
}

pub fn trivial_free(_pool: &Pool, _base: Address, _size: usize) {}

/// Fill a buffer with exactly the requested size by allocating directly.
pub fn trivial_buffer_fill(
    pool: &Pool,
    _buffer: &mut BufferState,
    size: usize,
) -> PoolResult<AddrRange> {
    pool.alloc(size)
}

/// Free the unused tail `[init, limit)` directly, if there is one.
pub fn trivial_buffer_empty(pool: &Pool, _buffer: &mut BufferState, init: Address, limit: Address) {
    debug_assert!(init <= limit);
    if init < limit {
        pool.free(init, limit - init);
    }
}

pub fn trivial_frame_push(_pool: &Pool, _buffer: &mut BufferState, _frame: &Frame) -> PoolResult<()> {
    Ok(())
}

pub fn trivial_frame_pop(_pool: &Pool, _buffer: &mut BufferState, _frame: &Frame) -> PoolResult<()> {
    Ok(())
}

pub fn trivial_frame_pop_pending(_pool: &Pool, _buffer: &mut BufferState, _frame: &Frame) {}

/// Attach the buffer to the tail of a segment with room, or a fresh one.
///
/// Segments that are white or grey for any trace are skipped so new objects
/// never land in memory the collector has yet to decide about.
pub fn seg_buffer_fill(pool: &Pool, buffer: &mut BufferState, size: usize) -> PoolResult<AddrRange> {
    let arena = pool.arena();

    for seg in pool.segments() {
        if !seg.white_set().union(seg.grey_set()).is_empty() {
            continue;
        }
        if let Some(range) = seg.attach_buffer(size) {
            seg.set_summary(RefSet::UNIVERSE);
            arena.reshield(&seg)?;
            buffer.segment = Some(seg);
            return Ok(range);
        }
    }

    let seg = arena.segment_alloc(pool, size)?;
    let range = seg
        .attach_buffer(size)
        .ok_or(PoolError::ResourceExhausted {
            requested: size,
            available: seg.size(),
        })?;
    seg.set_summary(RefSet::UNIVERSE);
    buffer.segment = Some(seg);
    Ok(range)
}

/// Return the tail `[init, limit)` to the segment the buffer was attached to.
pub fn seg_buffer_empty(_pool: &Pool, buffer: &mut BufferState, init: Address, limit: Address) {
    if let Some(seg) = buffer.segment.take() {
        debug_assert_eq!(limit, seg.limit());
        seg.detach_buffer(init);
    }
}

/// Whole-segment fault handler: scan the segment for every flipped trace it
/// is grey for, then lower the barrier for the faulting access.
pub fn seg_access(
    pool: &Pool,
    seg: &Arc<Segment>,
    addr: Address,
    mode: AccessSet,
    _context: &mut MutatorFaultContext<'_>,
) -> PoolResult<()> {
    trace!(pool = %pool.id(), segment = %seg.id(), %addr, ?mode, "whole segment access");
    pool.arena().segment_access(seg, mode)
}

/// Single-reference fault handler.
///
/// When the platform can emulate the faulting instruction, only the word at
/// the faulting address is fixed and the instruction is stepped with the
/// segment exposed. A read greys a segment that is still white, and the
/// read barrier stays up until the segment is scanned; a write widens the
/// summary and lowers the write barrier. Otherwise, or when stepping fails,
/// falls back to [`seg_access`].
pub fn single_access(
    pool: &Pool,
    seg: &Arc<Segment>,
    addr: Address,
    mode: AccessSet,
    context: &mut MutatorFaultContext<'_>,
) -> PoolResult<()> {
    let arena = pool.arena();
    let shield = arena.shield();

    if shield.can_step_instruction(context) {
        if mode.contains(AccessSet::READ) {
            arena.grey_on_read(seg)?;
        }
        let stepped = {
            let _exposed = shield.expose(seg)?;
            if mode.contains(AccessSet::READ) {
                arena.scan_single_ref(seg, addr)?;
            }
            if mode.contains(AccessSet::WRITE) {
                arena.note_write(seg)?;
            }
            shield.step_instruction(context)
        };
        match stepped {
            Ok(()) => return arena.reshield(seg),
            Err(err) => {
                warn!(segment = %seg.id(), %addr, %err, "instruction step failed, exposing whole segment");
            }
        }
    }

    seg_access(pool, seg, addr, mode, context)
}

pub fn trivial_whiten(_pool: &Pool, seg: &Segment, trace: &Trace) -> PoolResult<()> {
    seg.set_color(trace.id(), Color::White).map(|_| ())
}

pub fn trivial_grey(_pool: &Pool, seg: &Segment, trace: &Trace) {
    seg.advance(trace.id(), Color::Grey);
}

pub fn trivial_blacken(_pool: &Pool, seg: &Segment, traces: TraceSet) {
    for trace in traces.iter() {
        seg.advance(trace, Color::Black);
    }
}

pub fn trivial_ramp_begin(_pool: &Pool, _buffer: &BufferState, _collect_all: bool) {}

pub fn trivial_ramp_end(_pool: &Pool, _buffer: &BufferState) {}

pub fn trivial_walk(_pool: &Pool, _seg: &Segment, _visitor: &mut dyn FnMut(Address, usize)) {}

pub fn trivial_free_walk(_pool: &Pool, _visitor: &mut dyn FnMut(Address, usize)) {}

pub fn trivial_describe(pool: &Pool, out: &mut dyn fmt::Write) -> fmt::Result {
    writeln!(out, "  <no description for {}>", pool.class().name())
}
