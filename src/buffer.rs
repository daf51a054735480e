//! Client allocation buffers.
//!
//! A buffer is a bump cursor over a range handed out by its pool's
//! `buffer_fill`. Allocation is two-phase: [`Buffer::reserve`] claims space
//! and [`Buffer::commit`] publishes the initialised object. A trace flip
//! between the two traps the buffer, and the commit reports failure so the
//! client re-initialises and retries.
//!
//! # Examples
//!
//! ```
//! use poolgc::arena::Arena;
//! use poolgc::config::ArenaConfig;
//! use poolgc::address::Address;
//! use poolgc::test_utils::{WordFormat, WordPool};
//!
//! let arena = Arena::new(ArenaConfig::default()).unwrap();
//! let pool = WordPool::create(&arena).unwrap();
//! let buffer = pool.create_buffer();
//!
//! let size = WordFormat::object_size(1);
//! let p = buffer.reserve(size).unwrap();
//! unsafe { WordPool::init_object(p, &[Address::ZERO]) };
//! assert!(buffer.commit(p, size).unwrap());
//! assert_eq!(buffer.cursor().init, p + size);
//! ```

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::address::{AddrRange, Address, WORD};
use crate::error::{PoolError, PoolResult};
use crate::pool::{Pool, PoolAttr};
use crate::segment::{Segment, SegmentId};

/// Pool-unique buffer identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct BufferId(pub(crate) u64);

/// A checkpoint of a buffer's allocation position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    depth: usize,
    position: Address,
    segment: Option<SegmentId>,
    filled: usize,
}

impl Frame {
    /// Number of frames below this one.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Allocation point the buffer rolls back to when the frame pops.
    pub fn position(&self) -> Address {
        self.position
    }

    /// Segment the buffer was attached to when the frame was pushed, if
    /// any.
    pub fn segment(&self) -> Option<SegmentId> {
        self.segment
    }
}

/// Cursor state shared between a buffer and its pool.
///
/// `base <= init <= alloc <= limit` holds whenever the state is not locked.
/// A detached buffer has all four set to zero.
#[derive(Default)]
pub struct BufferState {
    pub base: Address,
    /// End of committed objects.
    pub init: Address,
    /// End of reserved space.
    pub alloc: Address,
    pub limit: Address,
    /// Segment the range was carved from, for segment-buffered pools.
    pub segment: Option<Arc<Segment>>,
    frames: Vec<Frame>,
    /// Segments attached by a fill while some frame was live, oldest first.
    filled: Vec<Arc<Segment>>,
    ramp_depth: usize,
    trapped: bool,
}

impl BufferState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a fill has given the buffer space it has not emptied yet.
    pub fn is_attached(&self) -> bool {
        !self.limit.is_zero() || self.segment.is_some()
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Segments this buffer was filled from after `frame` was pushed.
    pub fn filled_since(&self, frame: &Frame) -> &[Arc<Segment>] {
        self.filled.get(frame.filled..).unwrap_or(&[])
    }

    pub fn ramp_depth(&self) -> usize {
        self.ramp_depth
    }

    /// Set when a flip detached the buffer; cleared by the next fill or by
    /// the failed commit it causes.
    pub fn is_trapped(&self) -> bool {
        self.trapped
    }

    fn reset(&mut self) {
        self.base = Address::ZERO;
        self.init = Address::ZERO;
        self.alloc = Address::ZERO;
        self.limit = Address::ZERO;
    }

    fn room(&self) -> usize {
        if self.limit > self.alloc {
            self.limit - self.alloc
        } else {
            0
        }
    }
}

impl fmt::Debug for BufferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferState")
            .field("base", &self.base)
            .field("init", &self.init)
            .field("alloc", &self.alloc)
            .field("limit", &self.limit)
            .field("segment", &self.segment.as_ref().map(|seg| seg.id()))
            .field("frames", &self.frames.len())
            .field("filled", &self.filled.len())
            .field("ramp_depth", &self.ramp_depth)
            .field("trapped", &self.trapped)
            .finish()
    }
}

/// Copy of a buffer's cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferCursor {
    pub base: Address,
    pub init: Address,
    pub alloc: Address,
    pub limit: Address,
}

/// Detach `state` from its range, handing the uncommitted tail back to the
/// pool.
pub(crate) fn detach(pool: &Pool, state: &mut BufferState) {
    if state.is_attached() {
        let (init, limit) = (state.init, state.limit);
        pool.buffer_empty(state, init, limit);
        state.segment = None;
        state.reset();
    }
}

/// Detach and mark the buffer so its pending commit fails.
pub(crate) fn trap(pool: &Pool, state: &mut BufferState) {
    if state.is_attached() {
        state.trapped = true;
        detach(pool, state);
    }
}

pub struct Buffer {
    id: BufferId,
    pool: Arc<Pool>,
    state: Arc<Mutex<BufferState>>,
}

impl Buffer {
    pub(crate) fn new(id: BufferId, pool: Arc<Pool>, state: Arc<Mutex<BufferState>>) -> Self {
        Self { id, pool, state }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    /// Copy of the four cursors, taken under the buffer lock.
    pub fn cursor(&self) -> BufferCursor {
        let state = self.state.lock();
        BufferCursor {
            base: state.base,
            init: state.init,
            alloc: state.alloc,
            limit: state.limit,
        }
    }

    /// Segment the buffer is currently attached to.
    pub fn segment(&self) -> Option<Arc<Segment>> {
        self.state.lock().segment.clone()
    }

    /// Claim `size` bytes, rounded up to a word. The object must be
    /// initialised and then passed to [`commit`](Self::commit).
    pub fn reserve(&self, size: usize) -> PoolResult<Address> {
        assert!(size > 0, "contract violation: zero-sized reserve");
        let size = size.div_ceil(WORD) * WORD;
        let mut state = self.state.lock();
        debug_assert!(state.init == state.alloc, "reserve with an uncommitted reservation");

        if state.room() < size {
            detach(&self.pool, &mut state);
            let range = self.pool.buffer_fill(&mut state, size)?;
            self.attach(&mut state, range, size)?;
            if !state.frames.is_empty() {
                if let Some(seg) = state.segment.clone() {
                    state.filled.push(seg);
                }
            }
        }

        let p = state.alloc;
        state.alloc = p + size;
        debug_assert!(state.init <= state.alloc && state.alloc <= state.limit);
        Ok(p)
    }

    fn attach(&self, state: &mut BufferState, range: AddrRange, size: usize) -> PoolResult<()> {
        if range.size() < size {
            return Err(PoolError::ResourceExhausted {
                requested: size,
                available: range.size(),
            });
        }
        state.base = range.base();
        state.init = range.base();
        state.alloc = range.base();
        state.limit = range.limit();
        state.trapped = false;
        Ok(())
    }

    /// Publish the object reserved at `p`.
    ///
    /// Returns `false` if a trace flipped since the reservation. The space
    /// has then been taken back and the client must reserve and initialise
    /// the object again.
    pub fn commit(&self, p: Address, size: usize) -> PoolResult<bool> {
        let size = size.div_ceil(WORD) * WORD;
        let mut state = self.state.lock();
        if state.trapped {
            state.trapped = false;
            return Ok(false);
        }
        debug_assert_eq!(p, state.init, "commit of a different reservation");
        debug_assert_eq!(p + size, state.alloc, "commit size differs from reserve");
        state.init = state.alloc;
        if let Some(seg) = &state.segment {
            seg.note_committed(state.init);
        }
        Ok(true)
    }

    /// Record the current position as a frame.
    pub fn frame_push(&self) -> PoolResult<Frame> {
        let mut state = self.state.lock();
        let frame = Frame {
            depth: state.frames.len(),
            position: state.alloc,
            segment: state.segment.as_ref().map(|seg| seg.id()),
            filled: state.filled.len(),
        };
        self.pool.frame_push(&mut state, &frame)?;
        state.frames.push(frame.clone());
        Ok(frame)
    }

    /// Discard `frame` and every frame pushed after it, then let the pool
    /// roll the buffer back.
    ///
    /// A frame recorded in a different segment than the current one, or
    /// one the buffer has refilled since, is handed to the pool's
    /// `frame_pop_pending`.
    pub fn frame_pop(&self, frame: &Frame) -> PoolResult<()> {
        let mut state = self.state.lock();
        let index = state
            .frames
            .iter()
            .position(|f| f == frame)
            .ok_or(PoolError::NoFrame)?;
        state.frames.truncate(index);

        let current = state.segment.as_ref().map(|seg| seg.id());
        let result = if frame.segment == current && state.filled.len() == frame.filled {
            self.pool.frame_pop(&mut state, frame)
        } else {
            self.pool.frame_pop_pending(&mut state, frame);
            Ok(())
        };
        if state.frames.is_empty() {
            state.filled.clear();
        } else {
            state.filled.truncate(frame.filled);
        }
        result
    }

    /// Enter an allocation ramp. Non-collectible pools only count the depth.
    pub fn ramp_begin(&self, collect_all: bool) {
        let mut state = self.state.lock();
        state.ramp_depth += 1;
        if self.pool.attr().contains(PoolAttr::GC) {
            self.pool.ramp_begin(&state, collect_all);
        }
    }

    /// Leave the innermost ramp. Fails with [`PoolError::NotInRamp`] when
    /// no ramp is open.
    pub fn ramp_end(&self) -> PoolResult<()> {
        let mut state = self.state.lock();
        if state.ramp_depth == 0 {
            return Err(PoolError::NotInRamp);
        }
        state.ramp_depth -= 1;
        if self.pool.attr().contains(PoolAttr::GC) {
            self.pool.ramp_end(&state);
        }
        Ok(())
    }

    /// Give the unused tail back to the pool. The next reserve refills.
    pub fn empty(&self) {
        let mut state = self.state.lock();
        detach(&self.pool, &mut state);
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        {
            let mut state = self.state.lock();
            detach(&self.pool, &mut state);
        }
        self.pool.unregister_buffer(self.id);
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("pool", &self.pool.id())
            .field("state", &*self.state.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::config::ArenaConfig;
    use crate::test_utils::{ManualCall, ManualPool, StackPool};

    #[test]
    fn reserve_refills_through_buffer_fill() {
        let arena = Arena::new(ArenaConfig::default()).unwrap();
        let pool = ManualPool::create(&arena, true).unwrap();
        let buffer = pool.create_buffer();

        let p = buffer.reserve(24).unwrap();
        assert!(buffer.commit(p, 24).unwrap());
        let cursor = buffer.cursor();
        assert_eq!(cursor.base, p);
        assert_eq!(cursor.init, p + 24);
        assert_eq!(cursor.limit, p + 24);

        // The exact-size fill leaves no room, so the next reserve empties
        // the old range before filling again.
        let q = buffer.reserve(8).unwrap();
        assert!(buffer.commit(q, 8).unwrap());
        assert_eq!(
            ManualPool::calls(&pool),
            vec![ManualCall::Alloc(24), ManualCall::Alloc(8)]
        );
    }

    #[test]
    fn empty_frees_uncommitted_tail() {
        let arena = Arena::new(ArenaConfig::default()).unwrap();
        let pool = ManualPool::create(&arena, true).unwrap();
        let buffer = pool.create_buffer();

        let p = buffer.reserve(32).unwrap();
        buffer.empty();
        assert_eq!(
            ManualPool::calls(&pool),
            vec![ManualCall::Alloc(32), ManualCall::Free(p, 32)]
        );
        assert_eq!(buffer.cursor().limit, Address::ZERO);
    }

    #[test]
    fn frame_pop_requires_pushed_frame() {
        let arena = Arena::new(ArenaConfig::default()).unwrap();
        let pool = StackPool::create(&arena).unwrap();
        let buffer = pool.create_buffer();
        let frame = buffer.frame_push().unwrap();
        buffer.frame_pop(&frame).unwrap();
        assert_eq!(buffer.frame_pop(&frame), Err(PoolError::NoFrame));
    }

    #[test]
    fn popping_outer_frame_discards_inner_frames() {
        let arena = Arena::new(ArenaConfig::default()).unwrap();
        let pool = StackPool::create(&arena).unwrap();
        let buffer = pool.create_buffer();

        let outer = buffer.frame_push().unwrap();
        let inner = buffer.frame_push().unwrap();
        assert_eq!(inner.depth(), 1);
        buffer.frame_pop(&outer).unwrap();
        assert_eq!(buffer.frame_pop(&inner), Err(PoolError::NoFrame));
    }

    #[test]
    fn ramp_end_without_begin_fails() {
        let arena = Arena::new(ArenaConfig::default()).unwrap();
        let pool = StackPool::create(&arena).unwrap();
        let buffer = pool.create_buffer();
        assert_eq!(buffer.ramp_end(), Err(PoolError::NotInRamp));
        buffer.ramp_begin(true);
        buffer.ramp_begin(false);
        buffer.ramp_end().unwrap();
        buffer.ramp_end().unwrap();
        assert_eq!(buffer.ramp_end(), Err(PoolError::NotInRamp));
    }
}
