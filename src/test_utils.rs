//! Reference pool strategies for tests, benches and fuzz targets.
//!
//! These are deliberately small concrete strategies built on the capability
//! framework: each composes the bundles it needs and overrides only what its
//! semantics require.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::trace;

use crate::address::{AddrRange, Address, WORD};
use crate::arena::Arena;
use crate::buffer::{self, Buffer, BufferState, Frame};
use crate::error::{PoolError, PoolResult};
use crate::format::ObjectFormat;
use crate::pool::methods;
use crate::pool::{Bundle, Pool, PoolClass};
use crate::scan::ScanState;
use crate::segment::Segment;
use crate::trace::Trace;

/// A call observed by a [`ManualPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManualCall {
    Alloc(usize),
    Free(Address, usize),
}

#[derive(Default)]
struct ManualState {
    calls: Mutex<Vec<ManualCall>>,
}

/// Direct allocation strategy that gives every allocation its own segment
/// and records every call.
///
/// # Examples
///
/// ```
/// use poolgc::arena::Arena;
/// use poolgc::config::ArenaConfig;
/// use poolgc::test_utils::{ManualCall, ManualPool};
///
/// let arena = Arena::new(ArenaConfig::default()).unwrap();
/// let pool = ManualPool::create(&arena, false).unwrap();
/// let range = pool.alloc(64).unwrap();
/// assert_eq!(range.size(), 64);
/// pool.free(range.base(), 64);
/// assert_eq!(
///     ManualPool::calls(&pool),
///     vec![ManualCall::Alloc(64), ManualCall::Free(range.base(), 64)]
/// );
/// ```
pub struct ManualPool;

impl ManualPool {
    pub fn class(buffered: bool) -> PoolClass {
        let class = PoolClass::abstract_pool("Manual")
            .compose(Bundle::AllocFree)
            .with_alloc(manual_alloc)
            .with_free(manual_free);
        if buffered {
            class.compose(Bundle::Buffered)
        } else {
            class
        }
    }

    pub fn create(arena: &Arena, buffered: bool) -> PoolResult<Arc<Pool>> {
        arena.create_pool(Self::class(buffered), Box::new(ManualState::default()))
    }

    pub fn calls(pool: &Pool) -> Vec<ManualCall> {
        pool.state::<ManualState>().calls.lock().clone()
    }
}

fn manual_alloc(pool: &Pool, size: usize) -> PoolResult<AddrRange> {
    pool.state::<ManualState>()
        .calls
        .lock()
        .push(ManualCall::Alloc(size));
    let seg = pool.arena().segment_alloc(pool, size)?;
    Ok(AddrRange::with_size(seg.base(), size))
}

/// Frees the whole segment when `base` is where an allocation started;
/// tails handed back by a buffer are only recorded.
fn manual_free(pool: &Pool, base: Address, size: usize) {
    pool.state::<ManualState>()
        .calls
        .lock()
        .push(ManualCall::Free(base, size));
    let Some(arena) = pool.try_arena() else {
        return;
    };
    if let Some(seg) = arena.segment_of(base) {
        if seg.base() == base && seg.pool() == pool.id() {
            arena.segment_free(&seg);
        }
    }
}

/// Objects laid out as a header word holding the reference count `n`,
/// followed by `n` reference words.
#[derive(Debug, Clone, Copy, Default)]
pub struct WordFormat;

impl WordFormat {
    pub const fn object_size(refs: usize) -> usize {
        (refs + 1) * WORD
    }
}

impl ObjectFormat for WordFormat {
    unsafe fn skip(&self, object: Address) -> Address {
        let refs: usize = unsafe { object.load() };
        object + Self::object_size(refs)
    }

    unsafe fn references(
        &self,
        object: Address,
        visitor: &mut dyn FnMut(Address) -> PoolResult<()>,
    ) -> PoolResult<()> {
        let refs: usize = unsafe { object.load() };
        for index in 1..=refs {
            visitor(object + index * WORD)?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct WordState {
    format: WordFormat,
    reclaimed: AtomicUsize,
}

/// Collectible, segment-buffered, non-moving strategy over [`WordFormat`]
/// objects. Fixing a reference greys the segment it points into; reclaim
/// frees the whole segment.
pub struct WordPool;

impl WordPool {
    pub fn class() -> PoolClass {
        PoolClass::abstract_pool("Word")
            .compose(Bundle::Buffered)
            .compose(Bundle::SegmentBuffered)
            .compose(Bundle::Scannable)
            .compose(Bundle::Collectible)
            .with_scan(word_scan)
            .with_fix(word_fix)
            .with_reclaim(word_reclaim)
            .with_walk(word_walk)
            .with_describe(word_describe)
    }

    pub fn create(arena: &Arena) -> PoolResult<Arc<Pool>> {
        arena.create_pool(Self::class(), Box::new(WordState::default()))
    }

    /// A word pool whose faults fix only the faulting reference.
    pub fn create_single_access(arena: &Arena) -> PoolResult<Arc<Pool>> {
        let class = Self::class().with_access(methods::single_access);
        arena.create_pool(class, Box::new(WordState::default()))
    }

    /// Write an object with the given references at `p`.
    ///
    /// # Safety
    /// `p` must be a reservation of at least
    /// `WordFormat::object_size(refs.len())` bytes.
    pub unsafe fn init_object(p: Address, refs: &[Address]) {
        unsafe {
            p.store(refs.len());
            for (index, reference) in refs.iter().enumerate() {
                (p + (index + 1) * WORD).store(reference.as_usize());
            }
        }
    }

    /// Reserve, initialise and commit an object, retrying across flips.
    pub fn allocate(buffer: &Buffer, refs: &[Address]) -> PoolResult<Address> {
        let size = WordFormat::object_size(refs.len());
        loop {
            let p = buffer.reserve(size)?;
            unsafe { Self::init_object(p, refs) };
            if buffer.commit(p, size)? {
                return Ok(p);
            }
        }
    }

    /// The references stored in the object at `object`.
    ///
    /// # Safety
    /// `object` must be a committed object of a live word pool segment.
    pub unsafe fn references(object: Address) -> Vec<Address> {
        let refs: usize = unsafe { object.load() };
        (1..=refs)
            .map(|index| Address::from_usize(unsafe { (object + index * WORD).load() }))
            .collect()
    }

    /// Segments reclaimed so far.
    pub fn reclaimed(pool: &Pool) -> usize {
        pool.state::<WordState>().reclaimed.load(Ordering::Relaxed)
    }
}

fn word_scan(pool: &Pool, seg: &Segment, ss: &mut ScanState<'_>) -> PoolResult<bool> {
    let format = pool.state::<WordState>().format;
    let (base, limit) = (seg.base(), seg.committed());
    unsafe {
        format.scan(base, limit, &mut |slot| ss.fix_slot(slot))?;
    }
    ss.note_scanned(limit - base);
    Ok(true)
}

fn word_fix(_pool: &Pool, seg: &Segment, ss: &mut ScanState<'_>, _reference: &mut Address) -> PoolResult<()> {
    ss.arena().grey_for(seg, ss.traces())
}

fn word_reclaim(pool: &Pool, seg: &Arc<Segment>, trace: &Trace) {
    trace!(pool = %pool.id(), segment = %seg.id(), trace = %trace.id(), "word segment reclaimed");
    pool.state::<WordState>()
        .reclaimed
        .fetch_add(1, Ordering::Relaxed);
    pool.arena().segment_free(seg);
}

fn word_walk(pool: &Pool, seg: &Segment, visitor: &mut dyn FnMut(Address, usize)) {
    let format = pool.state::<WordState>().format;
    unsafe { format.walk(seg.base(), seg.committed(), visitor) };
}

fn word_describe(pool: &Pool, out: &mut dyn fmt::Write) -> fmt::Result {
    writeln!(
        out,
        "  word objects, {} segments reclaimed",
        WordPool::reclaimed(pool)
    )
}

/// Segment-buffered strategy whose frames roll allocation back.
///
/// Every fill takes a fresh segment, so a segment only ever holds the
/// objects of the buffer that filled from it and a frame pop can free or
/// cut back segments without touching other buffers' objects.
///
/// # Examples
///
/// ```
/// use poolgc::arena::Arena;
/// use poolgc::config::ArenaConfig;
/// use poolgc::test_utils::StackPool;
///
/// let arena = Arena::new(ArenaConfig::default()).unwrap();
/// let pool = StackPool::create(&arena).unwrap();
/// let buffer = pool.create_buffer();
///
/// let frame = buffer.frame_push().unwrap();
/// let p = buffer.reserve(64).unwrap();
/// assert!(buffer.commit(p, 64).unwrap());
/// buffer.frame_pop(&frame).unwrap();
/// assert!(arena.segment_of(p).is_none());
/// ```
pub struct StackPool;

impl StackPool {
    pub fn class() -> PoolClass {
        PoolClass::abstract_pool("Stack")
            .compose(Bundle::Buffered)
            .compose(Bundle::SegmentBuffered)
            .with_buffer_fill(stack_buffer_fill)
            .with_frame_pop(stack_frame_pop)
            .with_frame_pop_pending(stack_frame_pop_pending)
    }

    pub fn create(arena: &Arena) -> PoolResult<Arc<Pool>> {
        arena.create_pool(Self::class(), Box::new(()))
    }
}

fn stack_buffer_fill(pool: &Pool, buffer: &mut BufferState, size: usize) -> PoolResult<AddrRange> {
    let seg = pool.arena().segment_alloc(pool, size)?;
    let range = seg
        .attach_buffer(size)
        .ok_or(PoolError::ResourceExhausted {
            requested: size,
            available: seg.size(),
        })?;
    buffer.segment = Some(seg);
    Ok(range)
}

/// The frame lies in the current segment: move the cursor back.
fn stack_frame_pop(_pool: &Pool, state: &mut BufferState, frame: &Frame) -> PoolResult<()> {
    let position = frame.position();
    if position.is_zero() {
        return Ok(());
    }
    if position < state.base {
        state.base = position;
    }
    state.init = position;
    state.alloc = position;
    if let Some(seg) = &state.segment {
        seg.note_committed(position);
    }
    Ok(())
}

/// The buffer has moved on since the frame: free the segments it filled
/// from after the frame, then reattach to the frame's segment at the frame
/// position. A frame pushed before the first fill leaves the buffer empty.
fn stack_frame_pop_pending(pool: &Pool, state: &mut BufferState, frame: &Frame) {
    buffer::detach(pool, state);
    let arena = pool.arena();
    for seg in state.filled_since(frame) {
        arena.segment_free(seg);
    }

    let Some(seg) = frame.segment().and_then(|id| arena.segment(id)) else {
        return;
    };
    let position = frame.position();
    seg.detach_buffer(position);
    if let Some(range) = seg.attach_buffer(0) {
        state.base = range.base();
        state.init = range.base();
        state.alloc = range.base();
        state.limit = range.limit();
        state.segment = Some(seg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArenaConfig;
    use crate::pool::PoolAttr;

    #[test]
    fn reference_classes_pass_check() {
        for class in [
            ManualPool::class(false),
            ManualPool::class(true),
            WordPool::class(),
            StackPool::class(),
        ] {
            assert_eq!(class.check(), Ok(()), "{}", class.name());
        }
        assert!(WordPool::class().has(PoolAttr::GC));
    }

    #[test]
    fn word_format_walks_objects() {
        let arena = Arena::new(ArenaConfig::default()).unwrap();
        let pool = WordPool::create(&arena).unwrap();
        let buffer = pool.create_buffer();
        let a = WordPool::allocate(&buffer, &[]).unwrap();
        let b = WordPool::allocate(&buffer, &[a, a]).unwrap();
        buffer.empty();

        let mut seen = Vec::new();
        arena.walk(&pool, &mut |addr, size| seen.push((addr, size))).unwrap();
        assert_eq!(seen, vec![(a, WORD), (b, 3 * WORD)]);
        assert_eq!(unsafe { WordPool::references(b) }, vec![a, a]);
    }
}
