//! Small bitsets shared by segments, traces and the shield.

use std::fmt;

use bitflags::bitflags;

use crate::address::{AddrRange, Address};

/// Identifier of a live trace. Identifiers are recycled once a trace is done.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct TraceId(u8);

impl TraceId {
    pub fn new(index: usize) -> Self {
        assert!(index < TraceSet::CAPACITY, "trace index {index} out of range");
        TraceId(index as u8)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Bitset of trace identifiers.
///
/// # Examples
///
/// ```
/// use poolgc::trace_set::{TraceId, TraceSet};
///
/// let t0 = TraceId::new(0);
/// let t3 = TraceId::new(3);
/// let set = TraceSet::EMPTY.add(t0).add(t3);
/// assert!(set.contains(t3));
/// assert_eq!(set.iter().collect::<Vec<_>>(), vec![t0, t3]);
/// assert!(set.del(t0).del(t3).is_empty());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TraceSet(u32);

impl TraceSet {
    pub const CAPACITY: usize = 32;
    pub const EMPTY: TraceSet = TraceSet(0);

    pub const fn from_bits(bits: u32) -> Self {
        TraceSet(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub fn single(id: TraceId) -> Self {
        TraceSet(1 << id.index())
    }

    pub fn contains(self, id: TraceId) -> bool {
        self.0 & (1 << id.index()) != 0
    }

    #[must_use]
    pub fn add(self, id: TraceId) -> Self {
        TraceSet(self.0 | (1 << id.index()))
    }

    #[must_use]
    pub fn del(self, id: TraceId) -> Self {
        TraceSet(self.0 & !(1 << id.index()))
    }

    #[must_use]
    pub fn union(self, other: TraceSet) -> Self {
        TraceSet(self.0 | other.0)
    }

    #[must_use]
    pub fn inter(self, other: TraceSet) -> Self {
        TraceSet(self.0 & other.0)
    }

    #[must_use]
    pub fn diff(self, other: TraceSet) -> Self {
        TraceSet(self.0 & !other.0)
    }

    pub fn intersects(self, other: TraceSet) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(self) -> impl Iterator<Item = TraceId> {
        let mut bits = self.0;
        std::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let index = bits.trailing_zeros() as usize;
            bits &= bits - 1;
            Some(TraceId::new(index))
        })
    }
}

impl FromIterator<TraceId> for TraceSet {
    fn from_iter<I: IntoIterator<Item = TraceId>>(iter: I) -> Self {
        iter.into_iter().fold(TraceSet::EMPTY, TraceSet::add)
    }
}

impl fmt::Debug for TraceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Approximation of the zones a segment may reference.
///
/// The address space is striped into `usize::BITS` zones of `1 << shift`
/// bytes each; a set bit means "may hold a reference into this zone".
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RefSet(usize);

impl RefSet {
    pub const EMPTY: RefSet = RefSet(0);
    pub const UNIVERSE: RefSet = RefSet(usize::MAX);

    pub const fn from_bits(bits: usize) -> Self {
        RefSet(bits)
    }

    pub const fn bits(self) -> usize {
        self.0
    }

    pub fn zone_of(addr: Address, shift: u32) -> u32 {
        ((addr.as_usize() >> shift) as u32) & (usize::BITS - 1)
    }

    #[must_use]
    pub fn add_addr(self, addr: Address, shift: u32) -> Self {
        RefSet(self.0 | (1usize << Self::zone_of(addr, shift)))
    }

    /// Zones covered by every address in `range`.
    pub fn of_range(range: AddrRange, shift: u32) -> Self {
        if range.is_empty() {
            return RefSet::EMPTY;
        }
        let first = range.base().as_usize() >> shift;
        let last = (range.limit().as_usize() - 1) >> shift;
        if last - first >= usize::BITS as usize - 1 {
            return RefSet::UNIVERSE;
        }
        (first..=last).fold(RefSet::EMPTY, |set, zone| {
            RefSet(set.0 | (1usize << (zone as u32 & (usize::BITS - 1))))
        })
    }

    pub fn contains_addr(self, addr: Address, shift: u32) -> bool {
        self.0 & (1usize << Self::zone_of(addr, shift)) != 0
    }

    #[must_use]
    pub fn union(self, other: RefSet) -> Self {
        RefSet(self.0 | other.0)
    }

    #[must_use]
    pub fn inter(self, other: RefSet) -> Self {
        RefSet(self.0 & other.0)
    }

    pub fn intersects(self, other: RefSet) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_universe(self) -> bool {
        self.0 == usize::MAX
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for RefSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RefSet({:#x})", self.0)
    }
}

bitflags! {
    /// Kinds of memory access, used both for fault modes and protection modes.
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessSet: u8 {
        const READ = 0b01;
        const WRITE = 0b10;
    }
}

/// Tri-color state of a segment with respect to one trace.
///
/// A segment that does not take part in a trace has no color for it.
/// Within one cycle the color only ever advances `White → Grey → Black`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Color {
    /// Condemned and not yet reached.
    White,
    /// Reached, references not yet scanned.
    Grey,
    /// Reached and scanned.
    Black,
}

impl Color {
    pub(crate) fn to_bits(self) -> u64 {
        match self {
            Color::White => 0b01,
            Color::Grey => 0b10,
            Color::Black => 0b11,
        }
    }

    pub(crate) fn from_bits(bits: u64) -> Option<Color> {
        match bits & 0b11 {
            0b01 => Some(Color::White),
            0b10 => Some(Color::Grey),
            0b11 => Some(Color::Black),
            _ => None,
        }
    }
}
