//! Raw addresses and address ranges handed out by pools.

use std::fmt;
use std::ops::{Add, AddAssign, Sub};

/// Size of a machine word in bytes.
pub const WORD: usize = std::mem::size_of::<usize>();

/// A raw address in the arena's address space.
///
/// # Examples
///
/// ```
/// use poolgc::address::Address;
///
/// let base = Address::from_usize(0x1000);
/// let next = base + 0x18;
/// assert_eq!(next - base, 0x18);
/// assert_eq!(next.align_up(0x10), Address::from_usize(0x1020));
/// assert!(Address::ZERO.is_zero());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Address(usize);

impl Address {
    pub const ZERO: Address = Address(0);

    pub const fn from_usize(raw: usize) -> Self {
        Address(raw)
    }

    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Address(ptr as usize)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }

    pub fn to_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Round up to `align`, which must be a power of two.
    pub const fn align_up(self, align: usize) -> Self {
        debug_assert!(align.is_power_of_two());
        Address((self.0 + align - 1) & !(align - 1))
    }

    pub const fn align_down(self, align: usize) -> Self {
        debug_assert!(align.is_power_of_two());
        Address(self.0 & !(align - 1))
    }

    pub const fn is_aligned(self, align: usize) -> bool {
        self.0 & (align - 1) == 0
    }

    /// Read a value stored at this address.
    ///
    /// # Safety
    /// The address must be valid for reads of `T` and suitably aligned.
    pub unsafe fn load<T: Copy>(self) -> T {
        unsafe { self.to_mut_ptr::<T>().read() }
    }

    /// Write a value at this address.
    ///
    /// # Safety
    /// The address must be valid for writes of `T` and suitably aligned.
    pub unsafe fn store<T>(self, value: T) {
        unsafe { self.to_mut_ptr::<T>().write(value) }
    }
}

impl Add<usize> for Address {
    type Output = Address;

    fn add(self, rhs: usize) -> Address {
        Address(self.0 + rhs)
    }
}

impl AddAssign<usize> for Address {
    fn add_assign(&mut self, rhs: usize) {
        self.0 += rhs;
    }
}

impl Sub<usize> for Address {
    type Output = Address;

    fn sub(self, rhs: usize) -> Address {
        Address(self.0 - rhs)
    }
}

impl Sub<Address> for Address {
    type Output = usize;

    fn sub(self, rhs: Address) -> usize {
        debug_assert!(self >= rhs, "address subtraction underflow");
        self.0 - rhs.0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::LowerHex for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Half-open address range `[base, limit)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AddrRange {
    base: Address,
    limit: Address,
}

impl AddrRange {
    pub fn new(base: Address, limit: Address) -> Self {
        assert!(base <= limit, "range base {base} above limit {limit}");
        Self { base, limit }
    }

    pub fn with_size(base: Address, size: usize) -> Self {
        Self::new(base, base + size)
    }

    pub fn base(&self) -> Address {
        self.base
    }

    pub fn limit(&self) -> Address {
        self.limit
    }

    pub fn size(&self) -> usize {
        self.limit - self.base
    }

    pub fn is_empty(&self) -> bool {
        self.base == self.limit
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.base && addr < self.limit
    }

    pub fn contains_range(&self, other: &AddrRange) -> bool {
        other.base >= self.base && other.limit <= self.limit
    }
}

impl fmt::Debug for AddrRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.base, self.limit)
    }
}
