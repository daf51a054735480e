//! Object formats: how a strategy finds objects and the references in them.

use crate::address::Address;
use crate::error::PoolResult;

/// Layout knowledge a scanning strategy delegates to.
///
/// The framework never interprets object contents itself; a pool's `scan`
/// walks its committed objects with [`scan`](ObjectFormat::scan) and passes
/// each reference slot on to the scan state.
pub trait ObjectFormat: Send + Sync {
    /// Address just past the object starting at `object`.
    ///
    /// # Safety
    /// `object` must be the start of a committed, initialised object.
    unsafe fn skip(&self, object: Address) -> Address;

    /// Visit the address of every reference slot inside `object`.
    ///
    /// # Safety
    /// `object` must be the start of a committed, initialised object.
    unsafe fn references(
        &self,
        object: Address,
        visitor: &mut dyn FnMut(Address) -> PoolResult<()>,
    ) -> PoolResult<()>;

    /// Visit every reference slot of the objects in `[base, limit)`.
    ///
    /// # Safety
    /// `[base, limit)` must be a sequence of committed objects.
    unsafe fn scan(
        &self,
        base: Address,
        limit: Address,
        visitor: &mut dyn FnMut(Address) -> PoolResult<()>,
    ) -> PoolResult<()> {
        let mut object = base;
        while object < limit {
            unsafe {
                self.references(object, visitor)?;
                object = self.skip(object);
            }
        }
        Ok(())
    }

    /// Visit `(address, size)` of every object in `[base, limit)`.
    ///
    /// # Safety
    /// `[base, limit)` must be a sequence of committed objects.
    unsafe fn walk(&self, base: Address, limit: Address, visitor: &mut dyn FnMut(Address, usize)) {
        let mut object = base;
        while object < limit {
            let next = unsafe { self.skip(object) };
            visitor(object, next - object);
            object = next;
        }
    }
}
