//! The shield: barriers, page protection and mutator faults.
//!
//! The collector states which accesses it wants trapped on each segment
//! (`raise`/`lower`); the shield turns that into platform protection through
//! a [`Protector`]. Code that must touch protected memory takes an
//! [`ExposeGuard`], which lifts protection for its lifetime and restores it
//! on every exit path.
//!
//! Faults arrive as [`FaultDescriptor`]s, either directly through
//! [`Arena::handle_fault`](crate::arena::Arena::handle_fault) or queued on a
//! [`FaultPort`] by a platform trap. Each is handed to the owning pool's
//! `access` method together with a [`MutatorFaultContext`] that lives only
//! for that one call.

use std::fmt;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::address::{AddrRange, Address};
use crate::arena::Arena;
use crate::error::{PoolError, PoolResult};
use crate::segment::{ProtectionState, Segment};
use crate::trace_set::AccessSet;

/// Platform page protection.
pub trait Protector: Send + Sync {
    /// Trap the accesses in `mode` on `range`; an empty mode unprotects.
    fn protect(&self, range: AddrRange, mode: AccessSet) -> PoolResult<()>;

    /// Whether the faulting instruction can be emulated.
    fn can_step_instruction(&self, _context: &MutatorFaultContext<'_>) -> bool {
        false
    }

    /// Emulate the faulting instruction and advance past it.
    fn step_instruction(&self, _context: &mut MutatorFaultContext<'_>) -> PoolResult<()> {
        Err(PoolError::StepFailed)
    }

    fn name(&self) -> &'static str;
}

/// Records protection without touching page tables.
///
/// Faults carrying an instruction length can be stepped, which lets the
/// single-reference access path run without hardware support.
#[derive(Debug, Default)]
pub struct SoftwareProtector {
    modes: DashMap<usize, AccessSet>,
}

impl SoftwareProtector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Protection last applied to the range starting at `base`.
    pub fn mode_of(&self, base: Address) -> AccessSet {
        self.modes
            .get(&base.as_usize())
            .map(|mode| *mode)
            .unwrap_or_default()
    }
}

impl Protector for SoftwareProtector {
    fn protect(&self, range: AddrRange, mode: AccessSet) -> PoolResult<()> {
        if mode.is_empty() {
            self.modes.remove(&range.base().as_usize());
        } else {
            self.modes.insert(range.base().as_usize(), mode);
        }
        Ok(())
    }

    fn can_step_instruction(&self, context: &MutatorFaultContext<'_>) -> bool {
        context.instruction_len().is_some()
    }

    fn step_instruction(&self, context: &mut MutatorFaultContext<'_>) -> PoolResult<()> {
        let len = context.instruction_len().ok_or(PoolError::StepFailed)?;
        context.advance(len);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "software"
    }
}

/// Page protection through `mprotect`. Declines instruction stepping.
#[cfg(unix)]
#[derive(Debug)]
pub struct MprotectProtector {
    page_size: usize,
}

#[cfg(unix)]
impl MprotectProtector {
    pub fn new(page_size: usize) -> Self {
        Self { page_size }
    }
}

#[cfg(unix)]
impl Protector for MprotectProtector {
    fn protect(&self, range: AddrRange, mode: AccessSet) -> PoolResult<()> {
        debug_assert!(range.base().is_aligned(self.page_size));
        debug_assert!(range.size() % self.page_size == 0);
        // Trapping reads traps everything; the hardware cannot trap a read
        // while allowing it to write.
        let prot = if mode.contains(AccessSet::READ) {
            libc::PROT_NONE
        } else if mode.contains(AccessSet::WRITE) {
            libc::PROT_READ
        } else {
            libc::PROT_READ | libc::PROT_WRITE
        };
        let result = unsafe { libc::mprotect(range.base().to_mut_ptr(), range.size(), prot) };
        if result != 0 {
            return Err(PoolError::Protection(
                std::io::Error::last_os_error().to_string(),
            ));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "mprotect"
    }
}

/// A single protection fault as reported by the platform trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultDescriptor {
    pub address: Address,
    pub mode: AccessSet,
    /// Length of the faulting instruction, when the trap could decode it.
    pub instruction: Option<usize>,
}

impl FaultDescriptor {
    pub fn new(address: Address, mode: AccessSet) -> Self {
        Self {
            address,
            mode,
            instruction: None,
        }
    }

    pub fn with_instruction(mut self, len: usize) -> Self {
        self.instruction = Some(len);
        self
    }
}

/// Handler-scoped view of one fault. It cannot outlive the descriptor it
/// borrows, so nothing can retain it past the handler call.
#[derive(Debug)]
pub struct MutatorFaultContext<'a> {
    fault: &'a FaultDescriptor,
    advanced: usize,
}

impl<'a> MutatorFaultContext<'a> {
    pub fn new(fault: &'a FaultDescriptor) -> Self {
        Self { fault, advanced: 0 }
    }

    pub fn address(&self) -> Address {
        self.fault.address
    }

    pub fn mode(&self) -> AccessSet {
        self.fault.mode
    }

    pub fn instruction_len(&self) -> Option<usize> {
        self.fault.instruction
    }

    /// Record that the mutator's instruction pointer moved past `len` bytes.
    pub fn advance(&mut self, len: usize) {
        self.advanced += len;
    }

    /// Bytes of instruction stream emulated on the mutator's behalf.
    pub fn advanced(&self) -> usize {
        self.advanced
    }
}

/// What became of a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The address is not in any segment; the platform must handle it.
    NotOurs,
    /// The segment was not protected against this access, e.g. another
    /// thread already handled the same barrier.
    Spurious,
    Handled,
}

pub struct Shield {
    protector: Box<dyn Protector>,
}

impl Shield {
    pub fn new(protector: Box<dyn Protector>) -> Self {
        Self { protector }
    }

    pub fn protector(&self) -> &dyn Protector {
        self.protector.as_ref()
    }

    /// Bring the applied protection in line with the shield mode.
    fn sync_locked(&self, seg: &Segment, state: &mut ProtectionState) -> PoolResult<()> {
        let wanted = if state.depth > 0 {
            AccessSet::empty()
        } else {
            state.shield
        };
        if wanted != state.applied {
            self.protector.protect(seg.range(), wanted)?;
            state.applied = wanted;
        }
        Ok(())
    }

    pub fn raise(&self, seg: &Segment, mode: AccessSet) -> PoolResult<()> {
        let mut state = seg.protection();
        state.shield |= mode;
        self.sync_locked(seg, &mut state)
    }

    pub fn lower(&self, seg: &Segment, mode: AccessSet) -> PoolResult<()> {
        let mut state = seg.protection();
        state.shield -= mode;
        self.sync_locked(seg, &mut state)
    }

    /// Replace the shield mode outright.
    pub fn set(&self, seg: &Segment, mode: AccessSet) -> PoolResult<()> {
        self.set_with(seg, || mode)
    }

    /// Replace the shield mode with one computed while the segment's
    /// protection is locked, so concurrent recomputations cannot apply a
    /// stale mode.
    pub fn set_with<F>(&self, seg: &Segment, mode: F) -> PoolResult<()>
    where
        F: FnOnce() -> AccessSet,
    {
        let mut state = seg.protection();
        let mode = mode();
        if state.shield != mode {
            trace!(segment = %seg.id(), from = ?state.shield, to = ?mode, "shield");
        }
        state.shield = mode;
        self.sync_locked(seg, &mut state)
    }

    /// Lift protection on `seg` until the guard drops. Exposures nest.
    pub fn expose<'s>(&'s self, seg: &'s Segment) -> PoolResult<ExposeGuard<'s>> {
        let mut state = seg.protection();
        state.depth += 1;
        if let Err(err) = self.sync_locked(seg, &mut state) {
            state.depth -= 1;
            return Err(err);
        }
        Ok(ExposeGuard { shield: self, seg })
    }

    fn cover(&self, seg: &Segment) -> PoolResult<()> {
        let mut state = seg.protection();
        debug_assert!(state.depth > 0, "cover without expose");
        state.depth = state.depth.saturating_sub(1);
        self.sync_locked(seg, &mut state)
    }

    /// Drop all protection before the segment's memory is released.
    pub(crate) fn release(&self, seg: &Segment) {
        let mut state = seg.protection();
        state.shield = AccessSet::empty();
        if !state.applied.is_empty() {
            if let Err(err) = self.protector.protect(seg.range(), AccessSet::empty()) {
                warn!(segment = %seg.id(), %err, "failed to unprotect released segment");
            }
            state.applied = AccessSet::empty();
        }
    }

    pub fn can_step_instruction(&self, context: &MutatorFaultContext<'_>) -> bool {
        self.protector.can_step_instruction(context)
    }

    pub fn step_instruction(&self, context: &mut MutatorFaultContext<'_>) -> PoolResult<()> {
        self.protector.step_instruction(context)
    }
}

impl fmt::Debug for Shield {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shield")
            .field("protector", &self.protector.name())
            .finish()
    }
}

/// Scoped exposure of a segment; covers it again on drop.
#[must_use = "the segment is covered again as soon as the guard drops"]
pub struct ExposeGuard<'s> {
    shield: &'s Shield,
    seg: &'s Segment,
}

impl Drop for ExposeGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.shield.cover(self.seg) {
            warn!(segment = %self.seg.id(), %err, "failed to cover segment");
        }
    }
}

type FaultReply = flume::Sender<PoolResult<FaultOutcome>>;

/// Queue between a platform fault trap and the threads that handle faults.
pub struct FaultPort {
    sender: Mutex<Option<flume::Sender<(FaultDescriptor, FaultReply)>>>,
    receiver: flume::Receiver<(FaultDescriptor, FaultReply)>,
}

impl Default for FaultPort {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultPort {
    pub fn new() -> Self {
        let (sender, receiver) = flume::unbounded();
        Self {
            sender: Mutex::new(Some(sender)),
            receiver,
        }
    }

    /// Queue a fault; the returned channel yields its outcome once a handler
    /// has processed it.
    pub fn submit(
        &self,
        fault: FaultDescriptor,
    ) -> PoolResult<flume::Receiver<PoolResult<FaultOutcome>>> {
        let sender = self.sender.lock().clone().ok_or(PoolError::FaultPortClosed)?;
        let (reply, outcome) = flume::bounded(1);
        sender
            .send((fault, reply))
            .map_err(|_| PoolError::FaultPortClosed)?;
        Ok(outcome)
    }

    /// Handle every queued fault on the calling thread.
    pub fn process(&self, arena: &Arena) -> usize {
        let mut handled = 0;
        for (fault, reply) in self.receiver.try_iter() {
            let outcome = arena.handle_fault(&fault);
            // The submitter may have stopped waiting.
            let _ = reply.send(outcome);
            handled += 1;
        }
        handled
    }

    /// Queue a fault, process the queue, and return the fault's outcome.
    pub fn deliver(&self, arena: &Arena, fault: FaultDescriptor) -> PoolResult<FaultOutcome> {
        let outcome = self.submit(fault)?;
        self.process(arena);
        outcome.recv().map_err(|_| PoolError::FaultPortClosed)?
    }

    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    /// Refuse further submissions. Queued faults can still be processed.
    pub fn close(&self) {
        self.sender.lock().take();
    }
}

impl fmt::Debug for FaultPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultPort")
            .field("pending", &self.receiver.len())
            .field("closed", &self.sender.lock().is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolId;
    use crate::segment::SegmentId;
    use std::sync::Arc;

    fn segment() -> Segment {
        Segment::allocate(SegmentId(9), PoolId(1), 4096, 4096).unwrap()
    }

    struct Counting {
        inner: SoftwareProtector,
        calls: Arc<Mutex<Vec<AccessSet>>>,
    }

    impl Protector for Counting {
        fn protect(&self, range: AddrRange, mode: AccessSet) -> PoolResult<()> {
            self.calls.lock().push(mode);
            self.inner.protect(range, mode)
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    #[test]
    fn raise_and_lower_track_shield_mode() {
        let shield = Shield::new(Box::new(SoftwareProtector::new()));
        let seg = segment();
        shield.raise(&seg, AccessSet::READ).unwrap();
        shield.raise(&seg, AccessSet::WRITE).unwrap();
        assert_eq!(seg.protection_mode(), AccessSet::READ | AccessSet::WRITE);
        shield.lower(&seg, AccessSet::READ).unwrap();
        assert_eq!(seg.shield_mode(), AccessSet::WRITE);
        assert_eq!(seg.protection_mode(), AccessSet::WRITE);
    }

    #[test]
    fn expose_guard_covers_on_every_exit_path() {
        let shield = Shield::new(Box::new(SoftwareProtector::new()));
        let seg = segment();
        shield.raise(&seg, AccessSet::READ).unwrap();

        let attempt = || -> PoolResult<()> {
            let _outer = shield.expose(&seg)?;
            {
                let _inner = shield.expose(&seg)?;
                assert!(seg.protection_mode().is_empty());
            }
            assert!(seg.protection_mode().is_empty());
            Err(PoolError::StepFailed)
        };
        assert_eq!(attempt(), Err(PoolError::StepFailed));
        assert_eq!(seg.protection_mode(), AccessSet::READ);
    }

    #[test]
    fn protector_is_only_called_on_change() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let counting = Counting {
            inner: SoftwareProtector::new(),
            calls: Arc::clone(&calls),
        };
        let shield = Shield::new(Box::new(counting));
        let seg = segment();
        shield.raise(&seg, AccessSet::READ).unwrap();
        shield.raise(&seg, AccessSet::READ).unwrap();
        shield.set(&seg, AccessSet::READ).unwrap();
        shield.lower(&seg, AccessSet::WRITE).unwrap();
        assert_eq!(*calls.lock(), vec![AccessSet::READ]);
    }

    #[test]
    fn software_protector_steps_decoded_instructions() {
        let protector = SoftwareProtector::new();
        let decoded = FaultDescriptor::new(Address::from_usize(0x1000), AccessSet::READ)
            .with_instruction(4);
        let mut context = MutatorFaultContext::new(&decoded);
        assert!(protector.can_step_instruction(&context));
        protector.step_instruction(&mut context).unwrap();
        assert_eq!(context.advanced(), 4);

        let opaque = FaultDescriptor::new(Address::from_usize(0x1000), AccessSet::READ);
        let mut context = MutatorFaultContext::new(&opaque);
        assert!(!protector.can_step_instruction(&context));
        assert_eq!(
            protector.step_instruction(&mut context),
            Err(PoolError::StepFailed)
        );
    }

    #[test]
    fn closed_port_rejects_submissions() {
        let port = FaultPort::new();
        port.close();
        let fault = FaultDescriptor::new(Address::from_usize(0x1000), AccessSet::WRITE);
        assert_eq!(port.submit(fault).err(), Some(PoolError::FaultPortClosed));
    }

    #[cfg(unix)]
    #[test]
    fn mprotect_protector_round_trips_protection() {
        let page = crate::config::page_size();
        let seg = Segment::allocate(SegmentId(3), PoolId(1), page, page).unwrap();
        let protector = MprotectProtector::new(page);
        protector.protect(seg.range(), AccessSet::WRITE).unwrap();
        let word: usize = unsafe { seg.base().load() };
        assert_eq!(word, 0);
        protector.protect(seg.range(), AccessSet::empty()).unwrap();
        unsafe { seg.base().store(7usize) };
        assert!(!protector.can_step_instruction(&MutatorFaultContext::new(
            &FaultDescriptor::new(seg.base(), AccessSet::READ)
        )));
    }
}
