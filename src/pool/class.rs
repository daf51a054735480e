//! Pool classes: capability masks plus a table of method slots.
//!
//! A class starts from [`PoolClass::abstract_pool`], where every operation is
//! [`Slot::Unimplemented`] apart from a handful of harmless diagnostics.
//! Capability bundles are composed onto it in dependency order; each bundle
//! sets its attribute bits and installs its generic defaults. Strategies then
//! override individual operations with the `with_*` builders.
//!
//! # Examples
//!
//! ```
//! use poolgc::pool::{Bundle, PoolAttr, PoolClass, SlotKind};
//!
//! let class = PoolClass::abstract_pool("Plain")
//!     .compose(Bundle::AllocFree)
//!     .compose(Bundle::Buffered);
//! assert!(class.attr().contains(PoolAttr::ALLOC | PoolAttr::FREE | PoolAttr::BUF));
//! assert_eq!(class.buffer_fill.kind(), SlotKind::Default);
//! assert_eq!(class.scan.kind(), SlotKind::Unimplemented);
//! ```

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;

use super::Pool;
use super::methods;
use crate::address::{AddrRange, Address};
use crate::buffer::{BufferState, Frame};
use crate::error::{PoolError, PoolResult, contract_violation};
use crate::scan::ScanState;
use crate::segment::Segment;
use crate::shield::MutatorFaultContext;
use crate::trace::Trace;
use crate::trace_set::{AccessSet, TraceSet};

bitflags! {
    /// Capabilities a pool class supports.
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PoolAttr: u16 {
        /// Direct allocation.
        const ALLOC = 1 << 0;
        /// Direct free.
        const FREE = 1 << 1;
        /// Allocation through buffers.
        const BUF = 1 << 2;
        /// Buffers are carved from arena segments.
        const SEG = 1 << 3;
        /// Segments may hold references and can be scanned.
        const SCAN = 1 << 4;
        /// Segments can be condemned and reclaimed.
        const GC = 1 << 5;
    }
}

pub type InitMethod = fn(&Pool) -> PoolResult<()>;
pub type FinishMethod = fn(&Pool);
pub type AllocMethod = fn(&Pool, usize) -> PoolResult<AddrRange>;
pub type FreeMethod = fn(&Pool, Address, usize);
pub type BufferFillMethod = fn(&Pool, &mut BufferState, usize) -> PoolResult<AddrRange>;
pub type BufferEmptyMethod = fn(&Pool, &mut BufferState, Address, Address);
pub type AccessMethod =
    fn(&Pool, &Arc<Segment>, Address, AccessSet, &mut MutatorFaultContext<'_>) -> PoolResult<()>;
pub type WhitenMethod = fn(&Pool, &Segment, &Trace) -> PoolResult<()>;
pub type GreyMethod = fn(&Pool, &Segment, &Trace);
pub type BlackenMethod = fn(&Pool, &Segment, TraceSet);
/// Returns `true` when the scan was total, i.e. visited every reference.
pub type ScanMethod = fn(&Pool, &Segment, &mut ScanState<'_>) -> PoolResult<bool>;
pub type FixMethod = fn(&Pool, &Segment, &mut ScanState<'_>, &mut Address) -> PoolResult<()>;
pub type ReclaimMethod = fn(&Pool, &Arc<Segment>, &Trace);
pub type RampBeginMethod = fn(&Pool, &BufferState, bool);
pub type RampEndMethod = fn(&Pool, &BufferState);
pub type FramePushMethod = fn(&Pool, &mut BufferState, &Frame) -> PoolResult<()>;
pub type FramePopMethod = fn(&Pool, &mut BufferState, &Frame) -> PoolResult<()>;
pub type FramePopPendingMethod = fn(&Pool, &mut BufferState, &Frame);
pub type WalkMethod = fn(&Pool, &Segment, &mut dyn FnMut(Address, usize));
pub type FreeWalkMethod = fn(&Pool, &mut dyn FnMut(Address, usize));
pub type DescribeMethod = fn(&Pool, &mut dyn fmt::Write) -> fmt::Result;

/// How a method slot is filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Unimplemented,
    Default,
    Overridden,
}

/// One entry of a class's method table.
#[derive(Clone, Copy)]
pub enum Slot<F: Copy> {
    /// The capability was never composed; calling it is a contract violation.
    Unimplemented,
    /// Generic implementation installed by a capability bundle.
    Default(F),
    /// Strategy-specific implementation.
    Overridden(F),
}

impl<F: Copy> Slot<F> {
    /// Which of the three states the slot is in.
    pub fn kind(&self) -> SlotKind {
        match self {
            Slot::Unimplemented => SlotKind::Unimplemented,
            Slot::Default(_) => SlotKind::Default,
            Slot::Overridden(_) => SlotKind::Overridden,
        }
    }

    pub fn is_unimplemented(&self) -> bool {
        matches!(self, Slot::Unimplemented)
    }

    /// The installed method, default or overridden.
    pub fn method(&self) -> Option<F> {
        match self {
            Slot::Unimplemented => None,
            Slot::Default(f) | Slot::Overridden(f) => Some(*f),
        }
    }

    /// The callable method, or a contract violation.
    #[track_caller]
    pub fn resolve(&self, class: &str, operation: &'static str) -> F {
        match self {
            Slot::Unimplemented => contract_violation(class, operation),
            Slot::Default(f) | Slot::Overridden(f) => *f,
        }
    }

    /// Install a generic default unless a strategy already overrode the slot.
    fn install_default(&mut self, method: F) {
        if !matches!(self, Slot::Overridden(_)) {
            *self = Slot::Default(method);
        }
    }
}

impl<F: Copy> fmt::Debug for Slot<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.kind(), f)
    }
}

/// Capability bundles, listed in dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bundle {
    /// Direct allocation and free.
    AllocFree,
    /// Reserve/commit through buffers, with trivial frames.
    Buffered,
    /// Buffers carved from this framework's segments.
    SegmentBuffered,
    /// Fault access handler plus grey/blacken bookkeeping.
    Scannable,
    /// Whiten and ramp bookkeeping.
    Collectible,
}

impl Bundle {
    pub const ALL: [Bundle; 5] = [
        Bundle::AllocFree,
        Bundle::Buffered,
        Bundle::SegmentBuffered,
        Bundle::Scannable,
        Bundle::Collectible,
    ];

    /// Attribute bits this bundle adds.
    pub fn attr(self) -> PoolAttr {
        match self {
            Bundle::AllocFree => PoolAttr::ALLOC | PoolAttr::FREE,
            Bundle::Buffered => PoolAttr::BUF,
            Bundle::SegmentBuffered => PoolAttr::BUF | PoolAttr::SEG,
            Bundle::Scannable => PoolAttr::SCAN,
            Bundle::Collectible => PoolAttr::GC,
        }
    }

    /// Attribute bits that must already be composed.
    pub fn requires(self) -> PoolAttr {
        match self {
            Bundle::AllocFree | Bundle::Buffered => PoolAttr::empty(),
            Bundle::SegmentBuffered => PoolAttr::BUF,
            Bundle::Scannable => PoolAttr::SEG,
            Bundle::Collectible => PoolAttr::SCAN,
        }
    }
}

macro_rules! slot_overrides {
    ($($(#[$meta:meta])* $builder:ident => $slot:ident: $ty:ty;)*) => {
        $(
            $(#[$meta])*
            #[must_use]
            pub fn $builder(mut self, method: $ty) -> Self {
                self.$slot = Slot::Overridden(method);
                self
            }
        )*
    };
}

/// A capability profile: attribute mask plus method table.
#[derive(Clone)]
pub struct PoolClass {
    name: &'static str,
    attr: PoolAttr,
    pub init: Slot<InitMethod>,
    pub finish: Slot<FinishMethod>,
    pub alloc: Slot<AllocMethod>,
    pub free: Slot<FreeMethod>,
    pub buffer_fill: Slot<BufferFillMethod>,
    pub buffer_empty: Slot<BufferEmptyMethod>,
    pub access: Slot<AccessMethod>,
    pub whiten: Slot<WhitenMethod>,
    pub grey: Slot<GreyMethod>,
    pub blacken: Slot<BlackenMethod>,
    pub scan: Slot<ScanMethod>,
    pub fix: Slot<FixMethod>,
    pub reclaim: Slot<ReclaimMethod>,
    pub ramp_begin: Slot<RampBeginMethod>,
    pub ramp_end: Slot<RampEndMethod>,
    pub frame_push: Slot<FramePushMethod>,
    pub frame_pop: Slot<FramePopMethod>,
    pub frame_pop_pending: Slot<FramePopPendingMethod>,
    pub walk: Slot<WalkMethod>,
    pub free_walk: Slot<FreeWalkMethod>,
    pub describe: Slot<DescribeMethod>,
}

impl PoolClass {
    /// The base profile every strategy starts from.
    pub fn abstract_pool(name: &'static str) -> Self {
        Self {
            name,
            attr: PoolAttr::empty(),
            init: Slot::Default(methods::trivial_init),
            finish: Slot::Default(methods::trivial_finish),
            alloc: Slot::Unimplemented,
            free: Slot::Unimplemented,
            buffer_fill: Slot::Unimplemented,
            buffer_empty: Slot::Unimplemented,
            access: Slot::Unimplemented,
            whiten: Slot::Unimplemented,
            grey: Slot::Unimplemented,
            blacken: Slot::Unimplemented,
            scan: Slot::Unimplemented,
            fix: Slot::Unimplemented,
            reclaim: Slot::Unimplemented,
            ramp_begin: Slot::Unimplemented,
            ramp_end: Slot::Unimplemented,
            frame_push: Slot::Unimplemented,
            frame_pop: Slot::Unimplemented,
            frame_pop_pending: Slot::Unimplemented,
            walk: Slot::Default(methods::trivial_walk),
            free_walk: Slot::Default(methods::trivial_free_walk),
            describe: Slot::Default(methods::trivial_describe),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn attr(&self) -> PoolAttr {
        self.attr
    }

    pub fn has(&self, attr: PoolAttr) -> bool {
        self.attr.contains(attr)
    }

    /// Compose a capability bundle onto this profile.
    ///
    /// Sets the bundle's attribute bits and installs its generic defaults
    /// into its own slots; overridden slots and all other slots are left
    /// alone, so composing the same bundle twice changes nothing further.
    /// Re-composing [`Bundle::Buffered`] after [`Bundle::SegmentBuffered`]
    /// keeps the segment fill and empty. Composing a bundle whose
    /// prerequisites are missing is a contract violation.
    ///
    /// # Examples
    ///
    /// ```
    /// use poolgc::pool::{methods, Bundle, BufferFillMethod, PoolAttr, PoolClass};
    ///
    /// let class = PoolClass::abstract_pool("Layered")
    ///     .compose(Bundle::Buffered)
    ///     .compose(Bundle::SegmentBuffered)
    ///     .compose(Bundle::Buffered);
    /// assert!(class.has(PoolAttr::BUF | PoolAttr::SEG));
    /// assert_eq!(
    ///     class.buffer_fill.method().map(|f| f as usize),
    ///     Some(methods::seg_buffer_fill as BufferFillMethod as usize)
    /// );
    /// ```
    #[must_use]
    pub fn compose(mut self, bundle: Bundle) -> Self {
        assert!(
            self.attr.contains(bundle.requires()),
            "contract violation: {:?} requires {:?} on pool class {}",
            bundle,
            bundle.requires(),
            self.name
        );
        self.attr |= bundle.attr();
        match bundle {
            Bundle::AllocFree => {
                self.alloc.install_default(methods::trivial_alloc);
                self.free.install_default(methods::trivial_free);
            }
            Bundle::Buffered => {
                // Segment buffering refines these two; keep its defaults.
                if !self.attr.contains(PoolAttr::SEG) {
                    self.buffer_fill.install_default(methods::trivial_buffer_fill);
                    self.buffer_empty.install_default(methods::trivial_buffer_empty);
                }
                self.frame_push.install_default(methods::trivial_frame_push);
                self.frame_pop.install_default(methods::trivial_frame_pop);
                self.frame_pop_pending
                    .install_default(methods::trivial_frame_pop_pending);
            }
            Bundle::SegmentBuffered => {
                self.buffer_fill.install_default(methods::seg_buffer_fill);
                self.buffer_empty.install_default(methods::seg_buffer_empty);
            }
            Bundle::Scannable => {
                self.access.install_default(methods::seg_access);
                self.grey.install_default(methods::trivial_grey);
                self.blacken.install_default(methods::trivial_blacken);
            }
            Bundle::Collectible => {
                self.whiten.install_default(methods::trivial_whiten);
                self.ramp_begin.install_default(methods::trivial_ramp_begin);
                self.ramp_end.install_default(methods::trivial_ramp_end);
            }
        }
        self
    }

    slot_overrides! {
        with_init => init: InitMethod;
        with_finish => finish: FinishMethod;
        with_alloc => alloc: AllocMethod;
        with_free => free: FreeMethod;
        with_buffer_fill => buffer_fill: BufferFillMethod;
        with_buffer_empty => buffer_empty: BufferEmptyMethod;
        /// Replace the fault handler, e.g. with [`methods::single_access`].
        with_access => access: AccessMethod;
        with_whiten => whiten: WhitenMethod;
        with_grey => grey: GreyMethod;
        with_blacken => blacken: BlackenMethod;
        with_scan => scan: ScanMethod;
        with_fix => fix: FixMethod;
        with_reclaim => reclaim: ReclaimMethod;
        with_ramp_begin => ramp_begin: RampBeginMethod;
        with_ramp_end => ramp_end: RampEndMethod;
        with_frame_push => frame_push: FramePushMethod;
        with_frame_pop => frame_pop: FramePopMethod;
        with_frame_pop_pending => frame_pop_pending: FramePopPendingMethod;
        with_walk => walk: WalkMethod;
        with_free_walk => free_walk: FreeWalkMethod;
        with_describe => describe: DescribeMethod;
    }

    /// Every slot with the capability that makes it callable.
    pub fn slot_kinds(&self) -> Vec<(&'static str, PoolAttr, SlotKind)> {
        vec![
            ("init", PoolAttr::empty(), self.init.kind()),
            ("finish", PoolAttr::empty(), self.finish.kind()),
            ("alloc", PoolAttr::ALLOC, self.alloc.kind()),
            ("free", PoolAttr::FREE, self.free.kind()),
            ("buffer_fill", PoolAttr::BUF, self.buffer_fill.kind()),
            ("buffer_empty", PoolAttr::BUF, self.buffer_empty.kind()),
            ("access", PoolAttr::SCAN, self.access.kind()),
            ("whiten", PoolAttr::GC, self.whiten.kind()),
            ("grey", PoolAttr::SCAN, self.grey.kind()),
            ("blacken", PoolAttr::SCAN, self.blacken.kind()),
            ("scan", PoolAttr::SCAN, self.scan.kind()),
            ("fix", PoolAttr::GC, self.fix.kind()),
            ("reclaim", PoolAttr::GC, self.reclaim.kind()),
            ("ramp_begin", PoolAttr::GC, self.ramp_begin.kind()),
            ("ramp_end", PoolAttr::GC, self.ramp_end.kind()),
            ("frame_push", PoolAttr::BUF, self.frame_push.kind()),
            ("frame_pop", PoolAttr::BUF, self.frame_pop.kind()),
            ("frame_pop_pending", PoolAttr::BUF, self.frame_pop_pending.kind()),
            ("walk", PoolAttr::empty(), self.walk.kind()),
            ("free_walk", PoolAttr::empty(), self.free_walk.kind()),
            ("describe", PoolAttr::empty(), self.describe.kind()),
        ]
    }

    /// Slots that a composed capability makes public but nothing implements.
    pub fn unimplemented_slots(&self) -> Vec<&'static str> {
        self.slot_kinds()
            .into_iter()
            .filter(|(_, attr, kind)| {
                self.attr.contains(*attr) && *kind == SlotKind::Unimplemented
            })
            .map(|(name, _, _)| name)
            .collect()
    }

    /// Verify the class is fully assembled.
    ///
    /// Every slot reachable through a composed capability must be callable;
    /// scanning classes must supply `scan`, and collectible classes must
    /// additionally supply `fix` and `reclaim`, since those have no generic
    /// default.
    pub fn check(&self) -> PoolResult<()> {
        if let Some(slot) = self.unimplemented_slots().into_iter().next() {
            return Err(PoolError::ClassCheck {
                class: self.name,
                slot,
            });
        }
        Ok(())
    }
}

impl fmt::Debug for PoolClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolClass")
            .field("name", &self.name)
            .field("attr", &self.attr)
            .finish_non_exhaustive()
    }
}

/// Strategy-owned state attached to a pool instance.
pub type PoolState = Box<dyn Any + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abstract_pool_has_no_capabilities() {
        let class = PoolClass::abstract_pool("Abstract");
        assert!(class.attr().is_empty());
        assert!(class.alloc.is_unimplemented());
        assert!(class.access.is_unimplemented());
        assert_eq!(class.describe.kind(), SlotKind::Default);
        assert!(class.check().is_ok());
    }

    #[test]
    fn each_bundle_adds_exactly_its_bits() {
        let mut class = PoolClass::abstract_pool("Stack");
        for bundle in Bundle::ALL {
            let before = class.attr();
            class = class.compose(bundle);
            assert_eq!(class.attr(), before | bundle.attr());
        }
    }

    #[test]
    fn composing_twice_is_idempotent() {
        let once = PoolClass::abstract_pool("Twice").compose(Bundle::Buffered);
        let twice = once.clone().compose(Bundle::Buffered);
        assert_eq!(once.attr(), twice.attr());
        let kinds = |c: &PoolClass| {
            c.slot_kinds()
                .into_iter()
                .map(|(name, _, kind)| (name, kind))
                .collect::<Vec<_>>()
        };
        assert_eq!(kinds(&once), kinds(&twice));
        assert_eq!(
            once.buffer_fill.method().map(|f| f as usize),
            twice.buffer_fill.method().map(|f| f as usize)
        );
    }

    #[test]
    fn segment_buffering_specialises_buffer_fill() {
        let buffered = PoolClass::abstract_pool("Seg").compose(Bundle::Buffered);
        let seg = buffered.clone().compose(Bundle::SegmentBuffered);
        assert_ne!(
            buffered.buffer_fill.method().map(|f| f as usize),
            seg.buffer_fill.method().map(|f| f as usize)
        );
        assert_eq!(
            seg.buffer_fill.method().map(|f| f as usize),
            Some(methods::seg_buffer_fill as BufferFillMethod as usize)
        );
    }

    #[test]
    fn rebuffering_keeps_segment_fill() {
        let class = PoolClass::abstract_pool("Relayered")
            .compose(Bundle::Buffered)
            .compose(Bundle::SegmentBuffered)
            .compose(Bundle::Buffered);
        assert_eq!(
            class.buffer_fill.method().map(|f| f as usize),
            Some(methods::seg_buffer_fill as BufferFillMethod as usize)
        );
        assert_eq!(
            class.buffer_empty.method().map(|f| f as usize),
            Some(methods::seg_buffer_empty as BufferEmptyMethod as usize)
        );
        assert_eq!(class.frame_push.kind(), SlotKind::Default);
    }

    #[test]
    fn overrides_survive_later_composition() {
        fn custom_fill(_: &Pool, _: &mut BufferState, _: usize) -> PoolResult<AddrRange> {
            Ok(AddrRange::default())
        }
        let class = PoolClass::abstract_pool("Custom")
            .compose(Bundle::Buffered)
            .with_buffer_fill(custom_fill)
            .compose(Bundle::SegmentBuffered);
        assert_eq!(class.buffer_fill.kind(), SlotKind::Overridden);
        assert_eq!(
            class.buffer_fill.method().map(|f| f as usize),
            Some(custom_fill as BufferFillMethod as usize)
        );
    }

    #[test]
    #[should_panic(expected = "requires")]
    fn composing_out_of_order_is_a_contract_violation() {
        let _ = PoolClass::abstract_pool("Broken").compose(Bundle::Collectible);
    }

    #[test]
    fn collectible_class_without_scan_fails_check() {
        let class = PoolClass::abstract_pool("Leaky")
            .compose(Bundle::Buffered)
            .compose(Bundle::SegmentBuffered)
            .compose(Bundle::Scannable)
            .compose(Bundle::Collectible);
        assert_eq!(
            class.check(),
            Err(PoolError::ClassCheck {
                class: "Leaky",
                slot: "scan"
            })
        );
        assert_eq!(class.unimplemented_slots(), vec!["scan", "fix", "reclaim"]);
    }

    #[test]
    #[should_panic(expected = "does not support buffer_fill")]
    fn resolving_unimplemented_slot_panics() {
        let class = PoolClass::abstract_pool("Direct").compose(Bundle::AllocFree);
        let _ = class.buffer_fill.resolve(class.name(), "buffer_fill");
    }
}
