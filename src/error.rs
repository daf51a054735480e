//! Error types for pool, buffer, trace and shield operations.
//!
//! Only recoverable conditions live here. Invoking an operation whose
//! capability was never composed into a pool class is a wiring bug and halts
//! through [`contract_violation`] instead of returning an error.

use thiserror::Error;

use crate::address::Address;
use crate::trace::TraceState;
use crate::trace_set::TraceId;

/// Errors returned by the pool manager and the collector.
///
/// # Examples
///
/// ```
/// use poolgc::error::{PoolError, PoolResult};
///
/// let exhausted = PoolError::ResourceExhausted { requested: 4096, available: 0 };
/// assert_eq!(
///     exhausted.to_string(),
///     "resource exhausted: requested 4096 bytes, 0 available"
/// );
///
/// let failure: PoolResult<()> = Err(PoolError::TraceLimit);
/// assert!(failure.is_err());
/// ```
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The arena cannot obtain more address space under its commit limit.
    #[error("resource exhausted: requested {requested} bytes, {available} available")]
    ResourceExhausted { requested: usize, available: usize },
    /// A generic default that has no capability-preserving behaviour.
    #[error("{class}: {operation} is not implemented")]
    Unimplemented {
        class: &'static str,
        operation: &'static str,
    },
    /// Every trace identifier is in use.
    #[error("no free trace identifier")]
    TraceLimit,
    #[error("trace {trace} is {actual:?}, expected {expected:?}")]
    InvalidTraceState {
        trace: TraceId,
        expected: TraceState,
        actual: TraceState,
    },
    /// A segment color was asked to move backwards within a cycle.
    #[error("segment color for trace {trace} cannot move backwards")]
    BackwardColor { trace: TraceId },
    /// A composed capability still has an unimplemented slot.
    #[error("pool class {class} leaves {slot} unimplemented")]
    ClassCheck {
        class: &'static str,
        slot: &'static str,
    },
    #[error("no segment contains address {0}")]
    UnknownSegment(Address),
    #[error("frame is not on the buffer's frame stack")]
    NoFrame,
    #[error("ramp end without matching ramp begin")]
    NotInRamp,
    /// The platform could not emulate the faulting instruction.
    #[error("instruction at fault could not be stepped")]
    StepFailed,
    #[error("page protection failed: {0}")]
    Protection(String),
    #[error("fault port is closed")]
    FaultPortClosed,
    #[error("invalid arena configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Halt on an operation the pool class never composed.
#[cold]
#[track_caller]
pub fn contract_violation(class: &str, operation: &str) -> ! {
    panic!("contract violation: pool class {class} does not support {operation}")
}
