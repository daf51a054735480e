//! Pluggable memory pools sharing an incremental tracing collector.
//!
//! Allocation strategies are written as [`pool::PoolClass`]es assembled from
//! capability bundles. Every pool lives in an [`arena::Arena`], which hands
//! out [`segment::Segment`]s and runs traces across all collectible pools
//! with per-segment tri-color state. The [`shield`] turns the collector's
//! barriers into page protection and routes mutator faults back to the
//! owning pool.
//!
//! # Examples
//!
//! ```
//! use poolgc::arena::Arena;
//! use poolgc::config::ArenaConfig;
//! use poolgc::test_utils::WordPool;
//!
//! let arena = Arena::new(ArenaConfig::default()).unwrap();
//! let pool = WordPool::create(&arena).unwrap();
//! let buffer = pool.create_buffer();
//!
//! // One unreachable object.
//! WordPool::allocate(&buffer, &[]).unwrap();
//! buffer.empty();
//!
//! let stats = arena.collect().unwrap();
//! assert_eq!(stats.reclaimed_segments, 1);
//! assert_eq!(arena.segment_count(), 0);
//! ```

pub mod address;
pub mod arena;
pub mod buffer;
pub mod config;
pub mod error;
pub mod format;
pub mod pool;
pub mod roots;
pub mod scan;
pub mod segment;
pub mod shield;
pub mod test_utils;
pub mod trace;
pub mod trace_set;

pub use address::{AddrRange, Address};
pub use arena::{Arena, ArenaStats};
pub use buffer::{Buffer, Frame};
pub use config::{ArenaConfig, ProtectionMode};
pub use error::{PoolError, PoolResult};
pub use pool::{Bundle, Pool, PoolAttr, PoolClass, pool_scan_free_size};
pub use segment::Segment;
pub use shield::{FaultDescriptor, FaultOutcome, MutatorFaultContext};
pub use trace::{Trace, TraceReason, TraceState, TraceStats};
pub use trace_set::{AccessSet, Color, RefSet, TraceId, TraceSet};
