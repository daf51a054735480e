//! Root registry.
//!
//! Roots are the references the collector treats as reachable without
//! tracing: tables of reference words owned by the client, and closures that
//! fix references held in structures the collector cannot see. Every root
//! is scanned when a trace flips.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::trace;

use crate::address::{AddrRange, Address, WORD};
use crate::error::PoolResult;
use crate::scan::ScanState;

/// Handle returned when a root is registered.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct RootId(u64);

/// Closure that fixes the references of a client structure.
pub type RootFn = Box<dyn Fn(&mut ScanState<'_>) -> PoolResult<()> + Send + Sync>;

pub enum Root {
    /// Word-aligned range of reference words.
    Table(AddrRange),
    Fn(RootFn),
}

impl Root {
    fn scan(&self, ss: &mut ScanState<'_>) -> PoolResult<()> {
        match self {
            Root::Table(range) => {
                let mut slot = range.base();
                while slot < range.limit() {
                    // Registration guarantees the table is live and aligned.
                    unsafe { ss.fix_slot(slot)? };
                    slot += WORD;
                }
                Ok(())
            }
            Root::Fn(scan) => scan(ss),
        }
    }
}

impl fmt::Debug for Root {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Root::Table(range) => f.debug_tuple("Table").field(range).finish(),
            Root::Fn(_) => f.write_str("Fn(..)"),
        }
    }
}

#[derive(Default)]
pub struct RootRegistry {
    roots: DashMap<RootId, Arc<Root>>,
    next_id: AtomicU64,
}

impl RootRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, root: Root) -> RootId {
        let id = RootId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.roots.insert(id, Arc::new(root));
        id
    }

    /// Register the reference words in `[base, limit)`.
    ///
    /// # Safety
    /// The range must stay valid for reads and writes, and hold only null or
    /// heap references, until the root is destroyed.
    pub unsafe fn create_table(&self, base: Address, limit: Address) -> RootId {
        assert!(
            base.is_aligned(WORD) && limit.is_aligned(WORD),
            "contract violation: root table {base}..{limit} is not word aligned"
        );
        self.insert(Root::Table(AddrRange::new(base, limit)))
    }

    pub fn create_fn<F>(&self, scan: F) -> RootId
    where
        F: Fn(&mut ScanState<'_>) -> PoolResult<()> + Send + Sync + 'static,
    {
        self.insert(Root::Fn(Box::new(scan)))
    }

    /// Returns `false` if no such root was registered.
    pub fn destroy(&self, id: RootId) -> bool {
        self.roots.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Scan every root in registration order.
    pub fn scan_all(&self, ss: &mut ScanState<'_>) -> PoolResult<()> {
        let mut roots: Vec<(RootId, Arc<Root>)> = self
            .roots
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();
        roots.sort_by_key(|(id, _)| *id);
        for (id, root) in roots {
            trace!(root = id.0, "scanning root");
            root.scan(ss)?;
        }
        Ok(())
    }
}

impl fmt::Debug for RootRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootRegistry")
            .field("roots", &self.roots.len())
            .finish()
    }
}
