//! Reclaimer - epoch-based safe deletion for unlinked order nodes.
//!
//! A node unlinked from a list may still be referenced by threads that
//! loaded a pointer to it before the unlink. Freeing it eagerly (as a
//! naive `delete`-on-unlink would) is a use-after-free under concurrent
//! traversal, and address reuse would expose every CAS in the lists to
//! ABA. Instead, every traversal pins an epoch guard, and unlinked nodes
//! are handed to [`Reclaimer::retire`], which defers the free until no
//! pinned guard can still observe the node.
//!
//! Retirement and physical free are decoupled: `retire` schedules, the
//! epoch collector frees. The counters exist so tests can verify that no
//! node is freed twice and that every retired node is eventually freed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_epoch::{self as epoch, Guard, Owned, Shared};

use crate::order::Order;

/// Snapshot of the reclamation counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReclaimStats {
    /// Nodes handed out by [`Reclaimer::allocate`].
    pub allocated: usize,
    /// Nodes scheduled for deferred free.
    pub retired: usize,
    /// Nodes whose deferred free has actually run.
    pub freed: usize,
}

impl ReclaimStats {
    /// Nodes still linked into some list (allocated minus retired).
    #[inline]
    pub fn live(&self) -> usize {
        self.allocated - self.retired
    }
}

/// Epoch-based reclamation service shared by every list of one book.
#[derive(Debug, Default)]
pub struct Reclaimer {
    allocated: AtomicUsize,
    retired: AtomicUsize,
    freed: Arc<AtomicUsize>,
}

impl Reclaimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin the current thread into the epoch. Every list traversal must
    /// hold the returned guard for its whole lifetime.
    #[inline]
    pub fn pin(&self) -> Guard {
        epoch::pin()
    }

    /// Allocate a node, counted against the live total.
    pub(crate) fn allocate(&self, order: Order) -> Owned<Order> {
        self.allocated.fetch_add(1, Ordering::Relaxed);
        Owned::new(order)
    }

    /// Schedule an unlinked node for deferred free.
    ///
    /// The caller must be the thread whose CAS physically unlinked the
    /// node: that is what makes retirement exactly-once. The node must not
    /// be reachable from any list head anymore.
    pub(crate) fn retire(&self, node: Shared<'_, Order>, guard: &Guard) {
        self.retired.fetch_add(1, Ordering::Relaxed);
        let freed = Arc::clone(&self.freed);
        let raw = node.with_tag(0).as_raw() as usize;
        // Safety: the node was allocated through `allocate` (an Owned) and
        // is unreachable, so the deferred closure is its sole owner once
        // all pinned guards have moved past the current epoch.
        unsafe {
            guard.defer_unchecked(move || {
                drop(unsafe { Owned::<Order>::from_raw(raw as *mut Order) });
                freed.fetch_add(1, Ordering::Relaxed);
            });
        }
    }

    /// Ask the collector to run deferred frees soon. Advisory; tests use
    /// it to drain the backlog before checking counters.
    pub fn flush(&self) {
        let guard = epoch::pin();
        guard.flush();
    }

    /// Counter snapshot for instrumentation and tests.
    pub fn stats(&self) -> ReclaimStats {
        ReclaimStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            retired: self.retired.load(Ordering::Relaxed),
            freed: self.freed.load(Ordering::Relaxed),
        }
    }
}
