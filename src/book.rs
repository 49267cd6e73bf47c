//! Book - the top-level matching context.
//!
//! An explicit, self-contained instance (no process-global state): it owns
//! the shard table, the reclaimer and the admission-sequence counter, so a
//! process can run any number of independent books and tests get
//! deterministic isolation.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::matching::run_matching;
use crate::order::{Order, OrderError, OrderHandle, Side, Trade};
use crate::reclaim::{Reclaimer, ReclaimStats};
use crate::shard::{OrderBookShard, ShardTable};

/// Construction-time configuration, fixed for the book's lifetime.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct BookConfig {
    /// Number of shards. Higher counts reduce instrument collisions and
    /// per-shard contention, at a memory cost.
    pub shard_count: usize,
    /// Soft bound on concurrently open orders. Admission past the bound is
    /// rejected with [`OrderError::CapacityExhausted`]; under concurrent
    /// submission the bound may be overshot by the number of in-flight
    /// threads.
    pub capacity: usize,
}

impl Default for BookConfig {
    fn default() -> Self {
        Self {
            shard_count: 1024,
            capacity: 1_000_000,
        }
    }
}

/// A concurrent limit order book. All methods take `&self` and are safe to
/// call from any number of threads.
#[derive(Debug)]
pub struct Book {
    table: ShardTable,
    reclaimer: Reclaimer,
    next_sequence: AtomicU64,
    capacity: usize,
}

impl Book {
    /// Build a book from a configuration.
    ///
    /// # Panics
    /// Panics if `shard_count` is zero.
    pub fn new(config: BookConfig) -> Self {
        tracing::debug!(
            shard_count = config.shard_count,
            capacity = config.capacity,
            "constructing book"
        );
        Self {
            table: ShardTable::new(config.shard_count),
            reclaimer: Reclaimer::new(),
            next_sequence: AtomicU64::new(1),
            capacity: config.capacity,
        }
    }

    /// Book with `shard_count` shards and the default capacity.
    pub fn with_shards(shard_count: usize) -> Self {
        Self::new(BookConfig {
            shard_count,
            ..BookConfig::default()
        })
    }

    /// Validate and admit an order into its shard's list.
    ///
    /// Rejections happen before any structural mutation; a failed call
    /// leaves no partial state behind.
    pub fn add_order(
        &self,
        side: Side,
        instrument: &str,
        quantity: u64,
        price: u64,
    ) -> Result<OrderHandle, OrderError> {
        if quantity == 0 {
            return Err(OrderError::InvalidQuantity);
        }
        if price == 0 {
            return Err(OrderError::InvalidPrice);
        }
        let live = self.reclaimer.stats().live();
        if live >= self.capacity {
            return Err(OrderError::CapacityExhausted(live));
        }

        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let shard = self.table.route(instrument);
        let guard = self.reclaimer.pin();
        let order = self
            .reclaimer
            .allocate(Order::new(sequence, side, instrument, quantity, price));
        shard.list(side).insert(order, &self.reclaimer, &guard);

        Ok(OrderHandle {
            id: sequence,
            shard: shard.index(),
        })
    }

    /// Pin the current thread for read traversals of this book's lists.
    #[inline]
    pub fn pin(&self) -> crossbeam_epoch::Guard {
        self.reclaimer.pin()
    }

    /// The shard an instrument routes to. Stable for the process lifetime;
    /// exposed so callers can place work with shard affinity.
    #[inline]
    pub fn route(&self, instrument: &str) -> &OrderBookShard {
        self.table.route(instrument)
    }

    /// Shard by table position (as recorded in an [`OrderHandle`]).
    #[inline]
    pub fn shard(&self, index: usize) -> &OrderBookShard {
        self.table.shard(index)
    }

    /// Number of shards.
    #[inline]
    pub fn shard_count(&self) -> usize {
        self.table.len()
    }

    /// Drain all currently-crossing orders from one shard.
    pub fn run_matching(&self, shard: &OrderBookShard) -> Vec<Trade> {
        run_matching(shard, &self.reclaimer)
    }

    /// Drain every shard once, in table order.
    pub fn run_matching_all(&self) -> Vec<Trade> {
        let mut trades = Vec::new();
        for shard in self.table.iter() {
            trades.extend(run_matching(shard, &self.reclaimer));
        }
        trades
    }

    /// Orders currently resident across all shards.
    pub fn open_orders(&self) -> usize {
        self.reclaimer.stats().live()
    }

    /// Total live quantity resting for one instrument, both sides.
    /// A snapshot; concurrent matching can change it immediately.
    pub fn resident_quantity(&self, instrument: &str) -> u64 {
        let shard = self.table.route(instrument);
        let guard = self.reclaimer.pin();
        shard
            .bids
            .iter(&guard)
            .chain(shard.asks.iter(&guard))
            .filter(|o| &*o.instrument == instrument)
            .map(|o| o.quantity())
            .sum()
    }

    /// Reclamation counters, for instrumentation and leak checks.
    pub fn reclaim_stats(&self) -> ReclaimStats {
        self.reclaimer.stats()
    }

    /// Push the epoch collector forward so deferred frees run.
    pub fn flush_reclaimer(&self) {
        self.reclaimer.flush();
    }
}

impl Default for Book {
    fn default() -> Self {
        Self::new(BookConfig::default())
    }
}
