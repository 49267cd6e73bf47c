//! OrderBookShard and ShardTable - instrument-to-shard routing.
//!
//! A shard pairs a bid list and an ask list for a bucket of instruments.
//! The table is a fixed array of shards; an instrument routes to the same
//! shard for the whole process lifetime via a stable FxHash modulo the
//! shard count. Shards never coordinate with each other.

use std::hash::Hasher;

use crossbeam_epoch::Guard;
use crossbeam_utils::CachePadded;
use rustc_hash::FxHasher;

use crate::list::OrderList;
use crate::order::Side;

/// One bucket of the book: a bid list and an ask list.
#[derive(Debug)]
pub struct OrderBookShard {
    index: usize,
    pub(crate) bids: OrderList,
    pub(crate) asks: OrderList,
}

impl OrderBookShard {
    fn new(index: usize) -> Self {
        Self {
            index,
            bids: OrderList::new(Side::Bid),
            asks: OrderList::new(Side::Ask),
        }
    }

    /// Position of this shard in the table.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// The requested side's list.
    #[inline]
    pub fn list(&self, side: Side) -> &OrderList {
        match side {
            Side::Bid => &self.bids,
            Side::Ask => &self.asks,
        }
    }

    /// True if neither side holds a live order.
    pub fn is_empty(&self, guard: &Guard) -> bool {
        self.bids.is_empty(guard) && self.asks.is_empty(guard)
    }

    /// Instrument identifiers currently resident in this shard, deduped,
    /// in no particular order. Derived from the lists; a snapshot.
    pub fn resident_instruments(&self, guard: &Guard) -> Vec<Box<str>> {
        let mut out: Vec<Box<str>> = Vec::new();
        for order in self.bids.iter(guard).chain(self.asks.iter(guard)) {
            if !out.iter().any(|i| **i == *order.instrument) {
                out.push(order.instrument.clone());
            }
        }
        out
    }
}

/// Fixed array of shards with pure, stateless routing.
#[derive(Debug)]
pub struct ShardTable {
    shards: Box<[CachePadded<OrderBookShard>]>,
}

impl ShardTable {
    /// Build a table of `shard_count` independent shards.
    ///
    /// # Panics
    /// Panics if `shard_count` is zero.
    pub fn new(shard_count: usize) -> Self {
        assert!(shard_count > 0, "shard count must be positive");
        let shards = (0..shard_count)
            .map(|i| CachePadded::new(OrderBookShard::new(i)))
            .collect();
        Self { shards }
    }

    /// Route an instrument to its shard. O(1), no allocation, total.
    #[inline]
    pub fn route(&self, instrument: &str) -> &OrderBookShard {
        let mut hasher = FxHasher::default();
        hasher.write(instrument.as_bytes());
        let index = (hasher.finish() as usize) % self.shards.len();
        &self.shards[index]
    }

    /// Shard by table position.
    #[inline]
    pub fn shard(&self, index: usize) -> &OrderBookShard {
        &self.shards[index]
    }

    /// Number of shards.
    #[inline]
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Iterate all shards in table order.
    pub fn iter(&self) -> impl Iterator<Item = &OrderBookShard> {
        self.shards.iter().map(|s| &**s)
    }
}
