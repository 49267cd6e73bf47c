//! Order and Trade types for the matching engine.
//!
//! An [`Order`] is the unit of book state: immutable identity fields set
//! at admission, plus three atomic fields (`quantity`, `retired`, `next`)
//! that are only ever mutated through compare-and-swap.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam_epoch::Atomic;
use serde::{Deserialize, Serialize};

/// Order side (bid = buy, ask = sell)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Side {
    /// Buy side (bids)
    Bid = 0,
    /// Sell side (asks)
    Ask = 1,
}

impl Side {
    /// Returns the opposite side
    #[inline]
    pub const fn opposite(self) -> Self {
        match self {
            Side::Bid => Side::Ask,
            Side::Ask => Side::Bid,
        }
    }
}

/// Stable identifier for an admitted order.
///
/// Equal to the order's admission sequence, so handles are unique and
/// monotonically increasing across the whole book.
pub type OrderId = u64;

/// Returned by [`Book::add_order`](crate::Book::add_order) on admission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OrderHandle {
    /// The admitted order's id (its admission sequence).
    pub id: OrderId,
    /// Index of the shard the order was routed to.
    pub shard: usize,
}

/// Why an order was rejected at admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum OrderError {
    /// Quantity must be a positive integer
    #[error("order quantity must be positive")]
    InvalidQuantity,
    /// Price must be a positive integer (fixed tick units)
    #[error("order price must be positive")]
    InvalidPrice,
    /// Soft bound on open orders was reached; caller may retry after fills
    #[error("book capacity exhausted ({0} open orders)")]
    CapacityExhausted(usize),
}

/// A node in one side's lock-free list.
///
/// Identity fields (`sequence`, `side`, `instrument`, `price`) are set
/// once at admission and never change. `quantity` is decremented only by
/// the matching engine, through compare-exchange. `retired` is set exactly
/// once, by the CAS winner, when the quantity reaches zero; retired nodes
/// are skipped by traversals and physically unlinked by at most one thread.
#[derive(Debug)]
pub struct Order {
    /// Admission sequence; the deterministic time-priority tie-break.
    pub sequence: u64,
    /// Which side of the book the order rests on.
    pub side: Side,
    /// Instrument identifier. Matching requires exact equality, not just
    /// shard-bucket equality.
    pub instrument: Box<str>,
    /// Limit price in fixed tick units.
    pub price: u64,
    quantity: AtomicU64,
    retired: AtomicBool,
    /// Next link, owned by the list the node belongs to. Tag bit 1 on the
    /// stored pointer marks this node as logically deleted.
    pub(crate) next: Atomic<Order>,
}

impl Order {
    pub(crate) fn new(sequence: u64, side: Side, instrument: &str, quantity: u64, price: u64) -> Self {
        Self {
            sequence,
            side,
            instrument: instrument.into(),
            price,
            quantity: AtomicU64::new(quantity),
            retired: AtomicBool::new(false),
            next: Atomic::null(),
        }
    }

    /// Current remaining quantity. A snapshot; it may be decremented by a
    /// concurrent match immediately after the read.
    #[inline]
    pub fn quantity(&self) -> u64 {
        self.quantity.load(Ordering::Acquire)
    }

    /// Whether the order has been logically removed from the book.
    #[inline]
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Decrement the quantity by `amount`, but only if it is still exactly
    /// `expected`. Returns false if a concurrent match interfered; the
    /// caller must re-read and recompute before retrying.
    #[inline]
    pub(crate) fn try_take(&self, expected: u64, amount: u64) -> bool {
        debug_assert!(amount > 0 && amount <= expected);
        self.quantity
            .compare_exchange(expected, expected - amount, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Return quantity taken by a match attempt whose other leg lost its
    /// CAS race. Restoring a retired order would corrupt conservation, and
    /// can only happen through a defect in the match loop.
    #[inline]
    pub(crate) fn put_back(&self, amount: u64) {
        assert!(
            !self.is_retired(),
            "restoring quantity on a retired order (sequence {})",
            self.sequence
        );
        self.quantity.fetch_add(amount, Ordering::AcqRel);
    }

    /// Set the retired flag. Returns true for exactly one caller; only the
    /// winner may proceed to unlink the node.
    #[inline]
    pub(crate) fn mark_retired(&self) -> bool {
        self.retired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether `self` sorts strictly before `other` in a list ordered for
    /// `side`: best price first, earlier admission breaking ties.
    #[inline]
    pub(crate) fn sorts_before(&self, other: &Order, side: Side) -> bool {
        if self.price != other.price {
            match side {
                Side::Bid => self.price > other.price,
                Side::Ask => self.price < other.price,
            }
        } else {
            self.sequence < other.sequence
        }
    }
}

/// An executed match. Immutable; ownership passes to the caller of
/// [`run_matching`](crate::matching::run_matching).
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Trade {
    /// Id of the buy order.
    pub buy_order: OrderId,
    /// Id of the sell order.
    pub sell_order: OrderId,
    /// Instrument both orders belong to.
    pub instrument: Box<str>,
    /// Matched quantity, always > 0.
    pub quantity: u64,
    /// Execution price: the resting ask's price.
    pub price: u64,
}
