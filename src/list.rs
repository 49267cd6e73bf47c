//! OrderList - lock-free sorted singly-linked list, one per side per shard.
//!
//! Invariant: between CASes the chain is strictly ordered by the side's
//! comparator (best price first, earlier admission sequence breaking
//! ties), and no node is ever linked into more than one list or into the
//! same list twice.
//!
//! Removal is two-phase. A node is first logically deleted: its `retired`
//! flag is set (exactly one CAS winner), then the tag bit on its own
//! `next` pointer is set so no insert can link behind it and its successor
//! is frozen. It is then physically unlinked by swinging the unique
//! incoming link past it. Whichever thread's CAS performs the swing - the
//! designated unlinker or a traversal helping along the way - is the one
//! and only thread that hands the node to the [`Reclaimer`].
//!
//! Insert CAS failures always restart the traversal from the head.
//! Resuming from stale `prev`/`cur` pointers could link into a
//! neighborhood invalidated by a concurrent unlink and silently break the
//! ordering invariant.

use std::sync::atomic::Ordering;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};

use crate::order::{Order, Side};
use crate::reclaim::Reclaimer;

/// Tag bit on a node's own `next` pointer marking the node as logically
/// deleted.
const DELETED: usize = 1;

/// One side of one shard's book.
#[derive(Debug)]
pub struct OrderList {
    head: Atomic<Order>,
    side: Side,
}

impl OrderList {
    pub fn new(side: Side) -> Self {
        Self {
            head: Atomic::null(),
            side,
        }
    }

    /// Which side's comparator orders this list.
    #[inline]
    pub fn side(&self) -> Side {
        self.side
    }

    /// Insert an order at its unique position in the sort order.
    ///
    /// Lock-free: a CAS failure means another thread mutated the local
    /// neighborhood (and made progress); we restart from the head.
    pub fn insert(&self, mut order: Owned<Order>, reclaimer: &Reclaimer, guard: &Guard) {
        debug_assert_eq!(order.side, self.side);
        loop {
            match self.try_insert(order, reclaimer, guard) {
                Ok(()) => return,
                Err(returned) => order = returned,
            }
        }
    }

    /// One head-to-position traversal plus one link CAS.
    fn try_insert(
        &self,
        order: Owned<Order>,
        reclaimer: &Reclaimer,
        guard: &Guard,
    ) -> Result<(), Owned<Order>> {
        let mut prev: &Atomic<Order> = &self.head;
        let mut cur = prev.load(Ordering::Acquire, guard);

        loop {
            let cur_ref = match unsafe { cur.as_ref() } {
                Some(r) => r,
                None => break, // position is at the tail
            };
            let next = cur_ref.next.load(Ordering::Acquire, guard);
            if next.tag() == DELETED {
                // cur is logically deleted; help swing `prev` past it,
                // then restart so the position is computed on live nodes.
                if prev
                    .compare_exchange(cur, next.with_tag(0), Ordering::AcqRel, Ordering::Acquire, guard)
                    .is_ok()
                {
                    reclaimer.retire(cur, guard);
                }
                return Err(order);
            }
            if cur_ref.sorts_before(&order, self.side) {
                prev = &cur_ref.next;
                cur = next;
            } else {
                break;
            }
        }

        order.next.store(cur, Ordering::Relaxed);
        match prev.compare_exchange(cur, order, Ordering::AcqRel, Ordering::Acquire, guard) {
            Ok(_) => Ok(()),
            Err(e) => Err(e.new),
        }
    }

    /// The current best live order, or `None` if the side is empty.
    ///
    /// A snapshot, not a reservation: the node may be matched or retired
    /// by another thread immediately after the read.
    #[inline]
    pub fn peek_best<'g>(&self, guard: &'g Guard) -> Option<&'g Order> {
        self.iter(guard).next()
    }

    /// Iterate the live (non-retired) orders in sort order.
    pub fn iter<'g>(&self, guard: &'g Guard) -> Iter<'g> {
        Iter {
            cur: self.head.load(Ordering::Acquire, guard),
            guard,
        }
    }

    /// True if no live order is reachable.
    pub fn is_empty(&self, guard: &Guard) -> bool {
        self.peek_best(guard).is_none()
    }

    /// Physically unlink a node that is already marked retired.
    ///
    /// Exactly one caller per node (the winner of the `retired` CAS), but
    /// a concurrent traversal may have helped the unlink already; in that
    /// case the node is no longer reachable and there is nothing to do.
    pub fn unlink_if_retired(&self, node: &Order, reclaimer: &Reclaimer, guard: &Guard) {
        debug_assert!(node.is_retired());

        // Phase 1: freeze the node's own next pointer. After this no
        // insert can succeed on it and its successor is pinned down.
        let mut next = node.next.load(Ordering::Acquire, guard);
        while next.tag() != DELETED {
            match node.next.compare_exchange(
                next,
                next.with_tag(DELETED),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(_) => break,
                Err(e) => next = e.current,
            }
        }

        // Phase 2: swing the unique incoming link past the node.
        let target = Shared::from(node as *const Order);
        'retry: loop {
            let mut prev: &Atomic<Order> = &self.head;
            let mut cur = prev.load(Ordering::Acquire, guard);
            loop {
                let cur_ref = match unsafe { cur.as_ref() } {
                    Some(r) => r,
                    None => return, // not reachable: someone helped us
                };
                let nxt = cur_ref.next.load(Ordering::Acquire, guard);
                if cur == target {
                    match prev.compare_exchange(
                        cur,
                        nxt.with_tag(0),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        guard,
                    ) {
                        Ok(_) => {
                            reclaimer.retire(cur, guard);
                            return;
                        }
                        Err(_) => continue 'retry,
                    }
                }
                if nxt.tag() == DELETED {
                    // Unrelated deleted node on the path; help unlink it.
                    match prev.compare_exchange(
                        cur,
                        nxt.with_tag(0),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        guard,
                    ) {
                        Ok(_) => {
                            reclaimer.retire(cur, guard);
                            cur = nxt.with_tag(0);
                            continue;
                        }
                        Err(_) => continue 'retry,
                    }
                }
                prev = &cur_ref.next;
                cur = nxt;
            }
        }
    }
}

impl Drop for OrderList {
    fn drop(&mut self) {
        // Sole owner at this point; walk the chain and free what is still
        // linked. Nodes already retired to the reclaimer are not reachable
        // from the head and are freed by the epoch collector.
        unsafe {
            let guard = epoch::unprotected();
            let mut cur = self.head.load(Ordering::Relaxed, guard);
            while let Some(r) = cur.as_ref() {
                let next = r.next.load(Ordering::Relaxed, guard);
                drop(cur.into_owned());
                cur = next.with_tag(0);
            }
        }
    }
}

/// Iterator over live orders; skips retired nodes.
pub struct Iter<'g> {
    cur: Shared<'g, Order>,
    guard: &'g Guard,
}

impl<'g> Iterator for Iter<'g> {
    type Item = &'g Order;

    fn next(&mut self) -> Option<&'g Order> {
        while let Some(r) = unsafe { self.cur.as_ref() } {
            self.cur = r.next.load(Ordering::Acquire, self.guard).with_tag(0);
            if !r.is_retired() {
                return Some(r);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::Side;

    fn push(list: &OrderList, r: &Reclaimer, seq: u64, qty: u64, price: u64) {
        let guard = r.pin();
        let order = r.allocate(Order::new(seq, list.side(), "X", qty, price));
        list.insert(order, r, &guard);
    }

    fn prices(list: &OrderList, r: &Reclaimer) -> Vec<(u64, u64)> {
        let guard = r.pin();
        list.iter(&guard).map(|o| (o.price, o.sequence)).collect()
    }

    #[test]
    fn test_bid_insert_orders_price_descending() {
        let r = Reclaimer::new();
        let bids = OrderList::new(Side::Bid);

        push(&bids, &r, 1, 10, 100);
        push(&bids, &r, 2, 5, 101);
        push(&bids, &r, 3, 7, 99);

        assert_eq!(prices(&bids, &r), vec![(101, 2), (100, 1), (99, 3)]);
    }

    #[test]
    fn test_ask_insert_orders_price_ascending() {
        let r = Reclaimer::new();
        let asks = OrderList::new(Side::Ask);

        push(&asks, &r, 1, 10, 100);
        push(&asks, &r, 2, 5, 98);
        push(&asks, &r, 3, 7, 102);

        assert_eq!(prices(&asks, &r), vec![(98, 2), (100, 1), (102, 3)]);
    }

    #[test]
    fn test_equal_price_breaks_ties_by_sequence() {
        let r = Reclaimer::new();
        let bids = OrderList::new(Side::Bid);

        push(&bids, &r, 5, 1, 100);
        push(&bids, &r, 2, 1, 100);
        push(&bids, &r, 9, 1, 100);

        assert_eq!(prices(&bids, &r), vec![(100, 2), (100, 5), (100, 9)]);
    }

    #[test]
    fn test_peek_best_skips_retired() {
        let r = Reclaimer::new();
        let bids = OrderList::new(Side::Bid);

        push(&bids, &r, 1, 10, 101);
        push(&bids, &r, 2, 10, 100);

        let guard = r.pin();
        let best = bids.peek_best(&guard).unwrap();
        assert_eq!(best.price, 101);
        assert!(best.mark_retired());

        let best = bids.peek_best(&guard).unwrap();
        assert_eq!(best.price, 100);
    }

    #[test]
    fn test_unlink_if_retired_removes_exactly_one_node() {
        let r = Reclaimer::new();
        let asks = OrderList::new(Side::Ask);

        push(&asks, &r, 1, 10, 98);
        push(&asks, &r, 2, 10, 99);
        push(&asks, &r, 3, 10, 100);

        {
            let guard = r.pin();
            let middle = asks.iter(&guard).find(|o| o.price == 99).unwrap();
            assert!(middle.mark_retired());
            asks.unlink_if_retired(middle, &r, &guard);
        }

        assert_eq!(prices(&asks, &r), vec![(98, 1), (100, 3)]);
        assert_eq!(r.stats().retired, 1);
    }

    #[test]
    fn test_insert_after_unlink_keeps_sort_order() {
        let r = Reclaimer::new();
        let bids = OrderList::new(Side::Bid);

        push(&bids, &r, 1, 10, 102);
        push(&bids, &r, 2, 10, 101);
        {
            let guard = r.pin();
            let head = bids.peek_best(&guard).unwrap();
            assert!(head.mark_retired());
            bids.unlink_if_retired(head, &r, &guard);
        }
        push(&bids, &r, 3, 10, 103);
        push(&bids, &r, 4, 10, 100);

        assert_eq!(prices(&bids, &r), vec![(103, 3), (101, 2), (100, 4)]);
    }

    #[test]
    fn test_concurrent_inserts_never_lost() {
        use std::sync::Arc;

        const THREADS: usize = 8;
        const PER_THREAD: u64 = 500;

        let r = Arc::new(Reclaimer::new());
        let bids = Arc::new(OrderList::new(Side::Bid));

        std::thread::scope(|s| {
            for t in 0..THREADS {
                let r = Arc::clone(&r);
                let bids = Arc::clone(&bids);
                s.spawn(move || {
                    for i in 0..PER_THREAD {
                        let seq = t as u64 * PER_THREAD + i;
                        let guard = r.pin();
                        let order = r.allocate(Order::new(seq, Side::Bid, "X", 1, 90 + seq % 20));
                        bids.insert(order, &r, &guard);
                    }
                });
            }
        });

        let guard = r.pin();
        let all: Vec<(u64, u64)> = bids.iter(&guard).map(|o| (o.price, o.sequence)).collect();
        assert_eq!(all.len(), THREADS * PER_THREAD as usize, "no insert may be lost");

        // Strictly ordered: price descending, sequence ascending within a price
        for w in all.windows(2) {
            let (p0, s0) = w[0];
            let (p1, s1) = w[1];
            assert!(p0 > p1 || (p0 == p1 && s0 < s1), "sort invariant violated: {:?}", w);
        }
    }
}
