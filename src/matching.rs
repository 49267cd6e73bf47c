//! Matching - drains crossing same-instrument pairs from one shard.
//!
//! One call to [`run_matching`] drains every pair that is currently
//! crossing and then stops; it never blocks waiting for future orders.
//! Orders inserted after a pass has moved past their position are picked
//! up by the next call (a liveness-only guarantee).
//!
//! Quantity decrements go through compare-exchange loops keyed on the
//! snapshot value, so two threads matching the same resting order cannot
//! both deduct the same quantity: the loser re-reads and recomputes the
//! match from fresh values.

use crossbeam_epoch::Guard;

use crate::order::{Order, Trade};
use crate::reclaim::Reclaimer;
use crate::shard::OrderBookShard;

/// Drain all currently-crossing orders from `shard`, best pairs first.
///
/// Trades execute at the resting ask's price. A bid and an ask match only
/// if their instruments are identical; bucket equality alone is not
/// enough, since distinct instruments may hash to the same shard.
pub fn run_matching(shard: &OrderBookShard, reclaimer: &Reclaimer) -> Vec<Trade> {
    let mut trades = Vec::new();
    let guard = reclaimer.pin();

    'scan: loop {
        for bid in shard.bids.iter(&guard) {
            let ask = match shard
                .asks
                .iter(&guard)
                .find(|a| a.instrument == bid.instrument)
            {
                Some(a) => a,
                None => continue,
            };
            if bid.price < ask.price {
                // Best same-instrument ask does not cross this bid. A
                // lower-priced bid cannot cross it either, but it may
                // cross some other instrument's ask, so keep scanning.
                continue;
            }
            if let Some(trade) = try_match(shard, bid, ask, reclaimer, &guard) {
                trades.push(trade);
                // Quantities moved; re-evaluate from the best bid.
                continue 'scan;
            }
            // A concurrent match is mid-flight on this pair; skip it for
            // this pass, the owning thread resolves it.
        }
        break;
    }

    if !trades.is_empty() {
        tracing::trace!(shard = shard.index(), trades = trades.len(), "drained shard");
    }
    trades
}

/// One match attempt against a crossing pair.
///
/// Returns `None` without mutating anything if either side's quantity is
/// observed at zero (an in-flight fill owned by another thread).
fn try_match(
    shard: &OrderBookShard,
    bid: &Order,
    ask: &Order,
    reclaimer: &Reclaimer,
    guard: &Guard,
) -> Option<Trade> {
    loop {
        let bid_qty = bid.quantity();
        let ask_qty = ask.quantity();
        if bid_qty == 0 || ask_qty == 0 {
            return None;
        }

        let qty = bid_qty.min(ask_qty);
        if !bid.try_take(bid_qty, qty) {
            // Another matcher touched the bid; recompute from fresh values.
            continue;
        }
        if !ask.try_take(ask_qty, qty) {
            // Lost the race on the ask leg: give the bid its quantity back
            // and retry the whole attempt. The bid cannot have been retired
            // meanwhile - only the thread that zeroes a quantity retires it.
            bid.put_back(qty);
            continue;
        }

        // Retire-then-unlink each fully consumed side. The CAS winner is
        // the only thread that unlinks, and the unlinker (or a helping
        // traversal) is the only thread that frees.
        if bid_qty == qty && bid.mark_retired() {
            shard.bids.unlink_if_retired(bid, reclaimer, guard);
        }
        if ask_qty == qty && ask.mark_retired() {
            shard.asks.unlink_if_retired(ask, reclaimer, guard);
        }

        return Some(Trade {
            buy_order: bid.sequence,
            sell_order: ask.sequence,
            instrument: bid.instrument.clone(),
            quantity: qty,
            price: ask.price,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::{Order, Side};
    use crate::shard::ShardTable;

    fn add(
        table: &ShardTable,
        r: &Reclaimer,
        seq: u64,
        side: Side,
        instrument: &str,
        qty: u64,
        price: u64,
    ) {
        let guard = r.pin();
        let shard = table.route(instrument);
        let order = r.allocate(Order::new(seq, side, instrument, qty, price));
        shard.list(side).insert(order, r, &guard);
    }

    #[test]
    fn test_no_cross_no_trades() {
        let table = ShardTable::new(1);
        let r = Reclaimer::new();

        add(&table, &r, 1, Side::Bid, "X", 10, 99);
        add(&table, &r, 2, Side::Ask, "X", 10, 100);

        assert!(run_matching(table.shard(0), &r).is_empty());
    }

    #[test]
    fn test_full_fill_retires_both_sides() {
        let table = ShardTable::new(1);
        let r = Reclaimer::new();

        add(&table, &r, 1, Side::Bid, "X", 10, 100);
        add(&table, &r, 2, Side::Ask, "X", 10, 100);

        let trades = run_matching(table.shard(0), &r);
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].buy_order, 1);
        assert_eq!(trades[0].sell_order, 2);
        assert_eq!(trades[0].quantity, 10);
        assert_eq!(trades[0].price, 100);

        let guard = r.pin();
        assert!(table.shard(0).is_empty(&guard));
        assert_eq!(r.stats().retired, 2);
    }

    #[test]
    fn test_partial_fill_leaves_remainder() {
        let table = ShardTable::new(1);
        let r = Reclaimer::new();

        add(&table, &r, 1, Side::Bid, "X", 10, 100);
        add(&table, &r, 2, Side::Ask, "X", 3, 99);

        let trades = run_matching(table.shard(0), &r);
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].quantity, 3);
        assert_eq!(trades[0].price, 99);

        let guard = r.pin();
        let bid = table.shard(0).bids.peek_best(&guard).unwrap();
        assert_eq!(bid.quantity(), 7);
        assert!(table.shard(0).asks.is_empty(&guard));
    }

    #[test]
    fn test_execution_price_is_ask_price() {
        let table = ShardTable::new(1);
        let r = Reclaimer::new();

        // Bid above ask: price improvement goes at the ask's price.
        add(&table, &r, 1, Side::Bid, "X", 5, 105);
        add(&table, &r, 2, Side::Ask, "X", 5, 101);

        let trades = run_matching(table.shard(0), &r);
        assert_eq!(trades[0].price, 101);
    }

    #[test]
    fn test_price_time_priority_across_levels() {
        let table = ShardTable::new(1);
        let r = Reclaimer::new();

        add(&table, &r, 1, Side::Ask, "X", 5, 102);
        add(&table, &r, 2, Side::Ask, "X", 5, 100);
        add(&table, &r, 3, Side::Ask, "X", 5, 101);
        add(&table, &r, 4, Side::Bid, "X", 15, 102);

        let trades = run_matching(table.shard(0), &r);
        let fills: Vec<(u64, u64)> = trades.iter().map(|t| (t.sell_order, t.price)).collect();
        assert_eq!(fills, vec![(2, 100), (3, 101), (1, 102)]);
    }

    #[test]
    fn test_fifo_within_price_level() {
        let table = ShardTable::new(1);
        let r = Reclaimer::new();

        add(&table, &r, 1, Side::Ask, "X", 5, 100);
        add(&table, &r, 2, Side::Ask, "X", 5, 100);
        add(&table, &r, 3, Side::Ask, "X", 5, 100);
        add(&table, &r, 4, Side::Bid, "X", 10, 100);

        let trades = run_matching(table.shard(0), &r);
        let makers: Vec<u64> = trades.iter().map(|t| t.sell_order).collect();
        assert_eq!(makers, vec![1, 2]);
    }

    #[test]
    fn test_cross_instrument_pairs_never_match() {
        // One shard, two instruments: a forced bucket collision.
        let table = ShardTable::new(1);
        let r = Reclaimer::new();

        add(&table, &r, 1, Side::Bid, "AAA", 10, 100);
        add(&table, &r, 2, Side::Ask, "BBB", 10, 90);

        assert!(run_matching(table.shard(0), &r).is_empty());

        // Same-instrument liquidity still matches through the collision.
        add(&table, &r, 3, Side::Ask, "AAA", 4, 95);
        let trades = run_matching(table.shard(0), &r);
        assert_eq!(trades.len(), 1);
        assert_eq!(&*trades[0].instrument, "AAA");
        assert_eq!(trades[0].quantity, 4);
    }

    #[test]
    fn test_drain_is_idempotent() {
        let table = ShardTable::new(1);
        let r = Reclaimer::new();

        add(&table, &r, 1, Side::Bid, "X", 10, 100);
        add(&table, &r, 2, Side::Ask, "X", 4, 100);

        assert_eq!(run_matching(table.shard(0), &r).len(), 1);
        assert!(run_matching(table.shard(0), &r).is_empty());
    }
}
