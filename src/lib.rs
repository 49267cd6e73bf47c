//! # Shard-LOB
//!
//! A sharded, lock-free limit order book matching engine.
//!
//! ## Design Principles
//!
//! - **No global lock**: any number of threads submit and match
//!   concurrently; every mutation is a compare-and-swap
//! - **Price-time priority**: per-instrument, best price first, admission
//!   sequence breaking ties deterministically
//! - **Safe reclamation**: unlinked nodes are freed through epoch-based
//!   deferral, never while a traversal can still see them
//! - **Shard isolation**: instruments hash to independent shards; shards
//!   never coordinate
//!
//! ## Architecture
//!
//! ```text
//! [Submitter Threads] --> add_order --> [ShardTable] --> [OrderBookShard]
//!                                                          bids | asks
//! [Matcher Threads]  --> run_matching ------------------>  (lock-free
//!                                                           OrderLists)
//!                                          retired nodes --> [Reclaimer]
//! ```

pub mod book;
pub mod list;
pub mod matching;
pub mod order;
pub mod reclaim;
pub mod shard;

// Re-exports for convenience
pub use book::{Book, BookConfig};
pub use list::OrderList;
pub use matching::run_matching;
pub use order::{Order, OrderError, OrderHandle, OrderId, Side, Trade};
pub use reclaim::{ReclaimStats, Reclaimer};
pub use shard::{OrderBookShard, ShardTable};
