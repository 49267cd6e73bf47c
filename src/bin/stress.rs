//! Concurrent stress driver with a latency report.
//!
//! Spawns submitter threads that interleave random order placement with
//! matching on the routed shard, then audits quantity conservation:
//! every submitted unit must end up either resident in the book or
//! counted (twice, once per side) in the executed trades.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use clap::Parser;
use hdrhistogram::Histogram;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use shard_lob::{Book, BookConfig, Side};

#[derive(Parser, Debug)]
#[command(name = "stress", about = "Concurrent matching engine stress driver")]
struct Args {
    /// Number of submitter threads
    #[arg(long, default_value_t = 8)]
    threads: usize,

    /// Orders submitted per thread
    #[arg(long, default_value_t = 50_000)]
    orders: u64,

    /// Distinct instrument names (INST_0 .. INST_{n-1})
    #[arg(long, default_value_t = 64)]
    instruments: u64,

    /// Shard count for the book
    #[arg(long, default_value_t = 1024)]
    shards: usize,

    /// PRNG seed; each thread derives its own stream from this
    #[arg(long, default_value_t = 0xABCD_EF12)]
    seed: u64,

    /// Pin submitter threads to CPU cores
    #[arg(long, default_value_t = false)]
    pin: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    println!(
        "Running {} threads x {} orders over {} instruments ({} shards)...",
        args.threads, args.orders, args.instruments, args.shards
    );

    let book = Book::new(BookConfig {
        shard_count: args.shards,
        capacity: (args.threads as u64 * args.orders) as usize + 1,
    });
    let submitted = AtomicU64::new(0);
    let traded = AtomicU64::new(0);

    let core_ids = core_affinity::get_core_ids().unwrap_or_default();
    let started = Instant::now();

    let histograms: Vec<Histogram<u64>> = std::thread::scope(|s| {
        let mut handles = Vec::with_capacity(args.threads);
        for t in 0..args.threads {
            let book = &book;
            let args = &args;
            let submitted = &submitted;
            let traded = &traded;
            let core = if args.pin {
                core_ids.get(t % core_ids.len().max(1)).copied()
            } else {
                None
            };
            handles.push(s.spawn(move || {
                if let Some(core) = core {
                    core_affinity::set_for_current(core);
                }
                let mut rng = ChaCha8Rng::seed_from_u64(args.seed.wrapping_add(t as u64));
                let mut histogram = Histogram::<u64>::new_with_bounds(1, 10_000_000, 3)
                    .expect("histogram bounds");

                for _ in 0..args.orders {
                    let side = if rng.gen_bool(0.5) { Side::Bid } else { Side::Ask };
                    let instrument = format!("INST_{}", rng.gen_range(0..args.instruments));
                    let qty = rng.gen_range(1..100);
                    let price = rng.gen_range(1..1000);

                    let start = Instant::now();
                    let handle = book
                        .add_order(side, &instrument, qty, price)
                        .expect("valid order admitted");
                    histogram
                        .record(start.elapsed().as_nanos() as u64)
                        .unwrap_or(());
                    submitted.fetch_add(qty, Ordering::Relaxed);

                    let trades = book.run_matching(book.shard(handle.shard));
                    let filled: u64 = trades.iter().map(|t| t.quantity).sum();
                    traded.fetch_add(filled, Ordering::Relaxed);
                }
                histogram
            }));
        }
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    // Final drain: anything still crossing after the submitters stopped.
    let final_trades: u64 = book.run_matching_all().iter().map(|t| t.quantity).sum();
    traded.fetch_add(final_trades, Ordering::Relaxed);
    let elapsed = started.elapsed();

    let mut histogram = Histogram::<u64>::new_with_bounds(1, 10_000_000, 3).expect("bounds");
    for h in &histograms {
        histogram.add(h).expect("merge histograms");
    }

    let total_orders = args.threads as u64 * args.orders;
    println!("\n=== add_order Latency (ns) ===");
    println!("Total Ops:  {}", total_orders);
    println!("Throughput: {:.2} ops/sec", total_orders as f64 / elapsed.as_secs_f64());
    println!("------------------------------");
    println!("P50:    {:6} ns", histogram.value_at_quantile(0.50));
    println!("P90:    {:6} ns", histogram.value_at_quantile(0.90));
    println!("P99:    {:6} ns", histogram.value_at_quantile(0.99));
    println!("P99.9:  {:6} ns", histogram.value_at_quantile(0.999));
    println!("Max:    {:6} ns", histogram.max());

    // Conservation audit: submitted == resident + 2 * traded.
    let resident: u64 = (0..args.instruments)
        .map(|i| book.resident_quantity(&format!("INST_{i}")))
        .sum();
    let submitted = submitted.load(Ordering::Relaxed);
    let traded = traded.load(Ordering::Relaxed);

    book.flush_reclaimer();
    let stats = book.reclaim_stats();
    println!("\n=== Book Audit ===");
    println!("Submitted qty: {}", submitted);
    println!("Resident qty:  {}", resident);
    println!("Traded qty:    {} (x2 = {})", traded, 2 * traded);
    println!(
        "Nodes: {} allocated, {} retired, {} freed, {} live",
        stats.allocated,
        stats.retired,
        stats.freed,
        stats.live()
    );

    assert_eq!(
        submitted,
        resident + 2 * traded,
        "quantity conservation violated"
    );
    println!("Conservation holds.");
}
