use std::time::{Duration, Instant};

use kadnode::{Id, Testnet};
use serde_json::json;

/// End-to-end latency of store and find_value on a local testnet.
///
/// Latency is bounded below by the actor tick, so the useful signal is
/// relative differences between runs, not absolute values.
fn main() {
    println!("latency\n");

    for size in [10, 50] {
        let testnet = Testnet::new(size).unwrap();
        let nodes = &testnet.nodes;

        let keys: Vec<Id> = (0..20).map(|_| Id::random()).collect();

        // STORE
        let mut timings = Vec::with_capacity(keys.len());

        for (i, key) in keys.iter().enumerate() {
            let start = Instant::now();
            let _ = nodes[i % size].store(*key, json!(format!("bench_{size}_{i}")));
            timings.push(start.elapsed());
        }

        println!("store ({size} nodes)");
        print_stats(&timings);

        // FIND_VALUE
        let mut timings = Vec::with_capacity(keys.len());
        let mut misses = 0;

        for (i, key) in keys.iter().enumerate() {
            let node = (i % (size - 1)) + 1;

            let start = Instant::now();
            let outcome = nodes[node].find_value(*key);
            timings.push(start.elapsed());

            if !matches!(outcome, Ok(ref outcome) if outcome.item().is_some()) {
                misses += 1;
            }
        }

        println!("find_value ({size} nodes, {misses} misses)");
        print_stats(&timings);
    }
}

fn print_stats(timings: &[Duration]) {
    let mut us: Vec<_> = timings.iter().map(|d| d.as_micros()).collect();
    us.sort_unstable();
    let n = us.len();
    let mean = us.iter().sum::<u128>() / n as u128;

    println!(
        "n={n} min={:.2}ms mean={:.2}ms p50={:.2}ms p95={:.2}ms max={:.2}ms\n",
        us[0] as f64 / 1000.0,
        mean as f64 / 1000.0,
        us[n / 2] as f64 / 1000.0,
        us[n * 95 / 100] as f64 / 1000.0,
        us[n - 1] as f64 / 1000.0,
    );
}
