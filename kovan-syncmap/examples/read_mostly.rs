//! Example demonstrating a read-mostly workload on SyncMap
//!
//! Writers fill the map while readers hammer it. Run with
//! `RUST_LOG=kovan_syncmap=trace` to watch the write buffer being built and
//! promoted.

use kovan_syncmap::SyncMap;
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("=== Read-Mostly SyncMap Demo ===\n");

    let map = Arc::new(SyncMap::with_capacity(1_024));

    // Populate from disjoint writers
    println!("Populating from 4 writers...");
    let start = Instant::now();
    let handles: Vec<_> = (0..4u64)
        .map(|thread_id| {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                for i in 0..10_000 {
                    let key = thread_id * 10_000 + i;
                    map.put(key, key * 2);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    println!("Inserted 40,000 entries in {:?}\n", start.elapsed());

    // Readers: the first misses promote the buffer, the rest stay lock-free
    println!("Reading from 8 threads...");
    let start = Instant::now();
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                let mut found = 0;
                for _ in 0..5 {
                    for key in 0..40_000u64 {
                        if map.get(&key) == Some(key * 2) {
                            found += 1;
                        }
                    }
                }
                found
            })
        })
        .collect();
    let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    let duration = start.elapsed();
    println!(
        "Performed 1,600,000 reads in {:?} ({:.2} ops/sec), {} hits\n",
        duration,
        1_600_000.0 / duration.as_secs_f64(),
        total
    );

    // Counters updated with compare-and-swap
    println!("Incrementing a shared counter from 8 threads...");
    map.put(u64::MAX, 0);
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                for _ in 0..1_000 {
                    loop {
                        let Some(current) = map.get(&u64::MAX) else {
                            break;
                        };
                        if map.compare_and_swap(&u64::MAX, &current, current + 1) {
                            break;
                        }
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    println!("Counter value: {:?}\n", map.get(&u64::MAX));

    // One-time initialization
    let (value, loaded) = map.load_or_store(u64::MAX - 1, 42);
    println!("load_or_store -> value {value}, loaded: {loaded}");
    let (value, loaded) = map.load_or_store(u64::MAX - 1, 7);
    println!("load_or_store -> value {value}, loaded: {loaded}");

    println!("\nFinal map size: {} entries", map.len());
    println!("\n=== Demo Complete ===");
}
