//! Circular stress driver
//!
//! Runs the ring buffer through two workloads:
//! - single-thread publish/consume latency
//! - K producers against one consumer, checking every item arrives once
//!
//! Usage:
//!   cargo run --release -- [config.toml]

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::{bail, Context};
use circular::config::StressConfig;
use circular::RingBuffer;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => {
            StressConfig::load(&path).with_context(|| format!("loading config from {path}"))?
        }
        None => StressConfig::default(),
    };

    init_tracing(&config.log_level);
    info!(?config, "starting circular stress run");

    println!("🚀 Circular Ring Buffer - stress run");
    println!("====================================\n");

    benchmark_single_thread(&config)?;
    benchmark_contended(&config)?;

    println!("\n✅ All runs complete!");
    Ok(())
}

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .init();
}

fn benchmark_single_thread(config: &StressConfig) -> anyhow::Result<()> {
    println!("📊 Single Thread (publish + consume)");
    println!("------------------------------------");

    let iterations = config.items_per_producer;
    let rb: RingBuffer<u64> = RingBuffer::new(config.capacity)?;

    // Warm up
    for i in 0..1000 {
        if rb.try_publish(i).is_err() {
            rb.try_consume();
        }
    }
    while rb.try_consume().is_some() {}

    // Publish, draining whenever the ring fills
    let start = Instant::now();
    for i in 0..iterations {
        while rb.try_publish(i).is_err() {
            rb.try_consume();
        }
    }
    let publish_duration = start.elapsed();

    while rb.try_consume().is_some() {}

    // Consume a full ring at a time
    let batch = config.capacity as u64;
    let mut consumed = 0u64;
    let mut consume_nanos = 0u128;
    while consumed < iterations {
        let n = batch.min(iterations - consumed);
        for i in 0..n {
            rb.publish(i);
        }
        let start = Instant::now();
        for _ in 0..n {
            rb.consume();
        }
        consume_nanos += start.elapsed().as_nanos();
        consumed += n;
    }

    if iterations == 0 {
        println!("  Operations: 0\n");
        return Ok(());
    }

    let publish_ns = publish_duration.as_nanos() as f64 / iterations as f64;
    let consume_ns = consume_nanos as f64 / iterations as f64;

    println!("  Operations: {}", iterations);
    println!(
        "  Publish latency: {:.2} ns/op ({:.3} μs/op)",
        publish_ns,
        publish_ns / 1000.0
    );
    println!(
        "  Consume latency: {:.2} ns/op ({:.3} μs/op)",
        consume_ns,
        consume_ns / 1000.0
    );
    println!(
        "  Throughput:      {:.2} M ops/sec\n",
        iterations as f64 / publish_duration.as_secs_f64() / 1_000_000.0
    );

    Ok(())
}

fn benchmark_contended(config: &StressConfig) -> anyhow::Result<()> {
    println!(
        "📊 Contended ({} producers -> 1 consumer)",
        config.producers
    );
    println!("------------------------------------------");

    let rb: Arc<RingBuffer<(usize, u64)>> = Arc::new(RingBuffer::new(config.capacity)?);
    let items = config.items_per_producer;
    let total = items * config.producers as u64;

    let start = Instant::now();

    let handles = (0..config.producers)
        .map(|producer| {
            let rb = Arc::clone(&rb);
            thread::Builder::new()
                .name(format!("producer-{producer}"))
                .spawn(move || {
                    for seq in 0..items {
                        rb.publish((producer, seq));
                    }
                })
                .context("spawning producer thread")
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    // Each producer's items must arrive in its own publish order
    let mut next_seq = vec![0u64; config.producers];
    for _ in 0..total {
        let (producer, seq) = rb.consume();
        if next_seq[producer] != seq {
            bail!(
                "producer {producer}: expected seq {}, got {seq}",
                next_seq[producer]
            );
        }
        next_seq[producer] += 1;
    }

    let duration = start.elapsed();

    for handle in handles {
        if handle.join().is_err() {
            bail!("producer thread panicked");
        }
    }

    if !rb.is_empty() {
        bail!("ring not empty after run: {:?}", rb);
    }

    info!(total, ?duration, "contended run verified");

    println!("  Items:      {}", total);
    println!("  Duration:   {:.2} ms", duration.as_secs_f64() * 1000.0);
    println!(
        "  Throughput: {:.2} M items/sec",
        total as f64 / duration.as_secs_f64() / 1_000_000.0
    );

    Ok(())
}
