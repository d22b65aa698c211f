//! End-to-end watch benchmark for Fleetcast.
//!
//! Connects many subscribers to a running server and measures how many
//! position frames arrive and how stale they are on arrival.

use bytes::BytesMut;
use fleetcast_protocol::{codec, now_millis, Frame};
use futures_util::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const SERVER_URL: &str = "ws://127.0.0.1:5000/ws?format=binary";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

#[derive(Default)]
struct Counters {
    frames: AtomicU64,
    lag_ms_total: AtomicU64,
    lag_ms_max: AtomicU64,
    errors: AtomicU64,
}

impl Counters {
    fn reset(&self) {
        self.frames.store(0, Ordering::SeqCst);
        self.lag_ms_total.store(0, Ordering::SeqCst);
        self.lag_ms_max.store(0, Ordering::SeqCst);
    }

    fn record(&self, timestamp: u64) {
        let lag = now_millis().saturating_sub(timestamp);
        self.frames.fetch_add(1, Ordering::Relaxed);
        self.lag_ms_total.fetch_add(lag, Ordering::Relaxed);
        self.lag_ms_max.fetch_max(lag, Ordering::Relaxed);
    }
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_clients = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(64);

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║         Fleetcast End-to-End Watch Benchmark                 ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Make sure the server is running: cargo run --release        ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    run_watch_benchmark(num_clients).await;
}

async fn run_watch_benchmark(num_clients: usize) {
    println!("📊 Watch Benchmark: {} clients", num_clients);
    println!("   Warmup: {}s, Measurement: {}s", WARMUP_SECS, BENCH_SECS);
    println!();

    let counters = Arc::new(Counters::default());
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let mut handles = Vec::new();

    for client_id in 0..num_clients {
        let counters = Arc::clone(&counters);
        let barrier = Arc::clone(&barrier);

        let handle = tokio::spawn(async move {
            if let Err(e) = run_client(&counters, barrier).await {
                counters.errors.fetch_add(1, Ordering::Relaxed);
                eprintln!("Client {} error: {}", client_id, e);
            }
        });
        handles.push(handle);
    }

    // Wait for all clients to receive their snapshot
    barrier.wait().await;
    println!("✓ All {} clients subscribed", num_clients);

    println!("⏳ Warming up for {}s...", WARMUP_SECS);
    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    counters.reset();
    let start = Instant::now();

    println!("📈 Measuring for {}s...", BENCH_SECS);
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed();
    let frames = counters.frames.load(Ordering::SeqCst);
    let lag_total = counters.lag_ms_total.load(Ordering::SeqCst);
    let lag_max = counters.lag_ms_max.load(Ordering::SeqCst);
    let errors = counters.errors.load(Ordering::SeqCst);

    let frames_per_sec = frames as f64 / elapsed.as_secs_f64();
    let avg_lag = if frames > 0 {
        lag_total as f64 / frames as f64
    } else {
        0.0
    };

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                         RESULTS                              ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!(
        "║  Clients:              {:>10}                           ║",
        num_clients
    );
    println!(
        "║  Duration:             {:>10.2}s                          ║",
        elapsed.as_secs_f64()
    );
    println!(
        "║  Position Frames:      {:>10}                           ║",
        frames
    );
    println!(
        "║  Throughput:           {:>10.0} frames/s                 ║",
        frames_per_sec
    );
    println!(
        "║  Avg Lag:              {:>10.1} ms                       ║",
        avg_lag
    );
    println!(
        "║  Max Lag:              {:>10} ms                       ║",
        lag_max
    );
    println!(
        "║  Client Errors:        {:>10}                           ║",
        errors
    );
    println!("╚══════════════════════════════════════════════════════════════╝");

    for handle in handles {
        handle.abort();
    }
}

async fn run_client(
    counters: &Counters,
    barrier: Arc<Barrier>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (ws, _) = connect_async(SERVER_URL).await?;
    let (_sender, mut receiver) = ws.split();

    let mut buf = BytesMut::with_capacity(65536);
    let mut ready = false;

    while let Some(message) = receiver.next().await {
        let Message::Binary(data) = message? else {
            continue;
        };
        buf.extend_from_slice(&data);

        while let Some(frame) = codec::decode_from(&mut buf)? {
            match frame {
                Frame::Snapshot { .. } if !ready => {
                    ready = true;
                    barrier.wait().await;
                }
                Frame::Position { event } => counters.record(event.timestamp),
                Frame::Error { code, message } => {
                    return Err(format!("server error {code}: {message}").into());
                }
                _ => {}
            }
        }
    }

    Ok(())
}
