//! Telemetry sink: best-effort hand-off of position events to persistence.
//!
//! The scheduler submits every event and moves on. What happens after that
//! (queueing, writing, failing) never reaches the simulation.

use async_trait::async_trait;
use fleetcast_protocol::PositionEvent;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

/// Errors a telemetry writer may report.
#[derive(Debug, Error)]
pub enum SinkError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Event could not be encoded.
    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Accepts position events without blocking the caller.
pub trait TelemetrySink: Send + Sync {
    /// Hand over one event. Must return promptly and must not fail.
    fn submit(&self, event: Arc<PositionEvent>);
}

/// A sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl TelemetrySink for NoopSink {
    fn submit(&self, _event: Arc<PositionEvent>) {}
}

/// Writes events to a persistence backend.
#[async_trait]
pub trait TelemetryWriter: Send {
    /// Persist one event.
    async fn write(&mut self, event: &PositionEvent) -> Result<(), SinkError>;

    /// Flush buffered writes. Called once when the sink shuts down.
    async fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct SinkCounters {
    submitted: AtomicU64,
    dropped: AtomicU64,
    written: AtomicU64,
    failed: AtomicU64,
}

/// Telemetry sink statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    /// Events accepted into the queue.
    pub submitted: u64,
    /// Events dropped because the queue was full or the writer had stopped.
    pub dropped: u64,
    /// Events written successfully.
    pub written: u64,
    /// Writes that returned an error.
    pub failed: u64,
}

/// A sink backed by a bounded queue and a writer task.
///
/// When the queue is full new events are dropped. Dropping every clone of
/// the sink closes the queue; the writer drains it, flushes, and exits.
#[derive(Clone)]
pub struct QueuedSink {
    sender: mpsc::Sender<Arc<PositionEvent>>,
    counters: Arc<SinkCounters>,
}

impl QueuedSink {
    /// Start a writer task and return the sink feeding it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<W>(mut writer: W, capacity: usize) -> (Self, JoinHandle<()>)
    where
        W: TelemetryWriter + 'static,
    {
        let (sender, mut receiver) = mpsc::channel::<Arc<PositionEvent>>(capacity.max(1));
        let counters = Arc::new(SinkCounters::default());
        let worker_counters = Arc::clone(&counters);

        let handle = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                match writer.write(&event).await {
                    Ok(()) => {
                        worker_counters.written.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        worker_counters.failed.fetch_add(1, Ordering::Relaxed);
                        debug!(vehicle = %event.vehicle_id, error = %e, "Telemetry write failed");
                    }
                }
            }

            if let Err(e) = writer.flush().await {
                debug!(error = %e, "Telemetry flush failed");
            }
            info!(
                written = worker_counters.written.load(Ordering::Relaxed),
                failed = worker_counters.failed.load(Ordering::Relaxed),
                "Telemetry writer stopped"
            );
        });

        (Self { sender, counters }, handle)
    }

    /// Get sink statistics.
    #[must_use]
    pub fn stats(&self) -> SinkStats {
        SinkStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            written: self.counters.written.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

impl TelemetrySink for QueuedSink {
    fn submit(&self, event: Arc<PositionEvent>) {
        match self.sender.try_send(event) {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                trace!(error = %e, "Telemetry event dropped");
            }
        }
    }
}
