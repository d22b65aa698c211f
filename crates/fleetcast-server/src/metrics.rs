//! Metrics collection and export for Fleetcast.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use anyhow::{Context, Result};
use fleetcast_core::{Dispatcher, QueuedSink, TickObserver, TickReport};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Metric names.
pub mod names {
    pub const TICKS_TOTAL: &str = "fleetcast_ticks_total";
    pub const TICK_DURATION_SECONDS: &str = "fleetcast_tick_duration_seconds";
    pub const EVENTS_TOTAL: &str = "fleetcast_events_total";
    pub const DEGENERATE_TOTAL: &str = "fleetcast_degenerate_positions_total";
    pub const FLEET_SIZE: &str = "fleetcast_fleet_size";
    pub const SUBSCRIBERS_ACTIVE: &str = "fleetcast_subscribers_active";
    pub const EVICTIONS_TOTAL: &str = "fleetcast_evictions_total";
    pub const DROPPED_TOTAL: &str = "fleetcast_dropped_deliveries_total";
    pub const SINK_DROPPED_TOTAL: &str = "fleetcast_sink_dropped_total";
    pub const SINK_FAILED_TOTAL: &str = "fleetcast_sink_failed_total";
    pub const CONNECTIONS_TOTAL: &str = "fleetcast_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "fleetcast_connections_active";
    pub const MESSAGES_BYTES: &str = "fleetcast_messages_bytes";
    pub const ERRORS_TOTAL: &str = "fleetcast_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(names::TICKS_TOTAL, "Simulation ticks since server start");
    metrics::describe_histogram!(
        names::TICK_DURATION_SECONDS,
        "Time to advance the fleet and publish one tick"
    );
    metrics::describe_counter!(names::EVENTS_TOTAL, "Position events emitted");
    metrics::describe_counter!(
        names::DEGENERATE_TOTAL,
        "Positions held because the next waypoint was out of range"
    );
    metrics::describe_gauge!(names::FLEET_SIZE, "Vehicles in the fleet");
    metrics::describe_gauge!(names::SUBSCRIBERS_ACTIVE, "Current dispatcher subscribers");
    metrics::describe_counter!(names::EVICTIONS_TOTAL, "Subscribers evicted for falling behind");
    metrics::describe_counter!(names::DROPPED_TOTAL, "Events dropped at subscriber queues");
    metrics::describe_counter!(names::SINK_DROPPED_TOTAL, "Telemetry events dropped");
    metrics::describe_counter!(names::SINK_FAILED_TOTAL, "Telemetry writes that failed");
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of frames sent");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record bytes sent to a subscriber.
pub fn record_message(bytes: usize, format: &'static str) {
    counter!(names::MESSAGES_BYTES, "format" => format).increment(bytes as u64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Publishes per-tick engine statistics.
pub struct MetricsObserver {
    dispatcher: Arc<Dispatcher>,
    sink: Option<QueuedSink>,
}

impl MetricsObserver {
    /// Create an observer reading subscriber counts from `dispatcher` and,
    /// when telemetry is on, drop counts from `sink`.
    #[must_use]
    pub fn new(dispatcher: Arc<Dispatcher>, sink: Option<QueuedSink>) -> Self {
        Self { dispatcher, sink }
    }
}

impl TickObserver for MetricsObserver {
    fn on_tick(&mut self, report: &TickReport) {
        counter!(names::TICKS_TOTAL).increment(1);
        histogram!(names::TICK_DURATION_SECONDS).record(report.elapsed.as_secs_f64());
        counter!(names::EVENTS_TOTAL).increment(report.events as u64);
        counter!(names::DEGENERATE_TOTAL).increment(report.degenerate as u64);
        counter!(names::EVICTIONS_TOTAL).increment(report.dispatch.evicted as u64);
        counter!(names::DROPPED_TOTAL).increment(report.dispatch.dropped as u64);
        gauge!(names::FLEET_SIZE).set(report.fleet_size as f64);
        gauge!(names::SUBSCRIBERS_ACTIVE).set(self.dispatcher.subscriber_count() as f64);

        if let Some(sink) = &self.sink {
            let stats = sink.stats();
            counter!(names::SINK_DROPPED_TOTAL).absolute(stats.dropped);
            counter!(names::SINK_FAILED_TOTAL).absolute(stats.failed);
        }
    }

    fn on_stop(&mut self, ticks: u64) {
        info!(ticks, "Final tick count recorded");
    }
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        counter!(names::CONNECTIONS_TOTAL).increment(1);
        gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetcast_core::DispatchReport;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
    use std::collections::HashMap;
    use std::time::Duration;

    fn values(snapshotter: &Snapshotter) -> HashMap<String, DebugValue> {
        snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .map(|(key, _, _, value)| (key.key().name().to_string(), value))
            .collect()
    }

    fn counter_value(values: &HashMap<String, DebugValue>, name: &str) -> u64 {
        match values.get(name) {
            Some(DebugValue::Counter(value)) => *value,
            other => panic!("{name}: expected counter, got {other:?}"),
        }
    }

    fn gauge_value(values: &HashMap<String, DebugValue>, name: &str) -> f64 {
        match values.get(name) {
            Some(DebugValue::Gauge(value)) => value.into_inner(),
            other => panic!("{name}: expected gauge, got {other:?}"),
        }
    }

    #[test]
    fn test_metrics_guard() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            let guard = ConnectionMetricsGuard::new();
            let open = values(&snapshotter);
            assert_eq!(counter_value(&open, names::CONNECTIONS_TOTAL), 1);
            assert_eq!(gauge_value(&open, names::CONNECTIONS_ACTIVE), 1.0);

            drop(guard);
            let closed = values(&snapshotter);
            assert_eq!(gauge_value(&closed, names::CONNECTIONS_ACTIVE), 0.0);
        });
    }

    #[test]
    fn test_observer_without_sink() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        let dispatcher = Arc::new(Dispatcher::new());
        let _sub = dispatcher.join();
        let mut observer = MetricsObserver::new(dispatcher, None);

        metrics::with_local_recorder(&recorder, || {
            observer.on_tick(&TickReport {
                tick: 1,
                events: 14,
                degenerate: 1,
                fleet_size: 14,
                dispatch: DispatchReport {
                    recipients: 1,
                    delivered: 14,
                    ..DispatchReport::default()
                },
                elapsed: Duration::from_micros(80),
                ..TickReport::default()
            });
            observer.on_stop(1);
        });

        let values = values(&snapshotter);
        assert_eq!(counter_value(&values, names::TICKS_TOTAL), 1);
        assert_eq!(counter_value(&values, names::EVENTS_TOTAL), 14);
        assert_eq!(counter_value(&values, names::DEGENERATE_TOTAL), 1);
        assert_eq!(counter_value(&values, names::EVICTIONS_TOTAL), 0);
        assert_eq!(gauge_value(&values, names::FLEET_SIZE), 14.0);
        assert_eq!(gauge_value(&values, names::SUBSCRIBERS_ACTIVE), 1.0);
        assert!(matches!(
            values.get(names::TICK_DURATION_SECONDS),
            Some(DebugValue::Histogram(samples)) if samples.len() == 1
        ));
        // Sink counters only appear when telemetry is enabled
        assert!(!values.contains_key(names::SINK_DROPPED_TOTAL));
    }
}
