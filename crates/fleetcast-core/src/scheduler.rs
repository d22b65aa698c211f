//! Fixed-interval simulation driver.
//!
//! The scheduler owns the fleet. Once per interval it advances every vehicle
//! in fleet order, turns each position into an event, submits the event to
//! the telemetry sink, and publishes the whole batch to the dispatcher.
//!
//! Nothing outside the scheduler touches vehicle state. Fleet changes arrive
//! as [`FleetCommand`]s through a [`SchedulerHandle`] and are applied at the
//! start of the next tick.

use crate::dispatcher::{DispatchReport, Dispatcher};
use crate::fleet::{Fleet, FleetError, VehicleSpec};
use crate::rng::FleetRng;
use crate::route::RouteStore;
use crate::sink::TelemetrySink;
use fleetcast_protocol::now_millis;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

/// Default tick interval.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(1000);

/// Capacity of the fleet command queue.
const COMMAND_QUEUE_CAPACITY: usize = 64;

/// Scheduler errors.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The scheduler is no longer running.
    #[error("Scheduler has stopped")]
    Stopped,
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Time between ticks.
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }
}

/// A change to fleet membership.
///
/// Commands are applied at the start of the next tick. Subscribers are not
/// told about membership changes: a removed vehicle simply stops appearing in
/// position updates and is left out of later snapshots.
#[derive(Debug, Clone)]
pub enum FleetCommand {
    /// Spawn a vehicle from a spec.
    Add(VehicleSpec),
    /// Remove a vehicle by id.
    Remove(String),
}

/// What happened during one tick.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    /// Tick number, starting at 1.
    pub tick: u64,
    /// Events emitted.
    pub events: usize,
    /// Vehicles that produced no event.
    pub skipped: usize,
    /// Vehicles whose position was held by the neighbor-range guard.
    pub degenerate: usize,
    /// Fleet size after applying commands.
    pub fleet_size: usize,
    /// Dispatcher outcome.
    pub dispatch: DispatchReport,
    /// Time spent computing and publishing the tick.
    pub elapsed: Duration,
}

/// Callbacks invoked by [`Scheduler::run`].
pub trait TickObserver: Send {
    /// Called after every tick.
    fn on_tick(&mut self, _report: &TickReport) {}

    /// Called once when the loop exits.
    fn on_stop(&mut self, _ticks: u64) {}
}

/// A [`TickObserver`] that does nothing.
pub struct NoopObserver;

impl TickObserver for NoopObserver {}

/// Control handle for a running scheduler.
///
/// Fleet membership can only be changed through this handle by code embedding
/// the engine; the server exposes no endpoint for it.
#[derive(Clone)]
pub struct SchedulerHandle {
    commands: mpsc::Sender<FleetCommand>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl SchedulerHandle {
    /// Queue a vehicle to join the fleet on the next tick.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Stopped`] if the scheduler is gone.
    pub async fn add_vehicle(&self, spec: VehicleSpec) -> Result<(), SchedulerError> {
        self.send(FleetCommand::Add(spec)).await
    }

    /// Queue a vehicle to leave the fleet on the next tick.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Stopped`] if the scheduler is gone.
    pub async fn remove_vehicle(&self, id: impl Into<String>) -> Result<(), SchedulerError> {
        self.send(FleetCommand::Remove(id.into())).await
    }

    /// Send a fleet command.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Stopped`] if the scheduler is gone.
    pub async fn send(&self, command: FleetCommand) -> Result<(), SchedulerError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SchedulerError::Stopped)
    }

    /// Ask the scheduler to stop after the current tick.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

/// The tick scheduler.
pub struct Scheduler {
    fleet: Fleet,
    routes: Arc<RouteStore>,
    dispatcher: Arc<Dispatcher>,
    sink: Arc<dyn TelemetrySink>,
    rng: FleetRng,
    config: SchedulerConfig,
    commands: mpsc::Receiver<FleetCommand>,
    shutdown: watch::Receiver<bool>,
    tick: u64,
}

impl Scheduler {
    /// Create a scheduler and its control handle.
    #[must_use]
    pub fn new(
        fleet: Fleet,
        routes: Arc<RouteStore>,
        dispatcher: Arc<Dispatcher>,
        sink: Arc<dyn TelemetrySink>,
        rng: FleetRng,
        config: SchedulerConfig,
    ) -> (Self, SchedulerHandle) {
        let (command_tx, commands) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let (shutdown_tx, shutdown) = watch::channel(false);

        let scheduler = Self {
            fleet,
            routes,
            dispatcher,
            sink,
            rng,
            config,
            commands,
            shutdown,
            tick: 0,
        };
        let handle = SchedulerHandle {
            commands: command_tx,
            shutdown: Arc::new(shutdown_tx),
        };

        (scheduler, handle)
    }

    /// The fleet as of the last tick.
    #[must_use]
    pub fn fleet(&self) -> &Fleet {
        &self.fleet
    }

    /// Apply a fleet command immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if the vehicle cannot be spawned, is a duplicate, or
    /// is unknown.
    pub fn apply(&mut self, command: FleetCommand) -> Result<(), FleetError> {
        match command {
            FleetCommand::Add(spec) => {
                let vehicle = Fleet::spawn(&spec, &self.routes, &mut self.rng)?;
                self.fleet.add(vehicle)?;
                info!(vehicle = %spec.id, fleet = self.fleet.len(), "Vehicle added");
            }
            FleetCommand::Remove(id) => {
                self.fleet.remove(&id)?;
                self.dispatcher.forget(&id);
                info!(vehicle = %id, fleet = self.fleet.len(), "Vehicle removed");
            }
        }
        Ok(())
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            if let Err(e) = self.apply(command) {
                warn!(error = %e, "Rejected fleet command");
            }
        }
    }

    /// Run one tick stamped with `timestamp` (Unix milliseconds).
    pub fn tick(&mut self, timestamp: u64) -> TickReport {
        let started = Instant::now();
        self.drain_commands();
        self.tick += 1;

        let mut report = TickReport {
            tick: self.tick,
            fleet_size: self.fleet.len(),
            ..TickReport::default()
        };
        let mut events = Vec::with_capacity(self.fleet.len());

        for vehicle in self.fleet.iter_mut() {
            let Some(position) = vehicle.advance() else {
                report.skipped += 1;
                debug!(vehicle = %vehicle.id(), "No position this tick");
                continue;
            };

            if position.clamped {
                report.degenerate += 1;
                warn!(
                    vehicle = %vehicle.id(),
                    index = position.index,
                    direction = ?position.direction,
                    "Degenerate vehicle state, holding position"
                );
            }

            let event = Arc::new(vehicle.to_event(&position, timestamp));
            self.sink.submit(Arc::clone(&event));
            events.push(event);
        }

        report.events = events.len();
        report.dispatch = self.dispatcher.publish(&events);
        report.elapsed = started.elapsed();

        trace!(
            tick = report.tick,
            events = report.events,
            recipients = report.dispatch.recipients,
            elapsed_us = report.elapsed.as_micros() as u64,
            "Tick complete"
        );

        report
    }

    /// Tick on the configured interval until shut down.
    ///
    /// The first tick happens one interval after the call. A shutdown
    /// request lets the in-flight tick finish. If every handle is dropped
    /// the loop keeps running.
    pub async fn run<O: TickObserver>(mut self, mut observer: O) {
        info!(
            vehicles = self.fleet.len(),
            interval_ms = self.config.tick_interval.as_millis() as u64,
            "Scheduler started"
        );

        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately
        interval.tick().await;

        let mut watching = true;
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            tokio::select! {
                biased;

                changed = self.shutdown.changed(), if watching => {
                    if changed.is_err() {
                        watching = false;
                    }
                }

                _ = interval.tick() => {
                    let report = self.tick(now_millis());
                    observer.on_tick(&report);
                }
            }
        }

        observer.on_stop(self.tick);
        info!(ticks = self.tick, "Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::RouteData;
    use crate::sink::NoopSink;
    use crate::vehicle::Direction;
    use fleetcast_protocol::PositionEvent;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<Arc<PositionEvent>>>);

    impl TelemetrySink for RecordingSink {
        fn submit(&self, event: Arc<PositionEvent>) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[derive(Default)]
    struct CountingObserver {
        ticks: Arc<Mutex<Vec<usize>>>,
        stopped: Arc<Mutex<Option<u64>>>,
    }

    impl TickObserver for CountingObserver {
        fn on_tick(&mut self, report: &TickReport) {
            self.ticks.lock().unwrap().push(report.events);
        }

        fn on_stop(&mut self, ticks: u64) {
            *self.stopped.lock().unwrap() = Some(ticks);
        }
    }

    fn routes() -> Arc<RouteStore> {
        let mut data = RouteData::new();
        data.insert("line", vec![[0.0, 0.0], [0.0, 1.0], [0.0, 2.0], [0.0, 3.0], [0.0, 4.0]]);
        data.insert("pair", vec![[10.0, 10.0], [10.0, 11.0]]);
        let mut store = RouteStore::new(data);
        store.load_all();
        Arc::new(store)
    }

    fn spec(id: &str, route: &str, speed: f64) -> VehicleSpec {
        VehicleSpec {
            id: id.to_string(),
            route: route.to_string(),
            kind: "TNSTC AC".to_string(),
            label: "TNSTC Exp 144".to_string(),
            origin: "Nellore".to_string(),
            destination: "Chennai".to_string(),
            speed,
            direction: Direction::Forward,
        }
    }

    fn scheduler(
        specs: &[VehicleSpec],
        sink: Arc<dyn TelemetrySink>,
    ) -> (Scheduler, SchedulerHandle, Arc<Dispatcher>) {
        let routes = routes();
        let mut rng = FleetRng::new(11);
        let (fleet, errors) = Fleet::build(specs, &routes, &mut rng);
        assert!(errors.is_empty());

        let dispatcher = Arc::new(Dispatcher::new());
        let (scheduler, handle) = Scheduler::new(
            fleet,
            routes,
            Arc::clone(&dispatcher),
            sink,
            rng,
            SchedulerConfig::default(),
        );
        (scheduler, handle, dispatcher)
    }

    #[test]
    fn test_tick_emits_one_event_per_vehicle() {
        let sink = Arc::new(RecordingSink::default());
        let specs = [spec("a", "line", 0.5), spec("b", "pair", 1.5), spec("c", "line", 2.0)];
        let (mut scheduler, _handle, dispatcher) = scheduler(&specs, sink.clone());
        let mut sub = dispatcher.join();

        let report = scheduler.tick(1000);
        assert_eq!(report.tick, 1);
        assert_eq!(report.events, 3);
        assert_eq!(report.skipped, 0);
        assert_eq!(report.dispatch.delivered, 3);

        // Stable fleet order, same events to subscribers and sink
        let ids: Vec<_> = std::iter::from_fn(|| sub.try_recv())
            .map(|e| e.vehicle_id.clone())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        let sunk = sink.0.lock().unwrap();
        assert_eq!(sunk.len(), 3);
        assert!(sunk.iter().all(|e| e.timestamp == 1000));
    }

    #[test]
    fn test_events_stay_on_route_segments() {
        let specs = [spec("a", "line", 0.37), spec("b", "pair", 0.8), spec("c", "line", 3.3)];
        let (mut scheduler, _handle, dispatcher) = scheduler(&specs, Arc::new(NoopSink));
        let mut sub = dispatcher.join();

        for t in 0..500 {
            let report = scheduler.tick(t);
            assert_eq!(report.events, 3);

            while let Some(e) = sub.try_recv() {
                // Every route here is a straight line along a constant latitude
                let (lat, lo, hi) = if e.vehicle_id == "b" {
                    (10.0, 10.0, 11.0)
                } else {
                    (0.0, 0.0, 4.0)
                };
                assert_eq!(e.lat, lat);
                assert!((lo..=hi).contains(&e.lng), "{} at {}", e.vehicle_id, e.lng);
            }
        }
    }

    #[tokio::test]
    async fn test_fleet_commands_apply_on_next_tick() {
        let (mut scheduler, handle, dispatcher) =
            scheduler(&[spec("a", "line", 0.5)], Arc::new(NoopSink));

        scheduler.tick(1);
        assert_eq!(dispatcher.snapshot().len(), 1);

        handle.add_vehicle(spec("b", "pair", 0.5)).await.unwrap();
        handle.add_vehicle(spec("a", "pair", 0.5)).await.unwrap();
        handle.add_vehicle(spec("z", "nowhere", 0.5)).await.unwrap();
        assert_eq!(scheduler.fleet().len(), 1);

        let report = scheduler.tick(2);
        assert_eq!(report.fleet_size, 2);
        assert_eq!(report.events, 2);
        assert_eq!(scheduler.fleet().ids(), vec!["a", "b"]);

        handle.remove_vehicle("a").await.unwrap();
        let report = scheduler.tick(3);
        assert_eq!(report.events, 1);

        let snapshot = dispatcher.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].vehicle_id, "b");
    }

    #[tokio::test]
    async fn test_removed_vehicle_goes_silent() {
        let (mut scheduler, handle, dispatcher) =
            scheduler(&[spec("a", "line", 0.5), spec("b", "pair", 0.5)], Arc::new(NoopSink));
        let mut existing = dispatcher.join();

        scheduler.tick(1);
        handle.remove_vehicle("a").await.unwrap();
        scheduler.tick(2);
        scheduler.tick(3);

        let mut seen = Vec::new();
        while let Some(event) = existing.try_recv() {
            seen.push((event.timestamp, event.vehicle_id.clone()));
        }
        seen.sort();
        assert_eq!(
            seen,
            vec![
                (1, "a".to_string()),
                (1, "b".to_string()),
                (2, "b".to_string()),
                (3, "b".to_string()),
            ]
        );

        let mut late = dispatcher.join();
        let ids: Vec<_> = late
            .take_snapshot()
            .iter()
            .map(|event| event.vehicle_id.clone())
            .collect();
        assert_eq!(ids, vec!["b"]);
    }

    #[test]
    fn test_stalled_subscriber_does_not_slow_ticks() {
        let specs: Vec<_> = (0..50).map(|i| spec(&format!("v{i}"), "line", 0.3)).collect();
        let (mut scheduler, _handle, dispatcher) = scheduler(&specs, Arc::new(NoopSink));

        let _stalled = dispatcher.join();
        let mut healthy = dispatcher.join();

        for t in 0..20 {
            let report = scheduler.tick(t);
            assert_eq!(report.events, 50);
            for _ in 0..50 {
                assert_eq!(healthy.try_recv().unwrap().timestamp, t);
            }
        }

        assert_eq!(dispatcher.stats().subscribers, 1);
        assert_eq!(dispatcher.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_ticks_until_shutdown() {
        let (scheduler, handle, dispatcher) =
            scheduler(&[spec("a", "line", 0.5), spec("b", "pair", 0.5)], Arc::new(NoopSink));
        let mut sub = dispatcher.join();

        let observer = CountingObserver::default();
        let ticks = Arc::clone(&observer.ticks);
        let stopped = Arc::clone(&observer.stopped);
        let task = tokio::spawn(scheduler.run(observer));

        for _ in 0..3 {
            let first = sub.recv().await.unwrap();
            let second = sub.recv().await.unwrap();
            assert_eq!(first.vehicle_id, "a");
            assert_eq!(second.vehicle_id, "b");
        }

        handle.shutdown();
        task.await.unwrap();

        let ticks = ticks.lock().unwrap().clone();
        assert!(ticks.len() >= 3);
        assert!(ticks.iter().all(|&n| n == 2));
        assert_eq!(*stopped.lock().unwrap(), Some(ticks.len() as u64));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_survives_dropped_handle() {
        let (scheduler, handle, dispatcher) =
            scheduler(&[spec("a", "line", 0.5)], Arc::new(NoopSink));
        let mut sub = dispatcher.join();
        drop(handle);

        let task = tokio::spawn(scheduler.run(NoopObserver));
        for _ in 0..5 {
            assert!(sub.recv().await.is_some());
        }
        task.abort();
    }

    #[tokio::test]
    async fn test_handle_reports_stopped_scheduler() {
        let (scheduler, handle, _dispatcher) =
            scheduler(&[spec("a", "line", 0.5)], Arc::new(NoopSink));
        drop(scheduler);

        assert!(matches!(
            handle.remove_vehicle("a").await,
            Err(SchedulerError::Stopped)
        ));
    }
}
