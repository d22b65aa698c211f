//! # fleetcast-core
//!
//! Simulation and fan-out engine for the Fleetcast live vehicle tracker.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Route** - Named polylines and the store that loads them
//! - **Vehicle** - Per-vehicle motion along a route
//! - **Fleet** - The set of simulated vehicles and how they are specified
//! - **Scheduler** - Fixed-interval tick loop that owns the fleet
//! - **Dispatcher** - Non-blocking fan-out of position events to subscribers
//! - **Sink** - Best-effort telemetry hand-off
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │ RouteStore  │────▶│    Fleet    │◀────│  Scheduler  │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                                                │
//!                                ┌───────────────┴───────────┐
//!                                ▼                           ▼
//!                         ┌─────────────┐             ┌─────────────┐
//!                         │ Dispatcher  │             │    Sink     │
//!                         └─────────────┘             └─────────────┘
//!                                │
//!                                ▼
//!                          subscribers
//! ```

pub mod dispatcher;
pub mod fleet;
pub mod geo;
pub mod rng;
pub mod route;
pub mod scheduler;
pub mod sink;
pub mod vehicle;

pub use dispatcher::{
    DispatchReport, Dispatcher, DispatcherConfig, DispatcherStats, SubscriberId, Subscription,
};
pub use fleet::{default_groups, Fleet, FleetError, FleetGroup, VehicleSpec};
pub use geo::Coordinate;
pub use rng::FleetRng;
pub use route::{Route, RouteData, RouteError, RouteStats, RouteStore};
pub use scheduler::{
    FleetCommand, NoopObserver, Scheduler, SchedulerConfig, SchedulerError, SchedulerHandle,
    TickObserver, TickReport,
};
pub use sink::{NoopSink, QueuedSink, SinkError, SinkStats, TelemetrySink, TelemetryWriter};
pub use vehicle::{Direction, Position, Vehicle, VehicleMeta};
