//! Fleet roster: vehicle specs, fleet groups, and the registry the scheduler
//! owns.

use crate::rng::FleetRng;
use crate::route::{RouteError, RouteStore};
use crate::vehicle::{Direction, Vehicle, VehicleMeta};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Fleet errors.
#[derive(Debug, Error)]
pub enum FleetError {
    /// The vehicle's route is unknown or invalid.
    #[error("Route unavailable for vehicle {id}: {source}")]
    Route {
        id: String,
        #[source]
        source: RouteError,
    },

    /// Speed is zero, negative, or not finite.
    #[error("Invalid speed {speed} for vehicle {id}")]
    InvalidSpeed { id: String, speed: f64 },

    /// A vehicle with this id is already in the fleet.
    #[error("Duplicate vehicle: {0}")]
    DuplicateVehicle(String),

    /// No vehicle with this id is in the fleet.
    #[error("Unknown vehicle: {0}")]
    UnknownVehicle(String),
}

fn default_speed() -> f64 {
    0.3
}

fn default_operator() -> String {
    "TNSTC".to_string()
}

fn default_prefix() -> String {
    "TN-01".to_string()
}

/// Configuration for a single vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleSpec {
    /// Vehicle identifier.
    pub id: String,
    /// Route id in the route store.
    pub route: String,
    /// Vehicle class.
    #[serde(rename = "type")]
    pub kind: String,
    /// Route display label.
    pub label: String,
    /// Origin name for the forward trip.
    pub origin: String,
    /// Destination name for the forward trip.
    pub destination: String,
    /// Waypoints advanced per tick.
    #[serde(default = "default_speed")]
    pub speed: f64,
    /// Initial direction.
    #[serde(default)]
    pub direction: Direction,
}

impl VehicleSpec {
    fn meta(&self) -> VehicleMeta {
        VehicleMeta {
            kind: self.kind.clone(),
            route_label: self.label.clone(),
            origin: self.origin.clone(),
            destination: self.destination.clone(),
        }
    }
}

/// A batch of vehicles sharing a route.
///
/// Members alternate: odd members are AC coaches heading forward, even
/// members are non-AC coaches starting on the return trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetGroup {
    /// Route id in the route store.
    pub route: String,
    /// Service name, shown as `"<operator> <label>"`.
    pub label: String,
    /// Origin name for the forward trip.
    pub origin: String,
    /// Destination name for the forward trip.
    pub destination: String,
    /// Number of vehicles.
    pub count: usize,
    /// Waypoints advanced per tick.
    #[serde(default = "default_speed")]
    pub speed: f64,
    /// Operator brand.
    #[serde(default = "default_operator")]
    pub operator: String,
    /// Registration prefix for vehicle ids.
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

impl FleetGroup {
    /// Expand the group into individual vehicle specs.
    #[must_use]
    pub fn expand(&self) -> Vec<VehicleSpec> {
        (1..=self.count)
            .map(|i| {
                let ac = i % 2 == 1;
                let (class, series) = if ac { ("AC", "AN") } else { ("Non-AC", "N") };
                VehicleSpec {
                    id: format!("{}-{}-{}", self.prefix, series, 1000 + i),
                    route: self.route.clone(),
                    kind: format!("{} {}", self.operator, class),
                    label: format!("{} {}", self.operator, self.label),
                    origin: self.origin.clone(),
                    destination: self.destination.clone(),
                    speed: self.speed,
                    direction: if ac {
                        Direction::Forward
                    } else {
                        Direction::Reverse
                    },
                }
            })
            .collect()
    }
}

/// The roster used when nothing is configured: Nellore-Chennai plus two
/// Chennai-Tirupati corridors.
#[must_use]
pub fn default_groups() -> Vec<FleetGroup> {
    let group = |route: &str, label: &str, origin: &str, destination: &str, count: usize, prefix: &str| {
        FleetGroup {
            route: route.to_string(),
            label: label.to_string(),
            origin: origin.to_string(),
            destination: destination.to_string(),
            count,
            speed: default_speed(),
            operator: default_operator(),
            prefix: prefix.to_string(),
        }
    };

    vec![
        group("nc", "Exp 144", "Nellore", "Chennai", 6, "TN-01"),
        group("tc_main", "Ultra Deluxe", "Chennai", "Tirupati", 4, "TN-02"),
        group("tc_alt", "Super Fast", "Chennai", "Tirupati", 4, "TN-03"),
    ]
}

/// The set of simulated vehicles, in insertion order.
#[derive(Debug, Default)]
pub struct Fleet {
    vehicles: Vec<Vehicle>,
}

impl Fleet {
    /// Create an empty fleet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a fleet from specs.
    ///
    /// Vehicles that cannot be spawned are logged, excluded, and their
    /// errors returned alongside the fleet.
    pub fn build(
        specs: &[VehicleSpec],
        routes: &RouteStore,
        rng: &mut FleetRng,
    ) -> (Self, Vec<FleetError>) {
        let mut fleet = Self::new();
        let mut errors = Vec::new();

        for spec in specs {
            let result = Self::spawn(spec, routes, rng).and_then(|v| fleet.add(v));
            if let Err(e) = result {
                warn!(vehicle = %spec.id, error = %e, "Excluding vehicle from fleet");
                errors.push(e);
            }
        }

        (fleet, errors)
    }

    /// Create a vehicle from its spec at a random point on its route.
    ///
    /// # Errors
    ///
    /// Returns an error if the route is not loaded or the speed is invalid.
    pub fn spawn(
        spec: &VehicleSpec,
        routes: &RouteStore,
        rng: &mut FleetRng,
    ) -> Result<Vehicle, FleetError> {
        let route = routes.get(&spec.route).map_err(|source| FleetError::Route {
            id: spec.id.clone(),
            source,
        })?;
        let (index, progress) = rng.placement(route.len());

        Ok(Vehicle::new(spec.id.clone(), spec.meta(), route, spec.speed, spec.direction)?
            .placed_at(index, progress))
    }

    /// Add a vehicle.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::DuplicateVehicle`] if the id is taken.
    pub fn add(&mut self, vehicle: Vehicle) -> Result<(), FleetError> {
        if self.contains(vehicle.id()) {
            return Err(FleetError::DuplicateVehicle(vehicle.id().to_string()));
        }
        debug!(vehicle = %vehicle.id(), route = %vehicle.route().id(), "Vehicle joined fleet");
        self.vehicles.push(vehicle);
        Ok(())
    }

    /// Remove a vehicle by id.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::UnknownVehicle`] if no such vehicle exists.
    pub fn remove(&mut self, id: &str) -> Result<Vehicle, FleetError> {
        let pos = self
            .vehicles
            .iter()
            .position(|v| v.id() == id)
            .ok_or_else(|| FleetError::UnknownVehicle(id.to_string()))?;
        debug!(vehicle = %id, "Vehicle left fleet");
        Ok(self.vehicles.remove(pos))
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.vehicles.iter().any(|v| v.id() == id)
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Vehicle> {
        self.vehicles.iter().find(|v| v.id() == id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.vehicles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vehicles.is_empty()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Vehicle> {
        self.vehicles.iter_mut()
    }

    /// Vehicle ids in fleet order.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.vehicles.iter().map(|v| v.id().to_string()).collect()
    }
}
