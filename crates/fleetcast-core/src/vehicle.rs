//! Vehicle progress along a route.
//!
//! A vehicle shuttles back and forth along its route forever. Its state is a
//! waypoint index, the fractional progress toward the next waypoint in the
//! direction of travel, and the direction itself. Reaching either end of the
//! route flips the direction.

use crate::fleet::FleetError;
use crate::geo::{interpolate, Coordinate};
use crate::route::Route;
use fleetcast_protocol::PositionEvent;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Direction of travel along a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Toward the last waypoint.
    #[default]
    Forward,
    /// Toward the first waypoint, on the return trip.
    Reverse,
}

impl Direction {
    #[must_use]
    pub fn flipped(self) -> Self {
        match self {
            Direction::Forward => Direction::Reverse,
            Direction::Reverse => Direction::Forward,
        }
    }
}

/// Display metadata carried into every event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VehicleMeta {
    /// Vehicle class, e.g. "TNSTC AC".
    pub kind: String,
    /// Route display label.
    pub route_label: String,
    /// Origin name for the forward trip.
    pub origin: String,
    /// Destination name for the forward trip.
    pub destination: String,
}

/// The computed position of a vehicle after a tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub coordinate: Coordinate,
    pub index: usize,
    pub progress: f64,
    pub direction: Direction,
    /// The direction-dependent neighbor waypoint was out of range and the
    /// position was held at the current waypoint.
    pub clamped: bool,
}

/// A simulated vehicle.
#[derive(Debug, Clone)]
pub struct Vehicle {
    id: String,
    meta: VehicleMeta,
    route: Arc<Route>,
    index: usize,
    progress: f64,
    direction: Direction,
    speed: f64,
}

impl Vehicle {
    /// Create a vehicle at the start of its route with zero progress.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::InvalidSpeed`] unless `speed` is finite and
    /// positive.
    pub fn new(
        id: impl Into<String>,
        meta: VehicleMeta,
        route: Arc<Route>,
        speed: f64,
        direction: Direction,
    ) -> Result<Self, FleetError> {
        let id = id.into();
        if !speed.is_finite() || speed <= 0.0 {
            return Err(FleetError::InvalidSpeed { id, speed });
        }

        Ok(Self {
            id,
            meta,
            route,
            index: 0,
            progress: 0.0,
            direction,
            speed,
        })
    }

    /// Move the vehicle to a waypoint index and progress.
    ///
    /// The index is clamped to the last segment and progress outside
    /// `[0, 1)` resets to 0.
    #[must_use]
    pub fn placed_at(mut self, index: usize, progress: f64) -> Self {
        self.index = index.min(self.route.len().saturating_sub(2));
        self.progress = if (0.0..1.0).contains(&progress) {
            progress
        } else {
            0.0
        };
        self
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn route(&self) -> &Arc<Route> {
        &self.route
    }

    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn progress(&self) -> f64 {
        self.progress
    }

    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Advance one tick and return the new position.
    ///
    /// Returns `None` for a route with fewer than two points.
    pub fn advance(&mut self) -> Option<Position> {
        self.step();
        self.position()
    }

    fn step(&mut self) {
        let len = self.route.len();
        if len < 2 {
            return;
        }

        self.progress += self.speed;

        // One waypoint per iteration so a fast vehicle still sees every
        // boundary. Reaching an end stops stepping for this tick.
        while self.progress >= 1.0 {
            self.progress -= 1.0;

            match self.direction {
                Direction::Forward => {
                    self.index += 1;
                    if self.index >= len - 1 {
                        self.index = len - 2;
                        self.turn_around();
                        break;
                    }
                }
                Direction::Reverse => {
                    self.index = self.index.saturating_sub(1);
                    if self.index == 0 {
                        self.turn_around();
                        break;
                    }
                }
            }
        }
    }

    fn turn_around(&mut self) {
        self.direction = self.direction.flipped();
        self.progress = 0.0;
    }

    /// Interpolated position for the current state.
    ///
    /// Returns `None` for a route with fewer than two points.
    #[must_use]
    pub fn position(&self) -> Option<Position> {
        if self.route.len() < 2 {
            return None;
        }
        let current = self.route.point(self.index)?;

        let neighbor = match self.direction {
            Direction::Forward => self.index.checked_add(1),
            Direction::Reverse => self.index.checked_sub(1),
        }
        .and_then(|n| self.route.point(n));

        let (target, clamped) = match neighbor {
            Some(point) => (point, false),
            None => (current, true),
        };

        Some(Position {
            coordinate: interpolate(current, target, self.progress),
            index: self.index,
            progress: self.progress,
            direction: self.direction,
            clamped,
        })
    }

    /// Origin and destination for the current leg.
    ///
    /// Swapped while the vehicle is on its return trip.
    #[must_use]
    pub fn endpoints(&self) -> (&str, &str) {
        match self.direction {
            Direction::Forward => (&self.meta.origin, &self.meta.destination),
            Direction::Reverse => (&self.meta.destination, &self.meta.origin),
        }
    }

    /// Build the event for a position computed by this vehicle.
    #[must_use]
    pub fn to_event(&self, position: &Position, timestamp: u64) -> PositionEvent {
        let (origin, destination) = self.endpoints();
        PositionEvent {
            vehicle_id: self.id.clone(),
            lat: position.coordinate.lat,
            lng: position.coordinate.lng,
            route: self.meta.route_label.clone(),
            kind: self.meta.kind.clone(),
            origin: origin.to_string(),
            destination: destination.to_string(),
            timestamp,
        }
    }
}
