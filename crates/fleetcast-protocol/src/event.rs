//! Position events.
//!
//! A position event is produced by the simulation once per vehicle per tick
//! and consumed by subscribers and the telemetry sink.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in Unix milliseconds.
///
/// Returns 0 if the system clock is set before the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The position of one vehicle at one tick.
///
/// Serialized with camelCase keys, e.g.
/// `{"vehicleId": "...", "lat": 13.0, "lng": 80.2, "type": "...", ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionEvent {
    /// Vehicle identifier.
    pub vehicle_id: String,
    /// Interpolated latitude.
    pub lat: f64,
    /// Interpolated longitude.
    pub lng: f64,
    /// Route display label.
    pub route: String,
    /// Vehicle class (e.g. "TNSTC AC").
    #[serde(rename = "type")]
    pub kind: String,
    /// Where the vehicle is coming from on its current leg.
    pub origin: String,
    /// Where the vehicle is heading on its current leg.
    pub destination: String,
    /// Unix milliseconds at which the position was computed.
    pub timestamp: u64,
}
