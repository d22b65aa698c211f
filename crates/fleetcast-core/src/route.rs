//! Route polylines and the route store.
//!
//! Raw polylines arrive as a JSON object mapping route ids to `[lat, lng]`
//! pairs. The store validates each route as it is loaded and hands out
//! shared, immutable [`Route`]s. Once loading is done the store is moved
//! into an `Arc` and only read from.

use crate::geo::Coordinate;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// A route identifier.
pub type RouteId = String;

/// Gaps longer than this are reported as large in [`RouteStats`].
const LARGE_GAP_KM: f64 = 0.5;

/// Route errors.
#[derive(Debug, Error)]
pub enum RouteError {
    /// No polyline is known under this identifier.
    #[error("Route not found: {0}")]
    NotFound(String),

    /// The polyline has fewer than two points.
    #[error("Invalid route {id}: {points} point(s), need at least 2")]
    InvalidRoute { id: String, points: usize },

    /// Route data could not be parsed.
    #[error("Failed to parse route data: {0}")]
    Parse(#[from] serde_json::Error),
}

/// An immutable, validated polyline.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    id: RouteId,
    points: Vec<Coordinate>,
}

impl Route {
    /// Create a route.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::InvalidRoute`] if there are fewer than 2 points.
    pub fn new(id: impl Into<RouteId>, points: Vec<Coordinate>) -> Result<Self, RouteError> {
        let id = id.into();
        if points.len() < 2 {
            return Err(RouteError::InvalidRoute {
                id,
                points: points.len(),
            });
        }
        Ok(Self { id, points })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Number of waypoints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Waypoint at `index`, if in range.
    #[must_use]
    pub fn point(&self, index: usize) -> Option<Coordinate> {
        self.points.get(index).copied()
    }

    /// Compute gap statistics along the polyline.
    #[must_use]
    pub fn stats(&self) -> RouteStats {
        let mut total_km = 0.0;
        let mut max_gap_km: f64 = 0.0;
        let mut large_gaps = 0;

        for pair in self.points.windows(2) {
            let d = pair[0].distance_km(pair[1]);
            total_km += d;
            max_gap_km = max_gap_km.max(d);
            if d > LARGE_GAP_KM {
                large_gaps += 1;
            }
        }

        let segments = self.points.len().saturating_sub(1).max(1);
        RouteStats {
            points: self.points.len(),
            total_km,
            avg_gap_m: total_km * 1000.0 / segments as f64,
            max_gap_km,
            large_gaps,
        }
    }
}

/// Summary of a route's geometry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouteStats {
    /// Number of waypoints.
    pub points: usize,
    /// Total haversine length in kilometres.
    pub total_km: f64,
    /// Mean distance between consecutive waypoints in metres.
    pub avg_gap_m: f64,
    /// Longest distance between consecutive waypoints in kilometres.
    pub max_gap_km: f64,
    /// Number of gaps longer than 500 m.
    pub large_gaps: usize,
}

/// Raw route polylines keyed by route id.
///
/// This is the format produced by route acquisition:
/// `{"nc": [[14.44, 79.98], [14.43, 79.99], ...], ...}`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct RouteData(HashMap<RouteId, Vec<[f64; 2]>>);

impl RouteData {
    /// Create empty route data.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse route data from JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a map of point lists.
    pub fn from_json(text: &str) -> Result<Self, RouteError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Add or replace a raw polyline.
    pub fn insert(&mut self, id: impl Into<RouteId>, points: Vec<[f64; 2]>) {
        self.0.insert(id.into(), points);
    }

    /// Route ids in sorted order.
    #[must_use]
    pub fn ids(&self) -> Vec<RouteId> {
        let mut ids: Vec<_> = self.0.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn raw(&self, id: &str) -> Option<&[[f64; 2]]> {
        self.0.get(id).map(Vec::as_slice)
    }
}

/// Validated routes loaded from [`RouteData`].
#[derive(Debug, Default)]
pub struct RouteStore {
    source: RouteData,
    routes: HashMap<RouteId, Arc<Route>>,
}

impl RouteStore {
    /// Create a store over raw route data. Nothing is loaded yet.
    #[must_use]
    pub fn new(source: RouteData) -> Self {
        Self {
            source,
            routes: HashMap::new(),
        }
    }

    /// Load and validate a route, returning the shared handle.
    ///
    /// Loading an already-loaded route returns the existing handle.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::NotFound`] for an unknown id and
    /// [`RouteError::InvalidRoute`] for a polyline with fewer than 2 points.
    pub fn load(&mut self, id: &str) -> Result<Arc<Route>, RouteError> {
        if let Some(route) = self.routes.get(id) {
            return Ok(Arc::clone(route));
        }

        let raw = self
            .source
            .raw(id)
            .ok_or_else(|| RouteError::NotFound(id.to_string()))?;
        let points = raw.iter().copied().map(Coordinate::from).collect();
        let route = Arc::new(Route::new(id, points)?);

        debug!(route = %id, points = route.len(), "Loaded route");
        self.routes.insert(id.to_string(), Arc::clone(&route));
        Ok(route)
    }

    /// Load every route in the source.
    ///
    /// Invalid routes are logged and skipped; their errors are returned.
    pub fn load_all(&mut self) -> Vec<RouteError> {
        let mut errors = Vec::new();
        for id in self.source.ids() {
            if let Err(e) = self.load(&id) {
                warn!(route = %id, error = %e, "Skipping route");
                errors.push(e);
            }
        }
        errors
    }

    /// Get a loaded route.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::NotFound`] if the route was never loaded.
    pub fn get(&self, id: &str) -> Result<Arc<Route>, RouteError> {
        self.routes
            .get(id)
            .cloned()
            .ok_or_else(|| RouteError::NotFound(id.to_string()))
    }

    /// Number of loaded routes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Loaded routes, sorted by id.
    #[must_use]
    pub fn routes(&self) -> Vec<Arc<Route>> {
        let mut routes: Vec<_> = self.routes.values().cloned().collect();
        routes.sort_by(|a, b| a.id().cmp(b.id()));
        routes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data() -> RouteData {
        RouteData::from_json(
            r#"{
                "line": [[0.0, 0.0], [0.0, 1.0], [0.0, 2.0]],
                "stub": [[1.0, 1.0]],
                "empty": []
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_load_and_get() {
        let mut store = RouteStore::new(data());

        assert!(matches!(store.get("line"), Err(RouteError::NotFound(_))));

        let route = store.load("line").unwrap();
        assert_eq!(route.len(), 3);
        assert_eq!(route.point(1), Some(Coordinate::new(0.0, 1.0)));
        assert_eq!(route.point(3), None);

        let again = store.get("line").unwrap();
        assert!(Arc::ptr_eq(&route, &again));
    }

    #[test]
    fn test_load_unknown() {
        let mut store = RouteStore::new(data());
        assert!(matches!(store.load("nowhere"), Err(RouteError::NotFound(id)) if id == "nowhere"));
    }

    #[test]
    fn test_load_invalid() {
        let mut store = RouteStore::new(data());

        assert!(matches!(
            store.load("stub"),
            Err(RouteError::InvalidRoute { points: 1, .. })
        ));
        assert!(matches!(
            store.load("empty"),
            Err(RouteError::InvalidRoute { points: 0, .. })
        ));
        assert!(store.get("stub").is_err());
    }

    #[test]
    fn test_load_all_skips_invalid() {
        let mut store = RouteStore::new(data());
        let errors = store.load_all();

        assert_eq!(errors.len(), 2);
        assert_eq!(store.len(), 1);
        assert_eq!(store.routes()[0].id(), "line");
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(
            RouteData::from_json(r#"{"line": [[0.0]]}"#),
            Err(RouteError::Parse(_))
        ));
    }

    #[test]
    fn test_route_stats() {
        // One degree of longitude at the equator is ~111 km
        let route = Route::new(
            "eq",
            vec![
                Coordinate::new(0.0, 0.0),
                Coordinate::new(0.0, 0.001),
                Coordinate::new(0.0, 1.0),
            ],
        )
        .unwrap();

        let stats = route.stats();
        assert_eq!(stats.points, 3);
        assert_eq!(stats.large_gaps, 1);
        assert!((stats.total_km - 111.19).abs() < 0.1, "got {}", stats.total_km);
        assert!(stats.max_gap_km > 110.0);
        assert!((stats.avg_gap_m - stats.total_km * 500.0).abs() < 1e-6);
    }
}
