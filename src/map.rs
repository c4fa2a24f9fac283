use crate::cluster::StopClusterView;
use crate::models::{RouteData, RouteKey};

/// Converts geographic coordinates to screen pixels for the current
/// viewport. Implemented by the embedding map; tests use fixed scales.
pub trait Projection {
    fn project(&self, lat: f64, lon: f64) -> (f64, f64);
}

/// One polyline of a built route layer, tagged with the directions it
/// serves so direction-pinned previews can hide the others.
#[derive(Clone, Debug)]
pub struct LayerPolyline {
    pub direction_keys: Vec<String>,
    pub points: Vec<[f64; 2]>,
}

/// The renderable group for one route, built once from loaded geometry and
/// kept until the session ends.
#[derive(Clone, Debug)]
pub struct RouteLayer {
    pub route_key: RouteKey,
    pub color: String,
    pub polylines: Vec<LayerPolyline>,
}

impl RouteLayer {
    pub fn build(route_key: RouteKey, color: String, data: &RouteData) -> Self {
        let polylines = data
            .shapes
            .iter()
            .map(|shape| LayerPolyline {
                direction_keys: shape.direction_keys.clone(),
                points: shape.points.clone(),
            })
            .collect();
        RouteLayer {
            route_key,
            color,
            polylines,
        }
    }

    /// Indices of polylines serving `direction_key`, or all indices when no
    /// direction is pinned.
    pub fn visible_polylines(&self, direction_key: Option<&str>) -> Vec<usize> {
        match direction_key {
            None => (0..self.polylines.len()).collect(),
            Some(direction) => self
                .polylines
                .iter()
                .enumerate()
                .filter(|(_, pl)| pl.direction_keys.iter().any(|k| k == direction))
                .map(|(idx, _)| idx)
                .collect(),
        }
    }
}

/// The session's view of the embedding map. All geometry mutations flow
/// through here so the selection lifecycle can run without a real map.
pub trait MapSurface: Send {
    /// Layer becomes visible. Called at most once per attach/detach cycle.
    fn attach_route_layer(&mut self, layer: &RouteLayer);
    fn detach_route_layer(&mut self, route_key: &RouteKey);
    /// Direction-aware shape visibility within an attached layer.
    fn set_visible_polylines(&mut self, route_key: &RouteKey, visible: &[usize]);
    /// Full replacement of the merged stop markers.
    fn set_stop_clusters(&mut self, clusters: &[StopClusterView]);
}

/// Recording surface for tests and headless runs.
#[derive(Default)]
pub struct NullSurface {
    pub attached: Vec<RouteKey>,
    pub cluster_count: usize,
}

impl MapSurface for NullSurface {
    fn attach_route_layer(&mut self, layer: &RouteLayer) {
        if !self.attached.contains(&layer.route_key) {
            self.attached.push(layer.route_key.clone());
        }
    }

    fn detach_route_layer(&mut self, route_key: &RouteKey) {
        self.attached.retain(|key| key != route_key);
    }

    fn set_visible_polylines(&mut self, _route_key: &RouteKey, _visible: &[usize]) {}

    fn set_stop_clusters(&mut self, clusters: &[StopClusterView]) {
        self.cluster_count = clusters.len();
    }
}
