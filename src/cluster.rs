use crate::map::Projection;
use crate::models::{RouteData, RouteKey};
use crate::spatial::planar_distance_m;
use ahash::AHashMap;
use std::sync::Arc;

/// Stops from different routes within this distance render as one marker.
pub const STOP_MERGE_RADIUS_M: f64 = 24.0;

/// Default and floor for the invisible hit-target circle, in screen pixels.
pub const DEFAULT_HIT_RADIUS_PX: f64 = 18.0;
pub const MIN_HIT_RADIUS_PX: f64 = 7.0;

/// Neighborhood used when estimating local marker density on screen.
const DENSITY_NEIGHBORHOOD_PX: f64 = 56.0;

/// Meters per degree of latitude (and of longitude at the equator).
const M_PER_DEG: f64 = 111_194.93;

/// One (route, stop) pair kept inside a cluster. At most one per route.
#[derive(Clone, Debug)]
pub struct ClusterMember {
    pub route_key: RouteKey,
    pub route_color: String,
    pub stop_id: String,
    pub stop_name: String,
    pub lat: f64,
    pub lon: f64,
}

/// A merged group of geographically coincident stops across the selected
/// routes, rendered as a single interactive target.
#[derive(Clone, Debug)]
pub struct StopClusterView {
    pub lat: f64,
    pub lon: f64,
    pub members: Vec<ClusterMember>,
    /// Which member's route drives the default popup panel and, for
    /// single-route clusters, the marker color.
    pub active_member: usize,
    pub hit_radius_px: f64,
}

impl StopClusterView {
    pub fn route_count(&self) -> usize {
        let mut keys: Vec<&RouteKey> = self.members.iter().map(|m| &m.route_key).collect();
        keys.dedup();
        keys.len()
    }

    /// Marker color: the route's own color when a single route covers the
    /// cluster, neutral shared styling otherwise.
    pub fn marker_color(&self) -> Option<&str> {
        match self.members.as_slice() {
            [only] => Some(&only.route_color),
            _ => None,
        }
    }

    pub fn active(&self) -> &ClusterMember {
        &self.members[self.active_member]
    }

    /// Point the active-route marker at `route_key`. Returns false when the
    /// cluster has no member for that route.
    pub fn set_active_route(&mut self, route_key: &RouteKey) -> bool {
        match self.members.iter().position(|m| &m.route_key == route_key) {
            Some(idx) => {
                self.active_member = idx;
                true
            }
            None => false,
        }
    }
}

/// A selected route feeding the cluster build.
#[derive(Clone)]
pub struct ClusterRouteInput {
    pub route_key: RouteKey,
    pub color: String,
    pub data: Arc<RouteData>,
}

struct BuildingCluster {
    sum_lat: f64,
    sum_lon: f64,
    members: Vec<ClusterMember>,
}

impl BuildingCluster {
    fn centroid(&self) -> (f64, f64) {
        let n = self.members.len() as f64;
        (self.sum_lat / n, self.sum_lon / n)
    }
}

fn grid_cell(lat: f64, lon: f64, cos_ref: f64) -> (i64, i64) {
    let cx = (lon * M_PER_DEG * cos_ref / STOP_MERGE_RADIUS_M).floor() as i64;
    let cy = (lat * M_PER_DEG / STOP_MERGE_RADIUS_M).floor() as i64;
    (cx, cy)
}

/// Merge all (route, stop) pairs of the given routes into cluster views.
///
/// Points accrete onto a running centroid: a candidate joins the first
/// existing cluster whose centroid lies within the merge radius, found
/// through a spatial hash grid keyed at radius scale, so the merge stays
/// near-linear in stop count. After accretion each cluster keeps at most
/// one stop per route, the one nearest the final centroid.
pub fn build_clusters(inputs: &[ClusterRouteInput]) -> Vec<StopClusterView> {
    let cos_ref = inputs
        .iter()
        .flat_map(|input| input.data.stops.first())
        .map(|stop| stop.lat.to_radians().cos())
        .next()
        .unwrap_or(1.0);

    let mut clusters: Vec<BuildingCluster> = Vec::new();
    let mut grid: AHashMap<(i64, i64), Vec<usize>> = AHashMap::new();

    for input in inputs {
        for stop in &input.data.stops {
            let member = ClusterMember {
                route_key: input.route_key.clone(),
                route_color: input.color.clone(),
                stop_id: stop.stop_id.clone(),
                stop_name: stop.name.clone(),
                lat: stop.lat,
                lon: stop.lon,
            };

            let (cx, cy) = grid_cell(stop.lat, stop.lon, cos_ref);
            let mut joined: Option<usize> = None;
            'search: for dx in -1..=1 {
                for dy in -1..=1 {
                    let Some(cell) = grid.get(&(cx + dx, cy + dy)) else {
                        continue;
                    };
                    for &idx in cell {
                        let (c_lat, c_lon) = clusters[idx].centroid();
                        if planar_distance_m(stop.lat, stop.lon, c_lat, c_lon)
                            <= STOP_MERGE_RADIUS_M
                        {
                            joined = Some(idx);
                            break 'search;
                        }
                    }
                }
            }

            match joined {
                Some(idx) => {
                    let cluster = &mut clusters[idx];
                    cluster.sum_lat += member.lat;
                    cluster.sum_lon += member.lon;
                    cluster.members.push(member);
                    // The centroid may have drifted into a new cell; register
                    // it there as well so later points still find it.
                    let (c_lat, c_lon) = cluster.centroid();
                    let new_cell = grid_cell(c_lat, c_lon, cos_ref);
                    let entries = grid.entry(new_cell).or_default();
                    if !entries.contains(&idx) {
                        entries.push(idx);
                    }
                }
                None => {
                    let idx = clusters.len();
                    clusters.push(BuildingCluster {
                        sum_lat: member.lat,
                        sum_lon: member.lon,
                        members: vec![member],
                    });
                    grid.entry((cx, cy)).or_default().push(idx);
                }
            }
        }
    }

    clusters
        .into_iter()
        .map(|cluster| {
            let (lat, lon) = cluster.centroid();

            // One member per route: keep the stop nearest the centroid, in
            // first-seen route order.
            let mut kept: Vec<ClusterMember> = Vec::new();
            for member in cluster.members {
                match kept.iter_mut().find(|m| m.route_key == member.route_key) {
                    Some(existing) => {
                        let existing_d =
                            planar_distance_m(existing.lat, existing.lon, lat, lon);
                        let candidate_d = planar_distance_m(member.lat, member.lon, lat, lon);
                        if candidate_d < existing_d {
                            *existing = member;
                        }
                    }
                    None => kept.push(member),
                }
            }

            StopClusterView {
                lat,
                lon,
                members: kept,
                active_member: 0,
                hit_radius_px: DEFAULT_HIT_RADIUS_PX,
            }
        })
        .collect()
}

/// Recompute hit-target radii from on-screen marker density. Denser areas
/// get smaller targets, clamped to [`MIN_HIT_RADIUS_PX`,
/// `DEFAULT_HIT_RADIUS_PX`]. Called on zoom/pan and after rebuilds.
pub fn recompute_hit_radii(clusters: &mut [StopClusterView], projection: &dyn Projection) {
    let screen: Vec<(f64, f64)> = clusters
        .iter()
        .map(|c| projection.project(c.lat, c.lon))
        .collect();

    let mut grid: AHashMap<(i64, i64), Vec<usize>> = AHashMap::new();
    for (idx, (x, y)) in screen.iter().enumerate() {
        let cell = (
            (x / DENSITY_NEIGHBORHOOD_PX).floor() as i64,
            (y / DENSITY_NEIGHBORHOOD_PX).floor() as i64,
        );
        grid.entry(cell).or_default().push(idx);
    }

    for (idx, cluster) in clusters.iter_mut().enumerate() {
        let (x, y) = screen[idx];
        let cell = (
            (x / DENSITY_NEIGHBORHOOD_PX).floor() as i64,
            (y / DENSITY_NEIGHBORHOOD_PX).floor() as i64,
        );
        let mut neighbors = 0usize;
        for dx in -1..=1 {
            for dy in -1..=1 {
                let Some(entries) = grid.get(&(cell.0 + dx, cell.1 + dy)) else {
                    continue;
                };
                for &other in entries {
                    if other == idx {
                        continue;
                    }
                    let (ox, oy) = screen[other];
                    let dist = ((ox - x).powi(2) + (oy - y).powi(2)).sqrt();
                    if dist <= DENSITY_NEIGHBORHOOD_PX {
                        neighbors += 1;
                    }
                }
            }
        }
        cluster.hit_radius_px = (DEFAULT_HIT_RADIUS_PX / (1.0 + 0.45 * neighbors as f64))
            .clamp(MIN_HIT_RADIUS_PX, DEFAULT_HIT_RADIUS_PX);
    }
}

/// Holds the current cluster set and coalesces rebuild requests: any number
/// of selection changes before the next flush mark the engine dirty once,
/// and the driver performs exactly one rebuild per frame.
#[derive(Default)]
pub struct ClusterEngine {
    dirty: bool,
    clusters: Vec<StopClusterView>,
}

impl ClusterEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Clears and returns the dirty flag; the caller rebuilds iff true.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    pub fn rebuild(&mut self, inputs: &[ClusterRouteInput]) -> &[StopClusterView] {
        self.clusters = build_clusters(inputs);
        self.dirty = false;
        &self.clusters
    }

    pub fn clusters(&self) -> &[StopClusterView] {
        &self.clusters
    }

    pub fn clusters_mut(&mut self) -> &mut [StopClusterView] {
        &mut self.clusters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RouteData, RouteStop};

    fn stop(id: &str, lat: f64, lon: f64) -> RouteStop {
        RouteStop {
            stop_id: id.to_string(),
            name: id.to_string(),
            lat,
            lon,
            service_schedule_by_direction: None,
        }
    }

    fn input(key: &str, color: &str, stops: Vec<RouteStop>) -> ClusterRouteInput {
        ClusterRouteInput {
            route_key: RouteKey::new(key),
            color: color.to_string(),
            data: Arc::new(RouteData {
                shapes: vec![],
                stops,
                direction_labels: None,
                active_services_by_day_by_direction: None,
                representative_dates: None,
                schedule_file: None,
            }),
        }
    }

    // About 10 m of latitude.
    const LAT_10M: f64 = 10.0 / M_PER_DEG;
    const LAT_100M: f64 = 100.0 / M_PER_DEG;

    #[test]
    fn nearby_stops_from_different_routes_merge() {
        let inputs = vec![
            input("njt:1", "#aa0000", vec![stop("a", 40.7357, -74.1724)]),
            input("njt:2", "#00aa00", vec![stop("b", 40.7357 + LAT_10M, -74.1724)]),
        ];
        let clusters = build_clusters(&inputs);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].members.len(), 2);
        assert_eq!(clusters[0].marker_color(), None);
    }

    #[test]
    fn distant_stops_stay_separate() {
        let inputs = vec![
            input("njt:1", "#aa0000", vec![stop("a", 40.7357, -74.1724)]),
            input("njt:2", "#00aa00", vec![stop("b", 40.7357 + LAT_100M, -74.1724)]),
        ];
        let clusters = build_clusters(&inputs);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].marker_color(), Some("#aa0000"));
    }

    #[test]
    fn one_member_per_route_keeps_nearest_to_centroid() {
        // Route njt:1 contributes two stops to the same cluster; only the
        // one nearer the centroid survives.
        let inputs = vec![
            input(
                "njt:1",
                "#aa0000",
                vec![
                    stop("far", 40.7357 + 18.0 / M_PER_DEG, -74.1724),
                    stop("near", 40.7357, -74.1724),
                ],
            ),
            input("njt:2", "#00aa00", vec![stop("other", 40.7357, -74.1724)]),
        ];
        let clusters = build_clusters(&inputs);
        assert_eq!(clusters.len(), 1);
        let cluster = &clusters[0];
        assert_eq!(cluster.members.len(), 2);
        let kept = cluster
            .members
            .iter()
            .find(|m| m.route_key == RouteKey::new("njt:1"))
            .unwrap();
        assert_eq!(kept.stop_id, "near");
    }

    #[test]
    fn transitive_accretion_through_a_moving_centroid() {
        // a-b merge (16 m apart); c is 16 m from b but 32 m from a. It still
        // joins because it is tested against the accreted centroid.
        let base = 40.7357;
        let step = 16.0 / M_PER_DEG;
        let inputs = vec![input(
            "njt:1",
            "#aa0000",
            vec![
                stop("a", base, -74.1724),
                stop("b", base + step, -74.1724),
                stop("c", base + 2.0 * step, -74.1724),
            ],
        )];
        let clusters = build_clusters(&inputs);
        assert_eq!(clusters.len(), 1);
    }

    #[test]
    fn active_route_switch() {
        let inputs = vec![
            input("njt:1", "#aa0000", vec![stop("a", 40.7357, -74.1724)]),
            input("njt:2", "#00aa00", vec![stop("b", 40.7357, -74.1724)]),
        ];
        let mut clusters = build_clusters(&inputs);
        let cluster = &mut clusters[0];
        assert_eq!(cluster.active().route_key, RouteKey::new("njt:1"));
        assert!(cluster.set_active_route(&RouteKey::new("njt:2")));
        assert_eq!(cluster.active().route_key, RouteKey::new("njt:2"));
        assert!(!cluster.set_active_route(&RouteKey::new("njt:9")));
    }

    struct FlatProjection;

    impl Projection for FlatProjection {
        fn project(&self, lat: f64, lon: f64) -> (f64, f64) {
            // 1 degree = 100_000 px, plenty to spread test points out.
            (lon * 100_000.0, lat * 100_000.0)
        }
    }

    #[test]
    fn denser_areas_get_smaller_hit_targets() {
        let mut crowded: Vec<RouteStop> = (0..6)
            .map(|i| stop(&format!("c{i}"), 40.7357 + i as f64 * 30.0 / M_PER_DEG, -74.1724))
            .collect();
        crowded.push(stop("lonely", 41.2, -74.9));
        let inputs = vec![input("njt:1", "#aa0000", crowded)];
        let mut clusters = build_clusters(&inputs);
        recompute_hit_radii(&mut clusters, &FlatProjection);

        let lonely = clusters
            .iter()
            .find(|c| c.members[0].stop_id == "lonely")
            .unwrap();
        assert_eq!(lonely.hit_radius_px, DEFAULT_HIT_RADIUS_PX);

        let crowded_cluster = clusters
            .iter()
            .find(|c| c.members[0].stop_id == "c0")
            .unwrap();
        assert!(crowded_cluster.hit_radius_px < DEFAULT_HIT_RADIUS_PX);
        assert!(crowded_cluster.hit_radius_px >= MIN_HIT_RADIUS_PX);
    }

    #[test]
    fn rebuilds_are_coalesced_by_the_dirty_flag() {
        let mut engine = ClusterEngine::new();
        engine.mark_dirty();
        engine.mark_dirty();
        engine.mark_dirty();
        assert!(engine.take_dirty());
        // Three changes, one rebuild; the next flush has nothing to do.
        assert!(!engine.take_dirty());
    }
}
