use crate::models::{BoundsBox, RouteData, RouteMeta};
use serde::{Deserialize, Serialize};

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Distance in meters between two lat/lon points.
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

/// Equirectangular planar distance in meters. Accurate enough at stop-merge
/// scale (tens of meters) and much cheaper than haversine in the clustering
/// inner loop.
pub fn planar_distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let mean_lat = ((lat1 + lat2) / 2.0).to_radians();
    let x = (lon2 - lon1).to_radians() * mean_lat.cos();
    let y = (lat2 - lat1).to_radians();
    EARTH_RADIUS_M * (x * x + y * y).sqrt()
}

/// Initial bearing in degrees [0, 360) from point `a` to point `b`, both
/// `(lat, lon)`.
pub fn bearing(a: (f64, f64), b: (f64, f64)) -> f64 {
    let (lat1, lon1) = (a.0.to_radians(), a.1.to_radians());
    let (lat2, lon2) = (b.0.to_radians(), b.1.to_radians());
    let dlon = lon2 - lon1;
    let x = dlon.sin() * lat2.cos();
    let y = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlon.cos();
    normalize_bearing(x.atan2(y).to_degrees())
}

/// Wrap any angle into [0, 360).
pub fn normalize_bearing(degrees: f64) -> f64 {
    let wrapped = degrees % 360.0;
    if wrapped < 0.0 { wrapped + 360.0 } else { wrapped }
}

/// Signed shortest rotation from `from` to `to`, normalized into
/// (-180, 180]. A turn from 350 to 10 comes back as +20, not -340.
pub fn bearing_delta(from: f64, to: f64) -> f64 {
    let mut delta = (to - from) % 360.0;
    if delta > 180.0 {
        delta -= 360.0;
    } else if delta <= -180.0 {
        delta += 360.0;
    }
    delta
}

/// Rectangular viewport region in geographic coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
}

impl Region {
    pub fn new(min_lat: f64, min_lon: f64, max_lat: f64, max_lon: f64) -> Self {
        Region {
            min_lat,
            min_lon,
            max_lat,
            max_lon,
        }
    }

    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lat >= self.min_lat && lat <= self.max_lat && lon >= self.min_lon && lon <= self.max_lon
    }

    pub fn intersects_bounds(&self, bounds: &BoundsBox) -> bool {
        let [[b_min_lat, b_min_lon], [b_max_lat, b_max_lon]] = *bounds;
        b_min_lat <= self.max_lat
            && b_max_lat >= self.min_lat
            && b_min_lon <= self.max_lon
            && b_max_lon >= self.min_lon
    }
}

/// Whether a route intersects the region. With loaded geometry the stops are
/// checked first (cheap and usually decisive), then shape points. Without
/// geometry, falls back to the manifest bounding box.
pub fn route_matches_region(meta: &RouteMeta, data: Option<&RouteData>, region: &Region) -> bool {
    if let Some(data) = data {
        if data
            .stops
            .iter()
            .any(|stop| region.contains(stop.lat, stop.lon))
        {
            return true;
        }
        return data.shapes.iter().any(|shape| {
            shape
                .points
                .iter()
                .any(|point| region.contains(point[0], point[1]))
        });
    }

    match &meta.bounds {
        Some(bounds) => region.intersects_bounds(bounds),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RouteKey, RouteShape, RouteStop};

    fn meta_with_bounds(bounds: Option<BoundsBox>) -> RouteMeta {
        RouteMeta {
            key: RouteKey::new("njt:23"),
            agency_id: "njt".to_string(),
            agency_label: "NJ Transit".to_string(),
            route_id: "23".to_string(),
            short_name: "23".to_string(),
            long_name: String::new(),
            route_desc: String::new(),
            label: String::new(),
            color: "#336699".to_string(),
            mode: Default::default(),
            trip_count: 0,
            stop_count: 0,
            shape_count: 0,
            bounds,
            file: "routes/njt_23.json".to_string(),
            schedule_file: None,
            search_text: String::new(),
        }
    }

    #[test]
    fn haversine_sanity() {
        // LA to NYC, roughly 3935 km.
        let dist = haversine_distance(34.0522, -118.2437, 40.7128, -74.0060);
        assert!(dist > 3_930_000.0 && dist < 3_950_000.0);
        assert_eq!(haversine_distance(0.0, 0.0, 0.0, 0.0), 0.0);
    }

    #[test]
    fn planar_distance_tracks_haversine_at_stop_scale() {
        // Two points ~30 m apart around Newark.
        let (lat1, lon1) = (40.7357, -74.1724);
        let (lat2, lon2) = (40.73597, -74.1724);
        let planar = planar_distance_m(lat1, lon1, lat2, lon2);
        let sphere = haversine_distance(lat1, lon1, lat2, lon2);
        assert!((planar - sphere).abs() < 0.5, "planar {planar} vs haversine {sphere}");
    }

    #[test]
    fn bearing_cardinals() {
        assert!((bearing((0.0, 0.0), (1.0, 0.0)) - 0.0).abs() < 1e-6);
        assert!((bearing((0.0, 0.0), (0.0, 1.0)) - 90.0).abs() < 1e-6);
        assert!((bearing((1.0, 0.0), (0.0, 0.0)) - 180.0).abs() < 1e-6);
        assert!((bearing((0.0, 1.0), (0.0, 0.0)) - 270.0).abs() < 1e-6);
    }

    #[test]
    fn bearing_delta_wraps_the_short_way() {
        assert_eq!(bearing_delta(350.0, 10.0), 20.0);
        assert_eq!(bearing_delta(10.0, 350.0), -20.0);
        assert_eq!(bearing_delta(0.0, 180.0), 180.0);
        assert_eq!(normalize_bearing(-90.0), 270.0);
        assert_eq!(normalize_bearing(720.0), 0.0);
    }

    #[test]
    fn region_fallback_uses_bounds_when_geometry_unloaded() {
        let region = Region::new(40.0, -75.0, 41.0, -74.0);
        let inside = meta_with_bounds(Some([[40.2, -74.8], [40.4, -74.5]]));
        let outside = meta_with_bounds(Some([[42.0, -73.0], [43.0, -72.0]]));
        let unknown = meta_with_bounds(None);

        assert!(route_matches_region(&inside, None, &region));
        assert!(!route_matches_region(&outside, None, &region));
        assert!(!route_matches_region(&unknown, None, &region));
    }

    #[test]
    fn region_prefers_loaded_geometry_over_bounds() {
        let region = Region::new(40.0, -75.0, 41.0, -74.0);
        // Bounds intersect, but the actual geometry lies elsewhere.
        let meta = meta_with_bounds(Some([[40.2, -74.8], [40.4, -74.5]]));
        let data = RouteData {
            shapes: vec![RouteShape {
                shape_id: None,
                direction_keys: vec!["dir_0".to_string()],
                points: vec![[42.5, -72.5], [42.6, -72.4]],
            }],
            stops: vec![RouteStop {
                stop_id: "s1".to_string(),
                name: "Elsewhere".to_string(),
                lat: 42.5,
                lon: -72.5,
                service_schedule_by_direction: None,
            }],
            direction_labels: None,
            active_services_by_day_by_direction: None,
            representative_dates: None,
            schedule_file: None,
        };
        assert!(!route_matches_region(&meta, Some(&data), &region));
    }
}
