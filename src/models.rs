use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Agencies whose routes have a live vehicle feed behind `/api/live-vehicles`.
pub const REALTIME_AGENCIES: &[&str] = &["njt", "princeton"];

/// Agency-qualified route identifier, e.g. `njt:23`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteKey(String);

impl RouteKey {
    pub fn new(key: impl Into<String>) -> Self {
        RouteKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Agency half of the key, `njt` for `njt:23`.
    pub fn agency_id(&self) -> &str {
        self.0.split_once(':').map(|(a, _)| a).unwrap_or(&self.0)
    }

    /// Route half of the key, `23` for `njt:23`.
    pub fn route_id(&self) -> &str {
        self.0.split_once(':').map(|(_, r)| r).unwrap_or("")
    }

    /// Whether this route's agency publishes live vehicle positions.
    pub fn is_realtime_capable(&self) -> bool {
        REALTIME_AGENCIES.contains(&self.agency_id())
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RouteKey {
    fn from(value: &str) -> Self {
        RouteKey(value.to_string())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteMode {
    #[default]
    Bus,
    Rail,
}

/// `[[min_lat, min_lon], [max_lat, max_lon]]` as written by the dataset build.
pub type BoundsBox = [[f64; 2]; 2];

/// One manifest entry. Immutable for the whole session.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteMeta {
    pub key: RouteKey,
    pub agency_id: String,
    pub agency_label: String,
    pub route_id: String,
    pub short_name: String,
    #[serde(default)]
    pub long_name: String,
    #[serde(default)]
    pub route_desc: String,
    #[serde(default)]
    pub label: String,
    pub color: String,
    #[serde(default)]
    pub mode: RouteMode,
    #[serde(default)]
    pub trip_count: u32,
    #[serde(default)]
    pub stop_count: u32,
    #[serde(default)]
    pub shape_count: u32,
    pub bounds: Option<BoundsBox>,
    /// Path of the per-route geometry JSON, relative to the dataset root.
    pub file: String,
    /// Path of the external schedule JSON, absent when schedules are inline.
    #[serde(default)]
    pub schedule_file: Option<String>,
    #[serde(default)]
    pub search_text: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Agency {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceInfo {
    pub agency_id: String,
    pub agency_label: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub gtfs_url: String,
    #[serde(default)]
    pub feed_updated_at: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub generated_at: String,
    #[serde(default)]
    pub timezone: Option<String>,
    pub agencies: Vec<Agency>,
    #[serde(default)]
    pub sources: Vec<SourceInfo>,
    pub routes: Vec<RouteMeta>,
}

/// One polyline of a route. A shape may serve several directions, e.g. a
/// rail line run both ways over the same track.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteShape {
    #[serde(default)]
    pub shape_id: Option<String>,
    pub direction_keys: Vec<String>,
    /// Ordered `[lat, lon]` pairs.
    pub points: Vec<[f64; 2]>,
}

/// direction key -> service id -> sorted "HH:MM:SS" departure times.
pub type ServiceScheduleByDirection = AHashMap<String, AHashMap<String, Vec<String>>>;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteStop {
    pub stop_id: String,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub service_schedule_by_direction: Option<ServiceScheduleByDirection>,
}

/// Per-route geometry + stops payload, fetched lazily and cached for the
/// session once loaded.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteData {
    pub shapes: Vec<RouteShape>,
    pub stops: Vec<RouteStop>,
    #[serde(default)]
    pub direction_labels: Option<AHashMap<String, String>>,
    /// direction key -> day key -> active service ids, for inline schedules.
    #[serde(default)]
    pub active_services_by_day_by_direction:
        Option<AHashMap<String, AHashMap<String, Vec<String>>>>,
    #[serde(default)]
    pub representative_dates: Option<AHashMap<String, Option<String>>>,
    #[serde(default)]
    pub schedule_file: Option<String>,
}

impl RouteData {
    /// Direction keys in a stable order, derived from shapes then stop
    /// schedules since JSON map order is not reliable.
    pub fn direction_keys(&self) -> Vec<String> {
        let mut seen: Vec<String> = Vec::new();
        for shape in &self.shapes {
            for key in &shape.direction_keys {
                if !seen.iter().any(|k| k == key) {
                    seen.push(key.clone());
                }
            }
        }
        for stop in &self.stops {
            if let Some(by_direction) = &stop.service_schedule_by_direction {
                for key in by_direction.keys() {
                    if !seen.iter().any(|k| k == key) {
                        seen.push(key.clone());
                    }
                }
            }
        }
        seen.sort();
        seen
    }

    /// Direction keys a single stop serves, falling back to the route's full
    /// direction set when the stop carries no inline schedule. A one-entry
    /// result is what lets a hovered stop pin its direction implicitly.
    pub fn stop_direction_keys(&self, stop_id: &str) -> Vec<String> {
        if let Some(stop) = self.stops.iter().find(|s| s.stop_id == stop_id) {
            if let Some(by_direction) = &stop.service_schedule_by_direction {
                if !by_direction.is_empty() {
                    let mut keys: Vec<String> = by_direction.keys().cloned().collect();
                    keys.sort();
                    return keys;
                }
            }
        }
        self.direction_keys()
    }

    pub fn direction_label(&self, direction_key: &str) -> Option<&str> {
        self.direction_labels
            .as_ref()
            .and_then(|labels| labels.get(direction_key))
            .map(String::as_str)
    }
}

/// External per-route schedule payload. When present for a stop+direction it
/// is authoritative over inline computation.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleData {
    /// stop id -> direction key -> day key -> "HH:MM:SS" times (may exceed
    /// 24h for next-day overflow).
    pub day_schedules_by_stop_by_direction:
        AHashMap<String, AHashMap<String, AHashMap<String, Vec<String>>>>,
    #[serde(default)]
    pub direction_labels: Option<AHashMap<String, String>>,
    #[serde(default)]
    pub representative_dates: Option<AHashMap<String, Option<String>>>,
}

/// Normalized live vehicle entry. Ephemeral: each poll response supersedes
/// the previous set entirely, keyed by `id`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveVehicle {
    pub id: String,
    pub agency: String,
    pub route_key: RouteKey,
    pub vehicle_id: String,
    #[serde(default)]
    pub label: Option<String>,
    pub lat: f64,
    pub lon: f64,
    /// Degrees in [0, 360), or null when the feed does not report heading.
    #[serde(default)]
    pub bearing: Option<f64>,
    #[serde(default)]
    pub speed: Option<f64>,
    /// Unix seconds of the upstream report.
    pub timestamp: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceState {
    Ok,
    Error,
    Unavailable,
    Skipped,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SourceStatus {
    pub agency: String,
    pub state: SourceState,
    #[serde(default)]
    pub detail: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveVehiclesRequest {
    pub route_keys: Vec<RouteKey>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveVehiclesResponse {
    /// Unix seconds at which the aggregation ran.
    pub fetched_at: u64,
    pub vehicles: Vec<LiveVehicle>,
    pub sources: Vec<SourceStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_key_parts() {
        let key = RouteKey::new("njt:23");
        assert_eq!(key.agency_id(), "njt");
        assert_eq!(key.route_id(), "23");
        assert!(key.is_realtime_capable());

        let princeton = RouteKey::new("princeton:TPL");
        assert!(princeton.is_realtime_capable());

        let path = RouteKey::new("path:hob33");
        assert!(!path.is_realtime_capable());
    }

    #[test]
    fn manifest_round_trips_dataset_field_names() {
        let raw = r#"{
            "generatedAt": "2025-11-02T04:10:00+00:00",
            "timezone": "America/New_York",
            "agencies": [{"id": "njt", "label": "NJ Transit"}],
            "sources": [],
            "routes": [{
                "key": "njt:23",
                "agencyId": "njt",
                "agencyLabel": "NJ Transit",
                "routeId": "23",
                "shortName": "23",
                "longName": "Crosstown",
                "color": "#aa3377",
                "bounds": [[40.1, -74.6], [40.9, -73.9]],
                "file": "routes/njt_23_23.json",
                "scheduleFile": "schedules/njt_23_23_schedule.json",
                "searchText": "23 crosstown nj transit"
            }]
        }"#;
        let manifest: Manifest = serde_json::from_str(raw).unwrap();
        assert_eq!(manifest.routes.len(), 1);
        let route = &manifest.routes[0];
        assert_eq!(route.key, RouteKey::new("njt:23"));
        assert_eq!(
            route.schedule_file.as_deref(),
            Some("schedules/njt_23_23_schedule.json")
        );
        assert_eq!(route.bounds.unwrap()[0][1], -74.6);
        assert_eq!(route.mode, RouteMode::Bus);
    }

    #[test]
    fn route_data_direction_key_order_is_stable() {
        let raw = r#"{
            "shapes": [
                {"directionKeys": ["dir_1"], "points": [[40.0, -74.0], [40.1, -74.1]]},
                {"directionKeys": ["dir_0", "dir_1"], "points": [[40.0, -74.0], [40.2, -74.2]]}
            ],
            "stops": []
        }"#;
        let data: RouteData = serde_json::from_str(raw).unwrap();
        assert_eq!(
            data.direction_keys(),
            vec!["dir_0".to_string(), "dir_1".to_string()]
        );
    }

    #[test]
    fn stop_directions_fall_back_to_route_directions() {
        let raw = r#"{
            "shapes": [
                {"directionKeys": ["dir_0", "dir_1"], "points": [[40.0, -74.0], [40.1, -74.1]]}
            ],
            "stops": [
                {"stopId": "a", "name": "A", "lat": 40.0, "lon": -74.0,
                 "serviceScheduleByDirection": {"dir_1": {"WEEKDAY": ["09:00:00"]}}},
                {"stopId": "b", "name": "B", "lat": 40.1, "lon": -74.1}
            ]
        }"#;
        let data: RouteData = serde_json::from_str(raw).unwrap();
        // A stop with inline schedules serves exactly those directions.
        assert_eq!(data.stop_direction_keys("a"), vec!["dir_1".to_string()]);
        // Without them, the stop inherits the route's full direction set.
        assert_eq!(
            data.stop_direction_keys("b"),
            vec!["dir_0".to_string(), "dir_1".to_string()]
        );
    }
}
