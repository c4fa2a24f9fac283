use crate::models::{LiveVehicle, LiveVehiclesResponse, RouteKey, SourceState, SourceStatus};
use crate::spatial::normalize_bearing;
use ahash::AHashSet;
use chrono::DateTime;
use gtfs_realtime::FeedMessage;
use prost::Message;
use thiserror::Error;

/// NJ Transit vehicle positions older than this are dropped.
pub const NJT_STALE_AFTER_SECS: u64 = 20 * 60;

/// Princeton TripShot reports older than this are dropped.
pub const PRINCETON_STALE_AFTER_SECS: u64 = 15 * 60;

pub const NJT_AGENCY: &str = "njt";
pub const PRINCETON_AGENCY: &str = "princeton";

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("upstream returned status {0}")]
    Status(u16),
    #[error("upstream request failed: {0}")]
    Transport(String),
    #[error("could not decode feed: {0}")]
    Decode(String),
}

impl FeedError {
    /// Transport-level trouble reads as `unavailable`; a feed we reached but
    /// could not make sense of reads as `error`.
    pub fn source_state(&self) -> SourceState {
        match self {
            FeedError::Status(_) | FeedError::Transport(_) => SourceState::Unavailable,
            FeedError::Decode(_) => SourceState::Error,
        }
    }
}

/// Upstream endpoints the aggregation polls. URLs come from the environment
/// in the campion binary.
#[derive(Clone, Debug)]
pub struct UpstreamConfig {
    pub njt_vehicle_positions_url: String,
    pub princeton_status_url: String,
}

/// Decode the NJ Transit GTFS-realtime vehicle-positions feed and normalize
/// the entities onto the live-vehicle contract. Entities without a position
/// or route, entities for routes nobody asked about, and reports older than
/// [`NJT_STALE_AFTER_SECS`] are dropped.
pub fn normalize_njt_feed(
    bytes: &[u8],
    requested: &AHashSet<RouteKey>,
    now: u64,
) -> Result<Vec<LiveVehicle>, FeedError> {
    let message = FeedMessage::decode(bytes).map_err(|e| FeedError::Decode(e.to_string()))?;
    let header_timestamp = message.header.timestamp;

    let mut vehicles = Vec::new();
    for entity in &message.entity {
        let Some(vehicle_pos) = &entity.vehicle else {
            continue;
        };
        let Some(position) = &vehicle_pos.position else {
            continue;
        };
        let Some(route_id) = vehicle_pos
            .trip
            .as_ref()
            .and_then(|trip| trip.route_id.as_deref())
        else {
            continue;
        };

        let route_key = RouteKey::new(format!("{NJT_AGENCY}:{route_id}"));
        if !requested.contains(&route_key) {
            continue;
        }

        let timestamp = vehicle_pos
            .timestamp
            .or(header_timestamp)
            .unwrap_or(now);
        if now.saturating_sub(timestamp) > NJT_STALE_AFTER_SECS {
            continue;
        }

        let descriptor = vehicle_pos.vehicle.as_ref();
        let vehicle_id = descriptor
            .and_then(|v| v.id.clone())
            .unwrap_or_else(|| entity.id.clone());

        vehicles.push(LiveVehicle {
            id: format!("{NJT_AGENCY}:{vehicle_id}"),
            agency: NJT_AGENCY.to_string(),
            route_key,
            vehicle_id,
            label: descriptor.and_then(|v| v.label.clone()),
            lat: position.latitude as f64,
            lon: position.longitude as f64,
            bearing: position.bearing.map(|b| normalize_bearing(b as f64)),
            speed: position.speed.map(|s| s as f64),
            timestamp,
        });
    }
    Ok(vehicles)
}

/// The subset of the TripShot live-status JSON the normalization reads.
#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripShotStatus {
    pub vehicles: Vec<TripShotVehicle>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripShotVehicle {
    pub vehicle_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub route_short_name: Option<String>,
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub heading: Option<f64>,
    #[serde(default)]
    pub speed: Option<f64>,
    /// RFC 3339 instant of the upstream report.
    #[serde(default)]
    pub received_at: Option<String>,
}

/// Normalize the Princeton TripShot live-status feed. Vehicles without a
/// route, off-request routes, and reports older than
/// [`PRINCETON_STALE_AFTER_SECS`] are dropped; an unparseable `receivedAt`
/// counts as current rather than discarding the vehicle.
pub fn normalize_princeton_feed(
    bytes: &[u8],
    requested: &AHashSet<RouteKey>,
    now: u64,
) -> Result<Vec<LiveVehicle>, FeedError> {
    let status: TripShotStatus =
        serde_json::from_slice(bytes).map_err(|e| FeedError::Decode(e.to_string()))?;

    let mut vehicles = Vec::new();
    for vehicle in status.vehicles {
        let Some(route_short_name) = &vehicle.route_short_name else {
            continue;
        };
        let route_key = RouteKey::new(format!("{PRINCETON_AGENCY}:{route_short_name}"));
        if !requested.contains(&route_key) {
            continue;
        }

        let timestamp = vehicle
            .received_at
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|instant| instant.timestamp().max(0) as u64)
            .unwrap_or(now);
        if now.saturating_sub(timestamp) > PRINCETON_STALE_AFTER_SECS {
            continue;
        }

        vehicles.push(LiveVehicle {
            id: format!("{PRINCETON_AGENCY}:{}", vehicle.vehicle_id),
            agency: PRINCETON_AGENCY.to_string(),
            route_key,
            vehicle_id: vehicle.vehicle_id,
            label: vehicle.name,
            lat: vehicle.lat,
            lon: vehicle.lon,
            bearing: vehicle.heading.map(normalize_bearing),
            speed: vehicle.speed,
            timestamp,
        });
    }
    Ok(vehicles)
}

async fn fetch_bytes(client: &reqwest::Client, url: &str) -> Result<Vec<u8>, FeedError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| FeedError::Transport(e.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        return Err(FeedError::Status(status.as_u16()));
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|e| FeedError::Transport(e.to_string()))?;
    Ok(bytes.to_vec())
}

fn agency_result(
    agency: &str,
    result: Result<Vec<LiveVehicle>, FeedError>,
) -> (Vec<LiveVehicle>, SourceStatus) {
    match result {
        Ok(vehicles) => (
            vehicles,
            SourceStatus {
                agency: agency.to_string(),
                state: SourceState::Ok,
                detail: None,
            },
        ),
        Err(err) => (
            Vec::new(),
            SourceStatus {
                agency: agency.to_string(),
                state: err.source_state(),
                detail: Some(err.to_string()),
            },
        ),
    }
}

fn skipped(agency: &str) -> SourceStatus {
    SourceStatus {
        agency: agency.to_string(),
        state: SourceState::Skipped,
        detail: None,
    }
}

/// Fetch and merge both upstreams for the requested route keys. Each agency
/// fails independently: one upstream's error becomes its own status entry and
/// never suppresses the other agency's vehicles. An agency with no requested
/// routes is not polled at all and reports `skipped`.
pub async fn aggregate_live_vehicles(
    client: &reqwest::Client,
    config: &UpstreamConfig,
    route_keys: &[RouteKey],
    now: u64,
) -> LiveVehiclesResponse {
    let requested: AHashSet<RouteKey> = route_keys.iter().cloned().collect();
    let njt_requested: AHashSet<RouteKey> = requested
        .iter()
        .filter(|key| key.agency_id() == NJT_AGENCY)
        .cloned()
        .collect();
    let princeton_requested: AHashSet<RouteKey> = requested
        .iter()
        .filter(|key| key.agency_id() == PRINCETON_AGENCY)
        .cloned()
        .collect();

    let njt_future = async {
        if njt_requested.is_empty() {
            return None;
        }
        let result = match fetch_bytes(client, &config.njt_vehicle_positions_url).await {
            Ok(bytes) => normalize_njt_feed(&bytes, &njt_requested, now),
            Err(err) => Err(err),
        };
        Some(agency_result(NJT_AGENCY, result))
    };
    let princeton_future = async {
        if princeton_requested.is_empty() {
            return None;
        }
        let result = match fetch_bytes(client, &config.princeton_status_url).await {
            Ok(bytes) => normalize_princeton_feed(&bytes, &princeton_requested, now),
            Err(err) => Err(err),
        };
        Some(agency_result(PRINCETON_AGENCY, result))
    };

    let (njt, princeton) = futures::join!(njt_future, princeton_future);

    let mut vehicles = Vec::new();
    let mut sources = Vec::new();
    match njt {
        Some((mut agency_vehicles, status)) => {
            vehicles.append(&mut agency_vehicles);
            sources.push(status);
        }
        None => sources.push(skipped(NJT_AGENCY)),
    }
    match princeton {
        Some((mut agency_vehicles, status)) => {
            vehicles.append(&mut agency_vehicles);
            sources.push(status);
        }
        None => sources.push(skipped(PRINCETON_AGENCY)),
    }

    LiveVehiclesResponse {
        fetched_at: now,
        vehicles,
        sources,
    }
}
