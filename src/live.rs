use crate::map::Projection;
use crate::models::{
    LiveVehicle, LiveVehiclesRequest, LiveVehiclesResponse, RouteKey, SourceState, SourceStatus,
};
use crate::spatial::{bearing_delta, normalize_bearing, planar_distance_m};
use ahash::{AHashMap, AHashSet};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Cadence of the live-position poll while any realtime route is selected.
pub const POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Fixed duration over which a continuing vehicle glides to its new
/// position.
pub const MOVE_DURATION: Duration = Duration::from_millis(900);

/// Moves shorter than this are applied immediately, so stationary vehicles
/// do not jitter.
pub const SNAP_DISTANCE_M: f64 = 0.75;

/// On-screen length of the heading indicator segment.
pub const HEADING_SEGMENT_PX: f64 = 14.0;

/// Where a marker currently sits. Bearing is absent when the feed never
/// reported one for this vehicle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MarkerPose {
    pub lat: f64,
    pub lon: f64,
    pub bearing: Option<f64>,
}

impl MarkerPose {
    fn of(vehicle: &LiveVehicle) -> Self {
        MarkerPose {
            lat: vehicle.lat,
            lon: vehicle.lon,
            bearing: vehicle.bearing,
        }
    }
}

/// Interpolate a heading the short way around: the delta is normalized into
/// (-180, 180] first, so 350° to 10° passes through 0°, not 180°.
pub fn interpolate_bearing(from: f64, to: f64, progress: f64) -> f64 {
    normalize_bearing(from + bearing_delta(from, to) * progress)
}

/// One in-progress marker move, sampled by elapsed time. Pure, so animation
/// behavior is testable without a frame clock.
#[derive(Clone, Debug)]
pub struct MarkerMotion {
    pub from: MarkerPose,
    pub to: MarkerPose,
    pub duration: Duration,
}

impl MarkerMotion {
    pub fn sample(&self, elapsed: Duration) -> MarkerPose {
        let progress = if self.duration.is_zero() {
            1.0
        } else {
            (elapsed.as_secs_f64() / self.duration.as_secs_f64()).clamp(0.0, 1.0)
        };
        let bearing = match (self.from.bearing, self.to.bearing) {
            (Some(from), Some(to)) => Some(interpolate_bearing(from, to, progress)),
            (_, to) => to,
        };
        MarkerPose {
            lat: self.from.lat + (self.to.lat - self.from.lat) * progress,
            lon: self.from.lon + (self.to.lon - self.from.lon) * progress,
            bearing,
        }
    }

    pub fn is_done(&self, elapsed: Duration) -> bool {
        elapsed >= self.duration
    }
}

/// Heading indicator endpoints in screen space, recomputed per viewport so
/// the segment length stays constant across zoom levels. Screen y grows
/// downward; bearing 0 points up.
pub fn heading_segment(
    projection: &dyn Projection,
    pose: &MarkerPose,
    length_px: f64,
) -> Option<((f64, f64), (f64, f64))> {
    let bearing = pose.bearing?;
    let (x, y) = projection.project(pose.lat, pose.lon);
    let rad = bearing.to_radians();
    Some(((x, y), (x + rad.sin() * length_px, y - rad.cos() * length_px)))
}

/// The embedding map's vehicle marker operations, keyed by the normalized
/// vehicle id.
pub trait VehicleSurface: Send {
    fn add_vehicle_marker(&mut self, vehicle: &LiveVehicle, pose: MarkerPose);
    fn move_vehicle_marker(&mut self, id: &str, pose: MarkerPose);
    fn remove_vehicle_marker(&mut self, id: &str);
}

/// Backend the layer polls. The production implementation POSTs to
/// `/api/live-vehicles`; tests substitute scripted sources.
pub trait LiveVehicleSource: Send + Sync {
    fn fetch(
        &self,
        route_keys: Vec<RouteKey>,
    ) -> BoxFuture<'static, Result<LiveVehiclesResponse, String>>;
}

pub struct HttpLiveVehicleSource {
    client: reqwest::Client,
    endpoint_url: String,
}

impl HttpLiveVehicleSource {
    pub fn new(client: reqwest::Client, endpoint_url: impl Into<String>) -> Self {
        HttpLiveVehicleSource {
            client,
            endpoint_url: endpoint_url.into(),
        }
    }
}

impl LiveVehicleSource for HttpLiveVehicleSource {
    fn fetch(
        &self,
        route_keys: Vec<RouteKey>,
    ) -> BoxFuture<'static, Result<LiveVehiclesResponse, String>> {
        let client = self.client.clone();
        let url = self.endpoint_url.clone();
        Box::pin(async move {
            let response = client
                .post(&url)
                .json(&LiveVehiclesRequest { route_keys })
                .send()
                .await
                .map_err(|e| e.to_string())?;
            let status = response.status();
            if !status.is_success() {
                return Err(format!("POST {url} returned status {status}"));
            }
            response.json().await.map_err(|e| e.to_string())
        })
    }
}

struct VehicleMarker {
    vehicle: LiveVehicle,
    pose: MarkerPose,
    motion: Option<MarkerMotion>,
    elapsed: Duration,
}

/// Marker bookkeeping: response diffs, animation ticking and per-agency
/// source-status transitions. Synchronous; the polling shell around it owns
/// the timing.
#[derive(Default)]
pub struct LiveLayerState {
    markers: AHashMap<String, VehicleMarker>,
    source_states: AHashMap<String, SourceState>,
}

impl LiveLayerState {
    pub fn marker_count(&self) -> usize {
        self.markers.len()
    }

    pub fn marker_pose(&self, id: &str) -> Option<MarkerPose> {
        self.markers.get(id).map(|m| m.pose)
    }

    /// The last reported data for a rendered vehicle, for label/tooltip
    /// rendering by the embedder.
    pub fn vehicle(&self, id: &str) -> Option<&LiveVehicle> {
        self.markers.get(id).map(|m| &m.vehicle)
    }

    /// Diff a poll response against the rendered markers: gone vehicles are
    /// torn down, new ones appear at their reported position, continuing
    /// ones animate there (or snap when the move is below
    /// [`SNAP_DISTANCE_M`]).
    pub fn apply_response(
        &mut self,
        response: LiveVehiclesResponse,
        surface: &mut dyn VehicleSurface,
    ) {
        self.note_source_statuses(&response.sources);

        let incoming: AHashSet<&str> = response.vehicles.iter().map(|v| v.id.as_str()).collect();
        let removed: Vec<String> = self
            .markers
            .keys()
            .filter(|id| !incoming.contains(id.as_str()))
            .cloned()
            .collect();
        for id in removed {
            self.markers.remove(&id);
            surface.remove_vehicle_marker(&id);
        }

        for vehicle in response.vehicles {
            let target = MarkerPose::of(&vehicle);
            match self.markers.get_mut(&vehicle.id) {
                Some(marker) => {
                    let distance =
                        planar_distance_m(marker.pose.lat, marker.pose.lon, target.lat, target.lon);
                    if distance <= SNAP_DISTANCE_M {
                        marker.pose = target;
                        marker.motion = None;
                        surface.move_vehicle_marker(&vehicle.id, target);
                    } else {
                        marker.motion = Some(MarkerMotion {
                            from: marker.pose,
                            to: target,
                            duration: MOVE_DURATION,
                        });
                        marker.elapsed = Duration::ZERO;
                    }
                    marker.vehicle = vehicle;
                }
                None => {
                    surface.add_vehicle_marker(&vehicle, target);
                    self.markers.insert(
                        vehicle.id.clone(),
                        VehicleMarker {
                            vehicle,
                            pose: target,
                            motion: None,
                            elapsed: Duration::ZERO,
                        },
                    );
                }
            }
        }
    }

    /// Advance running animations by `delta` and push the sampled poses out.
    pub fn tick(&mut self, delta: Duration, surface: &mut dyn VehicleSurface) {
        for (id, marker) in self.markers.iter_mut() {
            let Some(motion) = &marker.motion else {
                continue;
            };
            marker.elapsed += delta;
            marker.pose = motion.sample(marker.elapsed);
            surface.move_vehicle_marker(id, marker.pose);
            if motion.is_done(marker.elapsed) {
                marker.motion = None;
            }
        }
    }

    pub fn clear(&mut self, surface: &mut dyn VehicleSurface) {
        for id in self.markers.keys() {
            surface.remove_vehicle_marker(id);
        }
        self.markers.clear();
    }

    /// Record per-agency source states, logging only transitions so a
    /// persistently broken upstream does not warn every 15 seconds.
    fn note_source_statuses(&mut self, statuses: &[SourceStatus]) {
        for status in statuses {
            let previous = self.source_states.insert(status.agency.clone(), status.state);
            if previous == Some(status.state) {
                continue;
            }
            match status.state {
                SourceState::Ok | SourceState::Skipped => {
                    log::info!("live source {} is now {:?}", status.agency, status.state);
                }
                SourceState::Error | SourceState::Unavailable => {
                    log::warn!(
                        "live source {} is now {:?}: {}",
                        status.agency,
                        status.state,
                        status.detail.as_deref().unwrap_or("no detail")
                    );
                }
            }
        }
    }

    #[cfg(test)]
    fn source_state(&self, agency: &str) -> Option<SourceState> {
        self.source_states.get(agency).copied()
    }
}

fn selection_signature(keys: &AHashSet<RouteKey>) -> String {
    let mut sorted: Vec<&str> = keys.iter().map(RouteKey::as_str).collect();
    sorted.sort_unstable();
    sorted.join(",")
}

/// Clears the in-flight flag even when the poll future is aborted mid-fetch.
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct LiveInner {
    source: Arc<dyn LiveVehicleSource>,
    state: Mutex<LiveLayerState>,
    surface: Mutex<Box<dyn VehicleSurface>>,
    selected: Mutex<AHashSet<RouteKey>>,
    in_flight: Arc<AtomicBool>,
    poll_failing: AtomicBool,
    poll_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Maintains live-vehicle markers for the realtime-capable subset of the
/// selected routes. Polls while that subset is non-empty and shuts the
/// timer and any in-flight request down entirely when it empties.
#[derive(Clone)]
pub struct LiveVehicleLayer {
    inner: Arc<LiveInner>,
}

impl LiveVehicleLayer {
    pub fn new(source: Arc<dyn LiveVehicleSource>, surface: Box<dyn VehicleSurface>) -> Self {
        LiveVehicleLayer {
            inner: Arc::new(LiveInner {
                source,
                state: Mutex::new(LiveLayerState::default()),
                surface: Mutex::new(surface),
                selected: Mutex::new(AHashSet::new()),
                in_flight: Arc::new(AtomicBool::new(false)),
                poll_failing: AtomicBool::new(false),
                poll_task: Mutex::new(None),
            }),
        }
    }

    /// Track the selection set. Only realtime-capable keys matter here; the
    /// poll loop starts when the subset becomes non-empty and stops (timer
    /// cleared, in-flight request aborted, markers removed) when it empties.
    pub fn update_selection(&self, keys: &[RouteKey]) {
        let realtime: AHashSet<RouteKey> = keys
            .iter()
            .filter(|key| key.is_realtime_capable())
            .cloned()
            .collect();
        {
            let mut selected = self.inner.selected.lock().unwrap();
            if *selected == realtime {
                return;
            }
            *selected = realtime.clone();
        }
        if realtime.is_empty() {
            self.stop();
        } else {
            self.ensure_polling();
        }
    }

    /// Programmatic shutdown (selection emptied, session teardown). The
    /// user-driven and programmatic paths converge here: timer cleared,
    /// in-flight request aborted, marker layers removed.
    pub fn stop(&self) {
        if let Some(task) = self.inner.poll_task.lock().unwrap().take() {
            task.abort();
        }
        let mut state = self.inner.state.lock().unwrap();
        let mut surface = self.inner.surface.lock().unwrap();
        state.clear(&mut **surface);
    }

    pub fn is_polling(&self) -> bool {
        self.inner
            .poll_task
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    fn ensure_polling(&self) {
        let mut task = self.inner.poll_task.lock().unwrap();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let layer = self.clone();
        *task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(POLL_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                layer.poll_once().await;
            }
        }));
    }

    /// One poll cycle. Returns false when skipped because a previous poll is
    /// still outstanding (skip, never queue). A response that arrives after
    /// the selection changed is discarded by signature comparison; a failed
    /// poll leaves the existing markers untouched.
    pub async fn poll_once(&self) -> bool {
        if self.inner.in_flight.swap(true, Ordering::SeqCst) {
            log::debug!("live poll skipped: previous request still in flight");
            return false;
        }
        let _guard = InFlightGuard(Arc::clone(&self.inner.in_flight));

        let (keys, signature) = {
            let selected = self.inner.selected.lock().unwrap();
            if selected.is_empty() {
                return true;
            }
            let mut keys: Vec<RouteKey> = selected.iter().cloned().collect();
            keys.sort();
            (keys, selection_signature(&selected))
        };

        match self.inner.source.fetch(keys).await {
            Ok(response) => {
                let current = selection_signature(&self.inner.selected.lock().unwrap());
                if current != signature {
                    log::debug!("live poll response discarded: selection changed during fetch");
                    return true;
                }
                if self.inner.poll_failing.swap(false, Ordering::SeqCst) {
                    log::info!("live vehicle poll recovered");
                }
                let mut state = self.inner.state.lock().unwrap();
                let mut surface = self.inner.surface.lock().unwrap();
                state.apply_response(response, &mut **surface);
            }
            Err(err) => {
                if !self.inner.poll_failing.swap(true, Ordering::SeqCst) {
                    log::warn!("live vehicle poll failed, keeping existing markers: {err}");
                }
            }
        }
        true
    }

    /// Advance marker animations; the embedder calls this from its frame
    /// loop with the elapsed time since the previous frame.
    pub fn tick(&self, delta: Duration) {
        let mut state = self.inner.state.lock().unwrap();
        let mut surface = self.inner.surface.lock().unwrap();
        state.tick(delta, &mut **surface);
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&LiveLayerState) -> R) -> R {
        f(&self.inner.state.lock().unwrap())
    }

    #[cfg(test)]
    fn set_selection_quiet(&self, keys: &[RouteKey]) {
        *self.inner.selected.lock().unwrap() = keys.iter().cloned().collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn vehicle(id: &str, route: &str, lat: f64, lon: f64, bearing: Option<f64>) -> LiveVehicle {
        LiveVehicle {
            id: id.to_string(),
            agency: "njt".to_string(),
            route_key: RouteKey::new(route),
            vehicle_id: id.to_string(),
            label: None,
            lat,
            lon,
            bearing,
            speed: None,
            timestamp: 1_750_000_000,
        }
    }

    fn response(vehicles: Vec<LiveVehicle>) -> LiveVehiclesResponse {
        LiveVehiclesResponse {
            fetched_at: 1_750_000_000,
            vehicles,
            sources: vec![],
        }
    }

    #[derive(Default)]
    struct SharedRecordingSurface {
        added: Mutex<Vec<String>>,
        removed: Mutex<Vec<String>>,
        moves: Mutex<Vec<(String, MarkerPose)>>,
    }

    struct RecordingSurface(Arc<SharedRecordingSurface>);

    impl VehicleSurface for RecordingSurface {
        fn add_vehicle_marker(&mut self, vehicle: &LiveVehicle, _pose: MarkerPose) {
            self.0.added.lock().unwrap().push(vehicle.id.clone());
        }

        fn move_vehicle_marker(&mut self, id: &str, pose: MarkerPose) {
            self.0.moves.lock().unwrap().push((id.to_string(), pose));
        }

        fn remove_vehicle_marker(&mut self, id: &str) {
            self.0.removed.lock().unwrap().push(id.to_string());
        }
    }

    #[test]
    fn bearing_interpolates_the_short_way() {
        assert_eq!(interpolate_bearing(350.0, 10.0, 0.5), 0.0);
        assert_eq!(interpolate_bearing(10.0, 350.0, 0.5), 0.0);
        assert_eq!(interpolate_bearing(0.0, 90.0, 0.5), 45.0);
    }

    #[test]
    fn motion_samples_position_and_bearing() {
        let motion = MarkerMotion {
            from: MarkerPose {
                lat: 40.0,
                lon: -74.2,
                bearing: Some(350.0),
            },
            to: MarkerPose {
                lat: 40.1,
                lon: -74.0,
                bearing: Some(10.0),
            },
            duration: Duration::from_millis(900),
        };
        let mid = motion.sample(Duration::from_millis(450));
        assert!((mid.lat - 40.05).abs() < 1e-9);
        assert!((mid.lon - (-74.1)).abs() < 1e-9);
        assert_eq!(mid.bearing, Some(0.0));

        // Past the end the pose clamps at the target.
        let done = motion.sample(Duration::from_millis(2_000));
        assert_eq!(done.bearing, Some(10.0));
        assert!(motion.is_done(Duration::from_millis(900)));
    }

    #[test]
    fn heading_segment_points_up_for_north() {
        struct Identity;
        impl Projection for Identity {
            fn project(&self, lat: f64, lon: f64) -> (f64, f64) {
                (lon, lat)
            }
        }
        let pose = MarkerPose {
            lat: 100.0,
            lon: 50.0,
            bearing: Some(0.0),
        };
        let ((x, y), (tx, ty)) = heading_segment(&Identity, &pose, 14.0).unwrap();
        assert_eq!((x, y), (50.0, 100.0));
        assert!((tx - 50.0).abs() < 1e-9);
        // Screen y shrinks upward.
        assert!((ty - 86.0).abs() < 1e-9);

        let no_bearing = MarkerPose {
            bearing: None,
            ..pose
        };
        assert!(heading_segment(&Identity, &no_bearing, 14.0).is_none());
    }

    #[test]
    fn response_diff_creates_moves_and_removes() {
        let shared = Arc::new(SharedRecordingSurface::default());
        let mut surface = RecordingSurface(Arc::clone(&shared));
        let mut state = LiveLayerState::default();

        state.apply_response(
            response(vec![
                vehicle("njt:a", "njt:23", 40.70, -74.20, Some(90.0)),
                vehicle("njt:b", "njt:23", 40.80, -74.10, None),
            ]),
            &mut surface,
        );
        assert_eq!(state.marker_count(), 2);
        assert_eq!(shared.added.lock().unwrap().len(), 2);

        // a moved a long way, b disappeared, c is new.
        state.apply_response(
            response(vec![
                vehicle("njt:a", "njt:23", 40.75, -74.20, Some(90.0)),
                vehicle("njt:c", "njt:23", 40.60, -74.30, None),
            ]),
            &mut surface,
        );
        assert_eq!(state.marker_count(), 2);
        assert_eq!(shared.removed.lock().unwrap().clone(), vec!["njt:b"]);
        assert_eq!(shared.added.lock().unwrap().last().unwrap(), "njt:c");

        // The long move animates rather than jumping.
        let before = state.marker_pose("njt:a").unwrap();
        assert!((before.lat - 40.70).abs() < 1e-9);
        state.tick(Duration::from_millis(450), &mut surface);
        let mid = state.marker_pose("njt:a").unwrap();
        assert!(mid.lat > 40.70 && mid.lat < 40.75);
        state.tick(Duration::from_millis(450), &mut surface);
        let after = state.marker_pose("njt:a").unwrap();
        assert!((after.lat - 40.75).abs() < 1e-9);
    }

    #[test]
    fn tiny_moves_snap_without_animating() {
        let shared = Arc::new(SharedRecordingSurface::default());
        let mut surface = RecordingSurface(Arc::clone(&shared));
        let mut state = LiveLayerState::default();

        state.apply_response(
            response(vec![vehicle("njt:a", "njt:23", 40.70, -74.20, None)]),
            &mut surface,
        );
        // ~0.1 m of latitude.
        state.apply_response(
            response(vec![vehicle("njt:a", "njt:23", 40.700001, -74.20, None)]),
            &mut surface,
        );
        let pose = state.marker_pose("njt:a").unwrap();
        assert!((pose.lat - 40.700001).abs() < 1e-12);
        // Ticking produces no further motion.
        let moves_before = shared.moves.lock().unwrap().len();
        state.tick(Duration::from_millis(100), &mut surface);
        assert_eq!(shared.moves.lock().unwrap().len(), moves_before);
    }

    #[test]
    fn source_status_transitions_are_tracked() {
        let shared = Arc::new(SharedRecordingSurface::default());
        let mut surface = RecordingSurface(Arc::clone(&shared));
        let mut state = LiveLayerState::default();

        let with_status = |vehicle_state: SourceState| LiveVehiclesResponse {
            fetched_at: 0,
            vehicles: vec![],
            sources: vec![SourceStatus {
                agency: "njt".to_string(),
                state: vehicle_state,
                detail: None,
            }],
        };
        state.apply_response(with_status(SourceState::Ok), &mut surface);
        assert_eq!(state.source_state("njt"), Some(SourceState::Ok));
        state.apply_response(with_status(SourceState::Error), &mut surface);
        state.apply_response(with_status(SourceState::Error), &mut surface);
        assert_eq!(state.source_state("njt"), Some(SourceState::Error));
    }

    struct ScriptedSource {
        fetches: AtomicUsize,
        delay: Duration,
        vehicles: Mutex<Vec<LiveVehicle>>,
        fail: AtomicBool,
    }

    impl ScriptedSource {
        fn new(delay: Duration, vehicles: Vec<LiveVehicle>) -> Arc<Self> {
            Arc::new(ScriptedSource {
                fetches: AtomicUsize::new(0),
                delay,
                vehicles: Mutex::new(vehicles),
                fail: AtomicBool::new(false),
            })
        }

        fn fetch_count(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }

        fn set_failing(&self, failing: bool) {
            self.fail.store(failing, Ordering::SeqCst);
        }
    }

    impl LiveVehicleSource for Arc<ScriptedSource> {
        fn fetch(
            &self,
            _route_keys: Vec<RouteKey>,
        ) -> BoxFuture<'static, Result<LiveVehiclesResponse, String>> {
            let this = Arc::clone(self);
            Box::pin(async move {
                this.fetches.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(this.delay).await;
                if this.fail.load(Ordering::SeqCst) {
                    return Err("connection refused".to_string());
                }
                Ok(response(this.vehicles.lock().unwrap().clone()))
            })
        }
    }

    fn layer_with(
        source: Arc<ScriptedSource>,
    ) -> (LiveVehicleLayer, Arc<SharedRecordingSurface>) {
        let shared = Arc::new(SharedRecordingSurface::default());
        let layer = LiveVehicleLayer::new(
            Arc::new(source),
            Box::new(RecordingSurface(Arc::clone(&shared))),
        );
        (layer, shared)
    }

    #[tokio::test]
    async fn overlapping_poll_is_skipped_not_queued() {
        let source = ScriptedSource::new(
            Duration::from_millis(40),
            vec![vehicle("njt:a", "njt:23", 40.7, -74.2, None)],
        );
        let (layer, _surface) = layer_with(Arc::clone(&source));
        layer.set_selection_quiet(&[RouteKey::new("njt:23")]);

        let (first, second) = tokio::join!(layer.poll_once(), async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            layer.poll_once().await
        });
        assert!(first);
        assert!(!second);
        assert_eq!(source.fetch_count(), 1);
        layer.with_state(|state| assert_eq!(state.marker_count(), 1));
    }

    #[tokio::test]
    async fn response_for_an_outdated_selection_is_discarded() {
        let source = ScriptedSource::new(
            Duration::from_millis(30),
            vec![vehicle("njt:a", "njt:23", 40.7, -74.2, None)],
        );
        let (layer, _surface) = layer_with(Arc::clone(&source));
        layer.set_selection_quiet(&[RouteKey::new("njt:23")]);

        let poll = layer.poll_once();
        let change = async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            layer.set_selection_quiet(&[RouteKey::new("njt:87")]);
        };
        let (ran, ()) = tokio::join!(poll, change);
        assert!(ran);
        layer.with_state(|state| assert_eq!(state.marker_count(), 0));
    }

    #[tokio::test]
    async fn poll_failure_keeps_existing_markers() {
        let source = ScriptedSource::new(
            Duration::ZERO,
            vec![vehicle("njt:a", "njt:23", 40.7, -74.2, None)],
        );
        let (layer, surface) = layer_with(Arc::clone(&source));
        layer.set_selection_quiet(&[RouteKey::new("njt:23")]);
        assert!(layer.poll_once().await);
        layer.with_state(|state| assert_eq!(state.marker_count(), 1));

        source.set_failing(true);
        assert!(layer.poll_once().await);
        assert!(layer.poll_once().await);
        layer.with_state(|state| {
            assert_eq!(state.marker_count(), 1);
            assert_eq!(
                state.vehicle("njt:a").unwrap().route_key,
                RouteKey::new("njt:23")
            );
        });
        assert!(surface.removed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn polling_starts_and_stops_with_the_realtime_subset() {
        let source = ScriptedSource::new(Duration::from_millis(5), vec![]);
        let (layer, _surface) = layer_with(Arc::clone(&source));

        // No realtime-capable keys selected: nothing to poll.
        layer.update_selection(&[RouteKey::new("path:hob33")]);
        assert!(!layer.is_polling());

        layer.update_selection(&[RouteKey::new("path:hob33"), RouteKey::new("njt:23")]);
        assert!(layer.is_polling());

        // Emptying the realtime subset clears the timer and the markers.
        layer.update_selection(&[RouteKey::new("path:hob33")]);
        assert!(!layer.is_polling());
    }
}
