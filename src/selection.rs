use crate::cluster::{ClusterEngine, ClusterRouteInput, StopClusterView};
use crate::data_client::{DataClient, FetchError, Fetcher};
use crate::map::{MapSurface, Projection, RouteLayer};
use crate::models::{Agency, Manifest, RouteData, RouteKey, RouteMeta, ScheduleData};
use crate::spatial::{Region, route_matches_region};
use ahash::{AHashMap, AHashSet};
use futures::StreamExt;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Default cap on simultaneous in-flight geometry loads during batch
/// selection.
pub const DEFAULT_BATCH_CONCURRENCY: usize = 6;

type SharedLoad<T> = Shared<BoxFuture<'static, Result<Arc<T>, FetchError>>>;

#[derive(Clone, Debug, Error)]
pub enum SelectionError {
    #[error("unknown route {0}")]
    UnknownRoute(RouteKey),
    #[error(transparent)]
    Load(#[from] FetchError),
}

/// Mutable per-route session state. Created at manifest load, lives until
/// the session is torn down.
pub struct RouteState {
    pub meta: RouteMeta,
    pub selected: bool,
    /// Result of the last area filter; drives sidebar visibility, not layer
    /// attachment.
    pub is_visible: bool,
    /// Built lazily on first successful geometry load, kept for the rest of
    /// the session.
    pub layer: Option<RouteLayer>,
    pub route_data: Option<Arc<RouteData>>,
    pub schedule_data: Option<Arc<ScheduleData>>,
    attached: bool,
    load_in_flight: Option<SharedLoad<RouteData>>,
    schedule_in_flight: Option<SharedLoad<ScheduleData>>,
}

impl RouteState {
    fn new(meta: RouteMeta) -> Self {
        RouteState {
            meta,
            selected: false,
            is_visible: true,
            layer: None,
            route_data: None,
            schedule_data: None,
            attached: false,
            load_in_flight: None,
            schedule_in_flight: None,
        }
    }

    /// Path of the external schedule file, from the manifest or the loaded
    /// geometry payload.
    fn schedule_file(&self) -> Option<String> {
        self.meta
            .schedule_file
            .clone()
            .or_else(|| self.route_data.as_ref().and_then(|d| d.schedule_file.clone()))
    }
}

/// An agency and its routes in manifest order.
pub struct AgencyState {
    pub agency: Agency,
    pub route_keys: Vec<RouteKey>,
}

#[derive(Default)]
struct HoverSessions {
    count: usize,
    last_seq: u64,
}

/// Decides which selected route is preview-active while hover sessions are
/// open. Sessions are counted per route; the activation sequence number
/// picks the most recently activated live route, and ending a session falls
/// back to the next-highest remaining one (deliberately a recency
/// heuristic, not a strict LIFO stack).
#[derive(Default)]
pub struct PreviewArbiter {
    next_seq: u64,
    sessions: AHashMap<RouteKey, HoverSessions>,
}

impl PreviewArbiter {
    pub fn begin(&mut self, key: &RouteKey) {
        self.next_seq += 1;
        let entry = self.sessions.entry(key.clone()).or_default();
        entry.count += 1;
        entry.last_seq = self.next_seq;
    }

    /// Returns true when this was the route's last live session.
    pub fn end(&mut self, key: &RouteKey) -> bool {
        let Some(entry) = self.sessions.get_mut(key) else {
            return false;
        };
        entry.count = entry.count.saturating_sub(1);
        if entry.count == 0 {
            self.sessions.remove(key);
            true
        } else {
            false
        }
    }

    pub fn clear_route(&mut self, key: &RouteKey) {
        self.sessions.remove(key);
    }

    pub fn active_among(&self, selected: &AHashSet<RouteKey>) -> Option<RouteKey> {
        self.sessions
            .iter()
            .filter(|(key, sessions)| sessions.count > 0 && selected.contains(*key))
            .max_by_key(|(_, sessions)| sessions.last_seq)
            .map(|(key, _)| key.clone())
    }
}

#[derive(Clone, Debug)]
pub struct BatchOptions {
    pub concurrency: usize,
    pub refresh_ui_at_end: bool,
    pub status_text: Option<String>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        BatchOptions {
            concurrency: DEFAULT_BATCH_CONCURRENCY,
            refresh_ui_at_end: true,
            status_text: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub applied: usize,
    pub failed: usize,
}

struct SessionState {
    routes: AHashMap<RouteKey, RouteState>,
    route_order: Vec<RouteKey>,
    agencies: Vec<AgencyState>,
    selected: AHashSet<RouteKey>,
    preview: PreviewArbiter,
    clusters: ClusterEngine,
    /// Direction pinned inside the preview-active route's popup, if any.
    pinned_direction: Option<(RouteKey, String)>,
    timezone: Option<String>,
}

enum SurfaceAction {
    Attach(RouteLayer),
    Detach(RouteKey),
    SetVisible(RouteKey, Vec<usize>),
    Clusters(Vec<StopClusterView>),
}

struct SessionInner {
    client: DataClient,
    state: Mutex<SessionState>,
    surface: Mutex<Box<dyn MapSurface>>,
    status: Mutex<Box<dyn FnMut(String) + Send>>,
    rebuild_queued: AtomicBool,
}

/// The session store: owns every `RouteState`, the selection set, preview
/// arbitration and the cluster engine. One instance per active map view;
/// all components receive it by reference.
#[derive(Clone)]
pub struct MapSession {
    inner: Arc<SessionInner>,
}

impl MapSession {
    pub fn new(fetcher: Arc<dyn Fetcher>, surface: Box<dyn MapSurface>) -> Self {
        MapSession {
            inner: Arc::new(SessionInner {
                client: DataClient::new(fetcher),
                state: Mutex::new(SessionState {
                    routes: AHashMap::new(),
                    route_order: Vec::new(),
                    agencies: Vec::new(),
                    selected: AHashSet::new(),
                    preview: PreviewArbiter::default(),
                    clusters: ClusterEngine::new(),
                    pinned_direction: None,
                    timezone: None,
                }),
                surface: Mutex::new(surface),
                status: Mutex::new(Box::new(|message| log::info!("{message}"))),
                rebuild_queued: AtomicBool::new(false),
            }),
        }
    }

    /// Replace the status-line sink (defaults to `log::info!`).
    pub fn set_status_sink(&self, sink: Box<dyn FnMut(String) + Send>) {
        *self.inner.status.lock().unwrap() = sink;
    }

    /// Fetch the manifest and build the per-route session state.
    pub async fn load_manifest(&self) -> Result<(), FetchError> {
        let manifest = self.inner.client.load_manifest().await?;
        let mut state = self.inner.state.lock().unwrap();
        state.timezone = manifest.timezone.clone();
        state.agencies = group_agencies(&manifest);
        state.route_order = manifest.routes.iter().map(|r| r.key.clone()).collect();
        state.routes = manifest
            .routes
            .into_iter()
            .map(|meta| (meta.key.clone(), RouteState::new(meta)))
            .collect();
        Ok(())
    }

    pub fn timezone(&self) -> Option<String> {
        self.inner.state.lock().unwrap().timezone.clone()
    }

    pub fn route_count(&self) -> usize {
        self.inner.state.lock().unwrap().routes.len()
    }

    pub fn selected_route_keys(&self) -> Vec<RouteKey> {
        let state = self.inner.state.lock().unwrap();
        state
            .route_order
            .iter()
            .filter(|key| state.selected.contains(*key))
            .cloned()
            .collect()
    }

    pub fn is_selected(&self, key: &RouteKey) -> bool {
        self.inner.state.lock().unwrap().selected.contains(key)
    }

    /// Read access to one route's state.
    pub fn with_route<R>(&self, key: &RouteKey, f: impl FnOnce(&RouteState) -> R) -> Option<R> {
        let state = self.inner.state.lock().unwrap();
        state.routes.get(key).map(f)
    }

    pub fn with_agencies<R>(&self, f: impl FnOnce(&[AgencyState]) -> R) -> R {
        let state = self.inner.state.lock().unwrap();
        f(&state.agencies)
    }

    pub fn with_clusters<R>(&self, f: impl FnOnce(&[StopClusterView]) -> R) -> R {
        let state = self.inner.state.lock().unwrap();
        f(state.clusters.clusters())
    }

    /// Case-insensitive substring match over the manifest search text.
    pub fn search_routes(&self, query: &str) -> Vec<RouteKey> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }
        let state = self.inner.state.lock().unwrap();
        state
            .route_order
            .iter()
            .filter(|key| {
                state
                    .routes
                    .get(*key)
                    .map(|r| r.meta.search_text.contains(&needle))
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// Recompute the area filter. Returns the keys whose routes match the
    /// region (all keys when the region is cleared). Never aborts in-flight
    /// loads.
    pub fn apply_area_filter(&self, region: Option<Region>) -> Vec<RouteKey> {
        let mut state = self.inner.state.lock().unwrap();
        let mut matching = Vec::new();
        let order = state.route_order.clone();
        for key in &order {
            let Some(route) = state.routes.get_mut(key) else {
                continue;
            };
            let visible = match &region {
                None => true,
                Some(region) => {
                    route_matches_region(&route.meta, route.route_data.as_deref(), region)
                }
            };
            route.is_visible = visible;
            if visible {
                matching.push(key.clone());
            }
        }
        matching
    }

    /// Select or deselect one route. On a failed load the selection reverts,
    /// a status message names the route and error, and no retry is issued.
    pub async fn set_route_selection(
        &self,
        key: &RouteKey,
        selected: bool,
    ) -> Result<(), SelectionError> {
        let result = self.set_route_selection_inner(key, selected).await;
        self.queue_cluster_rebuild();
        result
    }

    /// Apply one transition to a batch of routes through a bounded worker
    /// pool. Per-item UI refresh is suppressed; one refresh runs at the end
    /// unless disabled.
    pub async fn set_route_keys_selected(
        &self,
        keys: Vec<RouteKey>,
        selected: bool,
        options: BatchOptions,
    ) -> BatchOutcome {
        if let Some(text) = &options.status_text {
            self.push_status(text.clone());
        }

        let concurrency = options.concurrency.max(1);
        let results: Vec<Result<(), SelectionError>> = futures::stream::iter(
            keys.iter()
                .map(|key| self.set_route_selection_inner(key, selected)),
        )
        .buffer_unordered(concurrency)
        .collect()
        .await;

        let failed = results.iter().filter(|r| r.is_err()).count();
        let outcome = BatchOutcome {
            applied: results.len() - failed,
            failed,
        };

        if options.refresh_ui_at_end {
            self.flush_clusters();
        }
        outcome
    }

    async fn set_route_selection_inner(
        &self,
        key: &RouteKey,
        selected: bool,
    ) -> Result<(), SelectionError> {
        if selected {
            self.select_route(key).await
        } else {
            self.deselect_route(key);
            Ok(())
        }
    }

    async fn select_route(&self, key: &RouteKey) -> Result<(), SelectionError> {
        {
            let mut state = self.inner.state.lock().unwrap();
            let route = state
                .routes
                .get_mut(key)
                .ok_or_else(|| SelectionError::UnknownRoute(key.clone()))?;
            if route.selected && route.route_data.is_some() {
                return Ok(());
            }
            route.selected = true;
            state.selected.insert(key.clone());
        }

        match self.ensure_route_data(key).await {
            Ok(data) => {
                let still_selected = {
                    let mut state = self.inner.state.lock().unwrap();
                    let route = state.routes.get_mut(key).expect("route exists");
                    let still = route.selected;
                    if still && route.layer.is_none() {
                        route.layer = Some(RouteLayer::build(
                            key.clone(),
                            route.meta.color.clone(),
                            &data,
                        ));
                    }
                    state.clusters.mark_dirty();
                    still
                };
                if still_selected {
                    self.apply_visibility();
                    self.spawn_schedule_prefetch(key);
                }
                Ok(())
            }
            Err(err) => {
                let label = {
                    let mut state = self.inner.state.lock().unwrap();
                    state.selected.remove(key);
                    let route = state.routes.get_mut(key).expect("route exists");
                    route.selected = false;
                    format!("{} {}", route.meta.agency_label, route.meta.short_name)
                };
                self.push_status(format!("Could not load route {label}: {err}"));
                Err(err)
            }
        }
    }

    fn deselect_route(&self, key: &RouteKey) {
        {
            let mut state = self.inner.state.lock().unwrap();
            let Some(route) = state.routes.get_mut(key) else {
                return;
            };
            if !route.selected && !state.selected.contains(key) {
                return;
            }
            route.selected = false;
            state.selected.remove(key);
            state.preview.clear_route(key);
            if state
                .pinned_direction
                .as_ref()
                .is_some_and(|(pinned, _)| pinned == key)
            {
                state.pinned_direction = None;
            }
            state.clusters.mark_dirty();
        }
        self.apply_visibility();
    }

    /// Single-flight geometry load: concurrent callers share one in-flight
    /// fetch; the slot clears on completion so a failure can be retried.
    async fn ensure_route_data(&self, key: &RouteKey) -> Result<Arc<RouteData>, SelectionError> {
        let shared = {
            let mut state = self.inner.state.lock().unwrap();
            let route = state
                .routes
                .get_mut(key)
                .ok_or_else(|| SelectionError::UnknownRoute(key.clone()))?;
            if let Some(data) = &route.route_data {
                return Ok(Arc::clone(data));
            }
            match &route.load_in_flight {
                Some(shared) => shared.clone(),
                None => {
                    let inner = Arc::clone(&self.inner);
                    let file = route.meta.file.clone();
                    let shared = async move {
                        inner.client.load_route_data(&file).await.map(Arc::new)
                    }
                    .boxed()
                    .shared();
                    route.load_in_flight = Some(shared.clone());
                    shared
                }
            }
        };

        let result = shared.await;

        {
            let mut state = self.inner.state.lock().unwrap();
            if let Some(route) = state.routes.get_mut(key) {
                route.load_in_flight = None;
                if let Ok(data) = &result {
                    if route.route_data.is_none() {
                        route.route_data = Some(Arc::clone(data));
                    }
                }
            }
        }

        result.map_err(SelectionError::Load)
    }

    /// Single-flight schedule load. `Ok(None)` means the route has no
    /// external schedule file; inline data may still cover it.
    pub async fn ensure_schedule_data(
        &self,
        key: &RouteKey,
    ) -> Result<Option<Arc<ScheduleData>>, SelectionError> {
        let shared = {
            let mut state = self.inner.state.lock().unwrap();
            let route = state
                .routes
                .get_mut(key)
                .ok_or_else(|| SelectionError::UnknownRoute(key.clone()))?;
            if let Some(data) = &route.schedule_data {
                return Ok(Some(Arc::clone(data)));
            }
            let Some(file) = route.schedule_file() else {
                return Ok(None);
            };
            match &route.schedule_in_flight {
                Some(shared) => shared.clone(),
                None => {
                    let inner = Arc::clone(&self.inner);
                    let shared = async move {
                        inner.client.load_schedule_data(&file).await.map(Arc::new)
                    }
                    .boxed()
                    .shared();
                    route.schedule_in_flight = Some(shared.clone());
                    shared
                }
            }
        };

        let result = shared.await;

        {
            let mut state = self.inner.state.lock().unwrap();
            if let Some(route) = state.routes.get_mut(key) {
                route.schedule_in_flight = None;
                if let Ok(data) = &result {
                    if route.schedule_data.is_none() {
                        route.schedule_data = Some(Arc::clone(data));
                    }
                }
            }
        }

        result.map(Some).map_err(SelectionError::Load)
    }

    /// Best-effort prefetch right after geometry arrives, so the first popup
    /// open usually finds schedules cached. Failures are only logged; the
    /// popup path retries on demand.
    fn spawn_schedule_prefetch(&self, key: &RouteKey) {
        let session = self.clone();
        let key = key.clone();
        tokio::spawn(async move {
            if let Err(err) = session.ensure_schedule_data(&key).await {
                log::warn!("schedule prefetch for {key} failed: {err}");
            }
        });
    }

    /// A hover session opened on a target referencing this route (popup
    /// open, sidebar hover). Multiple concurrent sessions per route count.
    pub fn begin_hover_preview(&self, key: &RouteKey) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.preview.begin(key);
        }
        self.apply_visibility();
    }

    pub fn end_hover_preview(&self, key: &RouteKey) {
        {
            let mut state = self.inner.state.lock().unwrap();
            let last = state.preview.end(key);
            if last
                && state
                    .pinned_direction
                    .as_ref()
                    .is_some_and(|(pinned, _)| pinned == key)
            {
                state.pinned_direction = None;
            }
        }
        self.apply_visibility();
    }

    /// Pin a direction for a route's preview (explicit switch in the popup,
    /// or implicit when a hovered stop serves one direction).
    pub fn pin_direction(&self, key: &RouteKey, direction: Option<String>) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.pinned_direction = direction.map(|d| (key.clone(), d));
        }
        self.apply_visibility();
    }

    /// Point a cluster's active-route marker at a different member route
    /// (route switch inside a popup).
    pub fn set_cluster_active_route(&self, cluster_index: usize, key: &RouteKey) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        match state.clusters.clusters_mut().get_mut(cluster_index) {
            Some(cluster) => cluster.set_active_route(key),
            None => false,
        }
    }

    /// The route currently winning preview arbitration, if any.
    pub fn preview_active_route(&self) -> Option<RouteKey> {
        let state = self.inner.state.lock().unwrap();
        state.preview.active_among(&state.selected)
    }

    /// Recompute layer attachment: a layer is attached iff its route is
    /// selected and either no route is preview-active or it is the
    /// preview-active one. Direction pins narrow the visible polylines of
    /// the preview-active layer.
    fn apply_visibility(&self) {
        let mut actions: Vec<SurfaceAction> = Vec::new();
        {
            let mut state = self.inner.state.lock().unwrap();
            let preview = state.preview.active_among(&state.selected);
            let pinned = state.pinned_direction.clone();
            let order = state.route_order.clone();
            for key in &order {
                let Some(route) = state.routes.get_mut(key) else {
                    continue;
                };
                let Some(layer) = route.layer.clone() else {
                    continue;
                };
                let desired = route.selected
                    && (preview.is_none() || preview.as_ref() == Some(key));
                if desired && !route.attached {
                    route.attached = true;
                    actions.push(SurfaceAction::Attach(layer.clone()));
                } else if !desired && route.attached {
                    route.attached = false;
                    actions.push(SurfaceAction::Detach(key.clone()));
                }
                if route.attached {
                    let direction = match (&preview, &pinned) {
                        (Some(active), Some((pin_key, dir)))
                            if active == key && pin_key == key =>
                        {
                            Some(dir.as_str())
                        }
                        _ => None,
                    };
                    actions.push(SurfaceAction::SetVisible(
                        key.clone(),
                        layer.visible_polylines(direction),
                    ));
                }
            }
        }
        self.apply_actions(actions);
    }

    fn apply_actions(&self, actions: Vec<SurfaceAction>) {
        if actions.is_empty() {
            return;
        }
        let mut surface = self.inner.surface.lock().unwrap();
        for action in actions {
            match action {
                SurfaceAction::Attach(layer) => surface.attach_route_layer(&layer),
                SurfaceAction::Detach(key) => surface.detach_route_layer(&key),
                SurfaceAction::SetVisible(key, visible) => {
                    surface.set_visible_polylines(&key, &visible)
                }
                SurfaceAction::Clusters(clusters) => surface.set_stop_clusters(&clusters),
            }
        }
    }

    /// Schedule one coalesced cluster rebuild: however many selection
    /// changes land before the next event-loop turn, a single rebuild runs.
    fn queue_cluster_rebuild(&self) {
        if self.inner.rebuild_queued.swap(true, Ordering::SeqCst) {
            return;
        }
        let session = self.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            session.inner.rebuild_queued.store(false, Ordering::SeqCst);
            session.flush_clusters();
        });
    }

    /// Rebuild clusters now if any selection change marked them dirty, and
    /// push the result to the map surface.
    pub fn flush_clusters(&self) {
        let clusters = {
            let mut state = self.inner.state.lock().unwrap();
            if !state.clusters.take_dirty() {
                return;
            }
            let inputs: Vec<ClusterRouteInput> = state
                .route_order
                .iter()
                .filter_map(|key| {
                    let route = state.routes.get(key)?;
                    if !route.selected {
                        return None;
                    }
                    let data = route.route_data.as_ref()?;
                    Some(ClusterRouteInput {
                        route_key: key.clone(),
                        color: route.meta.color.clone(),
                        data: Arc::clone(data),
                    })
                })
                .collect();
            state.clusters.rebuild(&inputs).to_vec()
        };
        self.apply_actions(vec![SurfaceAction::Clusters(clusters)]);
    }

    /// Re-derive hit-target radii for the current viewport.
    pub fn recompute_hit_radii(&self, projection: &dyn Projection) {
        let clusters = {
            let mut state = self.inner.state.lock().unwrap();
            crate::cluster::recompute_hit_radii(state.clusters.clusters_mut(), projection);
            state.clusters.clusters().to_vec()
        };
        self.apply_actions(vec![SurfaceAction::Clusters(clusters)]);
    }

    fn push_status(&self, message: String) {
        let mut status = self.inner.status.lock().unwrap();
        (*status)(message);
    }

    #[cfg(test)]
    fn assert_selection_consistent(&self) {
        let state = self.inner.state.lock().unwrap();
        for (key, route) in &state.routes {
            assert_eq!(
                route.selected,
                state.selected.contains(key),
                "selection flag and set disagree for {key}"
            );
        }
    }
}

fn group_agencies(manifest: &Manifest) -> Vec<AgencyState> {
    manifest
        .agencies
        .iter()
        .map(|agency| AgencyState {
            agency: agency.clone(),
            route_keys: manifest
                .routes
                .iter()
                .filter(|r| r.agency_id == agency.id)
                .map(|r| r.key.clone())
                .collect(),
        })
        .collect()
}
