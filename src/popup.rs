use crate::models::{RouteData, RouteKey, ScheduleData};
use crate::schedule::{
    display_direction_label, find_next_arrival, format_clock_time, resolve_day_schedule,
};
use std::time::Duration;

/// How long the popup stays up after the pointer has left both the marker
/// and the popup body.
pub const DEFAULT_CLOSE_DELAY: Duration = Duration::from_millis(450);

#[derive(Clone, Copy, Debug)]
pub struct PopupOptions {
    pub close_delay: Duration,
    /// Whether the input device supports hover. Touch-only devices open on
    /// tap and never schedule hover-driven closes.
    pub hover_capable: bool,
}

impl Default for PopupOptions {
    fn default() -> Self {
        PopupOptions {
            close_delay: DEFAULT_CLOSE_DELAY,
            hover_capable: true,
        }
    }
}

/// One page of popup content: a route/direction variant of the target.
#[derive(Clone, Debug, PartialEq)]
pub struct PopupPanel {
    pub route_key: RouteKey,
    pub direction_key: Option<String>,
    pub heading: String,
    pub lines: Vec<String>,
}

/// Typed popup view-model produced by a content factory. Rendering to
/// markup (or a framework tree) is the embedder's separate step.
#[derive(Clone, Debug, PartialEq)]
pub struct PopupContent {
    pub title: String,
    pub panels: Vec<PopupPanel>,
    pub active_panel: usize,
}

/// Visible/hidden and ARIA state for one panel, derived from the active
/// index so renderers never scrape it back out of the DOM.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PanelFlags {
    pub visible: bool,
    pub aria_hidden: bool,
    pub aria_selected: bool,
}

impl PopupContent {
    pub fn panel_flags(&self) -> Vec<PanelFlags> {
        (0..self.panels.len())
            .map(|idx| {
                let active = idx == self.active_panel;
                PanelFlags {
                    visible: active,
                    aria_hidden: !active,
                    aria_selected: active,
                }
            })
            .collect()
    }

    pub fn active(&self) -> Option<&PopupPanel> {
        self.panels.get(self.active_panel)
    }
}

/// Everything the content builder needs for one cluster member.
pub struct PanelSource<'a> {
    pub route_key: RouteKey,
    pub route_label: String,
    pub stop_id: String,
    pub route_data: &'a RouteData,
    pub schedule_data: Option<&'a ScheduleData>,
}

impl PanelSource<'_> {
    /// Directions this panel splits into: the external schedule's coverage
    /// when present, the stop's inline directions otherwise.
    fn direction_keys(&self) -> Vec<String> {
        let external = self
            .schedule_data
            .and_then(|s| s.day_schedules_by_stop_by_direction.get(&self.stop_id))
            .map(|by_direction| {
                let mut keys: Vec<String> = by_direction.keys().cloned().collect();
                keys.sort();
                keys
            })
            .filter(|keys| !keys.is_empty());
        external.unwrap_or_else(|| self.route_data.stop_direction_keys(&self.stop_id))
    }
}

/// Build the typed popup view-model for a merged stop cluster: one panel per
/// (route, direction) variant, in member order. Members with no schedule
/// information at all still get a panel with an explicit empty state.
pub fn build_stop_popup_content(
    title: impl Into<String>,
    sources: &[PanelSource<'_>],
    day_key: &str,
    seconds_since_midnight: u32,
) -> PopupContent {
    let mut panels = Vec::new();
    for source in sources {
        let directions = source.direction_keys();
        if directions.is_empty() {
            panels.push(PopupPanel {
                route_key: source.route_key.clone(),
                direction_key: None,
                heading: source.route_label.clone(),
                lines: vec!["No schedule available".to_string()],
            });
            continue;
        }
        for direction in directions {
            let heading = format!(
                "{} · {}",
                source.route_label,
                display_direction_label(source.route_data, source.schedule_data, &direction)
            );

            let mut lines = Vec::new();
            let next = find_next_arrival(day_key, seconds_since_midnight, |day| {
                resolve_day_schedule(
                    source.route_data,
                    source.schedule_data,
                    &source.stop_id,
                    &direction,
                    day,
                )
            });
            lines.push(match next {
                Some(next) => format!("Next departure: {}", next.formatted_time()),
                None => "No upcoming departures".to_string(),
            });

            match resolve_day_schedule(
                source.route_data,
                source.schedule_data,
                &source.stop_id,
                &direction,
                day_key,
            ) {
                Some(times) if !times.is_empty() => {
                    let rendered: Vec<String> = times
                        .iter()
                        .filter_map(|t| format_clock_time(t))
                        .collect();
                    lines.push(format!("Today: {}", rendered.join(", ")));
                }
                Some(_) => lines.push("No departures today".to_string()),
                None => lines.push("No schedule available".to_string()),
            }

            panels.push(PopupPanel {
                route_key: source.route_key.clone(),
                direction_key: Some(direction),
                heading,
                lines,
            });
        }
    }
    PopupContent {
        title: title.into(),
        panels,
        active_panel: 0,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PopupState {
    Idle,
    Loading,
    Open,
    /// Open with the close timer pending.
    Closing,
}

/// Inputs to the machine. Pointer and timer events come from the embedder;
/// `ContentReady` is delivered when the async content factory resolves.
#[derive(Clone, Debug)]
pub enum PopupEvent {
    PointerEnterTarget,
    PointerLeaveTarget,
    PointerEnterPopup,
    PointerLeavePopup,
    Click,
    ContentReady {
        token: u64,
        content: Result<PopupContent, String>,
    },
    CloseTimerFired,
    /// Programmatic close (route deselected, session teardown). Converges
    /// on the same cleanup as a timer close.
    CloseRequested,
    /// Direction/route switch controls: advance the active panel by `step`
    /// with wraparound (`-1` for the previous arrow key).
    CyclePanel { step: i32 },
}

/// Ordered instructions for the embedder. Tokens on `RequestContent` must
/// round-trip into the matching `ContentReady`.
#[derive(Clone, Debug, PartialEq)]
pub enum PopupEffect {
    ShowLoading,
    RequestContent { token: u64 },
    ShowContent(Box<PopupContent>),
    /// Fixed "unable to load" placeholder after a factory failure.
    ShowFallback,
    ScheduleClose { delay: Duration },
    CancelClose,
    Close,
    /// Hover-session boundaries, decoupled from individual open/close
    /// cycles: one session spans first open through final close.
    HoverSessionStarted,
    HoverSessionEnded,
    /// The user flipped to a different route/direction panel.
    ActivePanelChanged {
        panel: usize,
        route_key: RouteKey,
        direction_key: Option<String>,
    },
}

/// Per-target popup state machine: idle -> loading -> open -> closing, with
/// a monotonic token guarding async content application.
pub struct PopupController {
    options: PopupOptions,
    state: PopupState,
    token: u64,
    over_target: bool,
    over_popup: bool,
    content: Option<PopupContent>,
}

impl PopupController {
    pub fn new(options: PopupOptions) -> Self {
        PopupController {
            options,
            state: PopupState::Idle,
            token: 0,
            over_target: false,
            over_popup: false,
            content: None,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(
            self.state,
            PopupState::Loading | PopupState::Open | PopupState::Closing
        )
    }

    pub fn content(&self) -> Option<&PopupContent> {
        self.content.as_ref()
    }

    pub fn handle(&mut self, event: PopupEvent) -> Vec<PopupEffect> {
        let mut effects = Vec::new();
        match event {
            PopupEvent::PointerEnterTarget => {
                self.over_target = true;
                if self.options.hover_capable {
                    self.pointer_arrived(&mut effects);
                }
            }
            PopupEvent::PointerEnterPopup => {
                self.over_popup = true;
                self.cancel_pending_close(&mut effects);
            }
            PopupEvent::PointerLeaveTarget => {
                self.over_target = false;
                self.maybe_schedule_close(&mut effects);
            }
            PopupEvent::PointerLeavePopup => {
                self.over_popup = false;
                self.maybe_schedule_close(&mut effects);
            }
            PopupEvent::Click => {
                self.open_or_refresh(&mut effects);
            }
            PopupEvent::ContentReady { token, content } => {
                self.apply_content(token, content, &mut effects);
            }
            PopupEvent::CloseTimerFired => {
                if self.state == PopupState::Closing {
                    self.close(&mut effects, false);
                }
            }
            PopupEvent::CloseRequested => {
                if self.is_open() {
                    self.close(&mut effects, true);
                }
            }
            PopupEvent::CyclePanel { step } => {
                self.cycle_panel(step, &mut effects);
            }
        }
        effects
    }

    fn pointer_arrived(&mut self, effects: &mut Vec<PopupEffect>) {
        match self.state {
            PopupState::Idle => self.open_or_refresh(effects),
            PopupState::Closing => self.cancel_pending_close(effects),
            PopupState::Loading | PopupState::Open => {}
        }
    }

    /// Every open request takes a fresh token; any still-pending older
    /// content request becomes stale the moment this runs.
    fn open_or_refresh(&mut self, effects: &mut Vec<PopupEffect>) {
        let was_idle = self.state == PopupState::Idle;
        if self.state == PopupState::Closing {
            self.cancel_pending_close(effects);
        }
        self.token += 1;
        self.state = PopupState::Loading;
        if was_idle {
            effects.push(PopupEffect::HoverSessionStarted);
        }
        effects.push(PopupEffect::ShowLoading);
        effects.push(PopupEffect::RequestContent { token: self.token });
    }

    fn apply_content(
        &mut self,
        token: u64,
        content: Result<PopupContent, String>,
        effects: &mut Vec<PopupEffect>,
    ) {
        // Superseded by a newer open, or the popup closed first: drop it
        // silently. The fetch behind it still warmed the caches.
        if token != self.token || !self.is_open() {
            return;
        }

        match content {
            Ok(content) => {
                self.content = Some(content.clone());
                if self.state == PopupState::Loading {
                    self.state = PopupState::Open;
                }
                effects.push(PopupEffect::ShowContent(Box::new(content)));
            }
            Err(message) => {
                log::warn!("popup content failed: {message}");
                if self.state == PopupState::Loading {
                    self.state = PopupState::Open;
                }
                effects.push(PopupEffect::ShowFallback);
            }
        }

        // The pointer may have already moved on while content loaded.
        self.maybe_schedule_close(effects);
    }

    fn maybe_schedule_close(&mut self, effects: &mut Vec<PopupEffect>) {
        if !self.options.hover_capable {
            return;
        }
        if self.over_target || self.over_popup {
            return;
        }
        if matches!(self.state, PopupState::Open | PopupState::Loading) {
            self.state = PopupState::Closing;
            effects.push(PopupEffect::ScheduleClose {
                delay: self.options.close_delay,
            });
        }
    }

    fn cancel_pending_close(&mut self, effects: &mut Vec<PopupEffect>) {
        if self.state == PopupState::Closing {
            self.state = PopupState::Open;
            effects.push(PopupEffect::CancelClose);
        }
    }

    fn close(&mut self, effects: &mut Vec<PopupEffect>, cancel_timer: bool) {
        if cancel_timer && self.state == PopupState::Closing {
            effects.push(PopupEffect::CancelClose);
        }
        self.state = PopupState::Idle;
        self.content = None;
        effects.push(PopupEffect::Close);
        effects.push(PopupEffect::HoverSessionEnded);
    }

    fn cycle_panel(&mut self, step: i32, effects: &mut Vec<PopupEffect>) {
        if !self.is_open() {
            return;
        }
        let Some(content) = self.content.as_mut() else {
            return;
        };
        let count = content.panels.len();
        if count < 2 {
            return;
        }
        let next = (content.active_panel as i64 + step as i64).rem_euclid(count as i64) as usize;
        content.active_panel = next;
        let panel = &content.panels[next];
        effects.push(PopupEffect::ActivePanelChanged {
            panel: next,
            route_key: panel.route_key.clone(),
            direction_key: panel.direction_key.clone(),
        });
    }
}
