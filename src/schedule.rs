use crate::models::{RouteData, ScheduleData};
use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use itertools::Itertools;

/// GTFS day keys in week order, matching the dataset build.
pub const DAY_KEYS: [&str; 7] = [
    "monday",
    "tuesday",
    "wednesday",
    "thursday",
    "friday",
    "saturday",
    "sunday",
];

pub fn day_key_for(weekday: Weekday) -> &'static str {
    DAY_KEYS[weekday.num_days_from_monday() as usize]
}

/// Parse "HH:MM:SS" into seconds since service midnight. Hours may exceed 24
/// for next-day overflow trips; minutes and seconds must stay in range.
pub fn parse_gtfs_time(value: &str) -> Option<u32> {
    let (h, m, s) = value.split(':').collect_tuple()?;
    let hours: u32 = h.parse().ok()?;
    let minutes: u32 = m.parse().ok()?;
    let seconds: u32 = s.parse().ok()?;
    if minutes > 59 || seconds > 59 {
        return None;
    }
    Some(hours * 3600 + minutes * 60 + seconds)
}

/// Render a GTFS time as a 12-hour clock string. Times past midnight get a
/// day marker: "25:05:00" becomes "1:05 AM (+1)".
pub fn format_clock_time(value: &str) -> Option<String> {
    let total = parse_gtfs_time(value)?;
    let days_over = total / 86_400;
    let in_day = total % 86_400;
    let hours = in_day / 3600;
    let minutes = (in_day % 3600) / 60;

    let meridiem = if hours < 12 { "AM" } else { "PM" };
    let clock_hour = match hours % 12 {
        0 => 12,
        h => h,
    };

    let mut out = format!("{clock_hour}:{minutes:02} {meridiem}");
    if days_over > 0 {
        out.push_str(&format!(" (+{days_over})"));
    }
    Some(out)
}

/// Departure times for one stop, direction and day.
///
/// External schedule data is authoritative whenever it covers the
/// stop+direction. Otherwise the inline per-service schedule is joined
/// against the route's active services for that day. `None` means the
/// dataset has no schedule information at all for this slot, which renders
/// as an explicit empty state rather than an error.
pub fn resolve_day_schedule(
    route_data: &RouteData,
    schedule_data: Option<&ScheduleData>,
    stop_id: &str,
    direction_key: &str,
    day_key: &str,
) -> Option<Vec<String>> {
    if let Some(external) = schedule_data {
        if let Some(by_direction) = external.day_schedules_by_stop_by_direction.get(stop_id) {
            if let Some(by_day) = by_direction.get(direction_key) {
                return Some(by_day.get(day_key).cloned().unwrap_or_default());
            }
        }
    }

    let stop = route_data.stops.iter().find(|s| s.stop_id == stop_id)?;
    let by_service = stop
        .service_schedule_by_direction
        .as_ref()?
        .get(direction_key)?;
    let active = route_data
        .active_services_by_day_by_direction
        .as_ref()?
        .get(direction_key)?
        .get(day_key)?;

    let mut merged: Vec<String> = active
        .iter()
        .filter_map(|service_id| by_service.get(service_id))
        .flatten()
        .cloned()
        .collect();
    merged.sort_by_key(|t| parse_gtfs_time(t).unwrap_or(u32::MAX));
    merged.dedup();
    Some(merged)
}

/// The next departure found at or after a given local day + time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NextArrival {
    pub day_key: String,
    pub time: String,
}

impl NextArrival {
    /// Stable identity used by popup rendering, e.g. `monday:08:15:00`.
    pub fn token(&self) -> String {
        format!("{}:{}", self.day_key, self.time)
    }

    pub fn formatted_time(&self) -> String {
        format_clock_time(&self.time).unwrap_or_else(|| self.time.clone())
    }
}

/// Search forward from (`from_day_key`, `from_seconds`) for the next
/// departure, scanning today's remaining times then wrapping through the
/// following week days. Uses whatever day lists `lookup` produces (resolved
/// via [`resolve_day_schedule`]).
pub fn find_next_arrival<F>(from_day_key: &str, from_seconds: u32, lookup: F) -> Option<NextArrival>
where
    F: Fn(&str) -> Option<Vec<String>>,
{
    let start = DAY_KEYS.iter().position(|d| *d == from_day_key)?;

    for offset in 0..DAY_KEYS.len() {
        let day_key = DAY_KEYS[(start + offset) % DAY_KEYS.len()];
        let Some(times) = lookup(day_key) else {
            continue;
        };
        let threshold = if offset == 0 { from_seconds } else { 0 };
        let next = times
            .iter()
            .filter_map(|t| parse_gtfs_time(t).map(|secs| (secs, t)))
            .filter(|(secs, _)| *secs >= threshold)
            .min_by_key(|(secs, _)| *secs);
        if let Some((_, time)) = next {
            return Some(NextArrival {
                day_key: day_key.to_string(),
                time: time.clone(),
            });
        }
    }
    None
}

/// Local day key and seconds since midnight for a UTC instant in the
/// dataset's timezone.
pub fn local_day_and_seconds(instant: DateTime<Utc>, tz: Tz) -> (&'static str, u32) {
    let local = instant.with_timezone(&tz);
    (day_key_for(local.weekday()), local.num_seconds_from_midnight())
}

/// Human-facing label for a direction key, preferring dataset-provided
/// labels and degrading to a generic one the way the build pipeline does.
pub fn display_direction_label(
    route_data: &RouteData,
    schedule_data: Option<&ScheduleData>,
    direction_key: &str,
) -> String {
    if let Some(label) = schedule_data
        .and_then(|s| s.direction_labels.as_ref())
        .and_then(|labels| labels.get(direction_key))
    {
        return label.clone();
    }
    if let Some(label) = route_data.direction_label(direction_key) {
        return label.to_string();
    }
    match direction_key.strip_prefix("dir_") {
        Some(id) if id != "default" => format!("Direction {id}"),
        _ => "Direction".to_string(),
    }
}
