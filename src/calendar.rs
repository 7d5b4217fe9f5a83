use chrono::{DateTime, Duration, Local, NaiveDate, NaiveDateTime, TimeZone};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::envelope::{ActionError, Dispatch, finish_dispatch, unknown_action};
use crate::exec::{ExecOptions, ExecOutcome, backend_failure, run_command};

pub(crate) const CALENDAR_ACTIONS: &[&str] = &[
    "health",
    "list_calendars",
    "list_events",
    "search",
    "get_event",
    "create_event",
    "update_event",
    "delete_event",
];

const OSASCRIPT_BIN: &str = "osascript";

/// One calendar event in the adapter's normalized shape. Timestamps are
/// ISO-8601 strings on the wire; parsing happens where comparison is needed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct EventRecord {
    pub(crate) id: String,
    #[serde(default)]
    pub(crate) calendar: String,
    #[serde(default)]
    pub(crate) title: String,
    pub(crate) start: String,
    pub(crate) end: String,
    #[serde(default)]
    pub(crate) all_day: bool,
    #[serde(default)]
    pub(crate) location: Option<String>,
    #[serde(default)]
    pub(crate) notes: Option<String>,
    #[serde(default)]
    pub(crate) url: Option<String>,
}

// ── Payloads ─────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ListEventsPayload {
    calendar: Option<String>,
    calendars: Vec<String>,
    start: Option<String>,
    end: Option<String>,
    query: Option<String>,
    /// Extend the query match to event notes as well.
    include_notes: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetEventPayload {
    id: String,
    #[serde(default)]
    calendar: Option<String>,
    #[serde(default)]
    calendars: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct CreateEventPayload {
    calendar: Option<String>,
    title: Option<String>,
    start: Option<String>,
    end: Option<String>,
    all_day: bool,
    location: Option<String>,
    notes: Option<String>,
    url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct UpdateEventPayload {
    id: Option<String>,
    calendar: Option<String>,
    calendars: Vec<String>,
    title: Option<String>,
    start: Option<String>,
    end: Option<String>,
    all_day: Option<bool>,
    location: Option<String>,
    notes: Option<String>,
    url: Option<String>,
}

fn parse_payload<T: DeserializeOwned>(payload: &serde_json::Value) -> Result<T, ActionError> {
    let value = if payload.is_null() {
        serde_json::json!({})
    } else {
        payload.clone()
    };
    serde_json::from_value(value).map_err(|e| ActionError::validation(format!("payload: {e}")))
}

// ── Time handling ────────────────────────────────────────────────────────

/// Accepts a bare `YYYY-MM-DD` (midnight local time) or an ISO-8601
/// timestamp, with or without an offset.
pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Local>, String> {
    let trimmed = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        let midnight = date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| format!("invalid date '{trimmed}'"))?;
        return local_from_naive(midnight);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Local));
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, format) {
            return local_from_naive(dt);
        }
    }
    Err(format!(
        "unrecognized timestamp '{trimmed}' (expected YYYY-MM-DD or ISO-8601)"
    ))
}

fn local_from_naive(dt: NaiveDateTime) -> Result<DateTime<Local>, String> {
    Local
        .from_local_datetime(&dt)
        .earliest()
        .ok_or_else(|| format!("time '{dt}' does not exist in the local timezone"))
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct DateRange {
    pub(crate) start: DateTime<Local>,
    pub(crate) end: DateTime<Local>,
}

/// `start` defaults to now, `end` to start + 7 days; `end` must be strictly
/// after `start`.
pub(crate) fn resolve_range(
    start: Option<&str>,
    end: Option<&str>,
) -> Result<DateRange, ActionError> {
    let start = match start {
        Some(raw) => parse_timestamp(raw).map_err(ActionError::validation)?,
        None => Local::now(),
    };
    let end = match end {
        Some(raw) => parse_timestamp(raw).map_err(ActionError::validation)?,
        None => start + Duration::days(7),
    };
    if end <= start {
        return Err(ActionError::validation("'end' must be after 'start'"));
    }
    Ok(DateRange { start, end })
}

/// Event start/end for a write: `end` defaults to start + 1 hour for timed
/// events and start + 24 hours for all-day events.
pub(crate) fn resolve_event_times(
    start_raw: &str,
    end_raw: Option<&str>,
    all_day: bool,
) -> Result<(DateTime<Local>, DateTime<Local>), ActionError> {
    let start = parse_timestamp(start_raw).map_err(ActionError::validation)?;
    let end = match end_raw {
        Some(raw) => parse_timestamp(raw).map_err(ActionError::validation)?,
        None => {
            start
                + if all_day {
                    Duration::hours(24)
                } else {
                    Duration::hours(1)
                }
        }
    };
    if end <= start {
        return Err(ActionError::validation("'end' must be after 'start'"));
    }
    Ok((start, end))
}

/// Half-open interval overlap: an event belongs to the range iff it is still
/// running when the range begins and has started before the range ends.
fn overlaps(event_start: DateTime<Local>, event_end: DateTime<Local>, range: &DateRange) -> bool {
    event_start < range.end && event_end > range.start
}

fn matches_query(event: &EventRecord, needle_lower: &str, include_notes: bool) -> bool {
    if event.title.to_lowercase().contains(needle_lower) {
        return true;
    }
    if let Some(location) = &event.location {
        if location.to_lowercase().contains(needle_lower) {
            return true;
        }
    }
    if include_notes {
        if let Some(notes) = &event.notes {
            if notes.to_lowercase().contains(needle_lower) {
                return true;
            }
        }
    }
    false
}

/// Apply the range filter, the optional query, and the result ordering
/// (ascending start, ties broken by title). Events whose timestamps fail to
/// parse are dropped with a warning rather than failing the listing.
pub(crate) fn filter_and_sort(
    records: Vec<EventRecord>,
    range: &DateRange,
    query: Option<&str>,
    include_notes: bool,
) -> Vec<EventRecord> {
    let needle = query.map(|q| q.to_lowercase());
    let mut keyed: Vec<(DateTime<Local>, EventRecord)> = Vec::new();
    for record in records {
        let (start, end) = match (parse_timestamp(&record.start), parse_timestamp(&record.end)) {
            (Ok(start), Ok(end)) => (start, end),
            _ => {
                eprintln!("[calendar] skipping event '{}' with unparsable times", record.id);
                continue;
            }
        };
        if !overlaps(start, end, range) {
            continue;
        }
        if let Some(needle) = &needle {
            if !matches_query(&record, needle, include_notes) {
                continue;
            }
        }
        keyed.push((start, record));
    }
    keyed.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.title.cmp(&b.1.title)));
    keyed.into_iter().map(|(_, record)| record).collect()
}

/// Explicit `calendars` wins over the singular `calendar`; empty means "all"
/// for reads.
fn selected_calendars(calendar: &Option<String>, calendars: &[String]) -> Vec<String> {
    if !calendars.is_empty() {
        return calendars.to_vec();
    }
    calendar.clone().map(|c| vec![c]).unwrap_or_default()
}

// ── Scripts ──────────────────────────────────────────────────────────────
// The backend is the OS calendar automation layer, driven through
// `osascript -l JavaScript` so results come back as JSON on stdout. Every
// user-supplied string is embedded as a JSON literal, never spliced raw.

fn js_str(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

fn js_opt_str(value: &Option<String>) -> String {
    match value {
        Some(text) => js_str(text),
        None => "null".to_string(),
    }
}

fn list_calendars_script() -> String {
    r#"(() => {
  const app = Application("Calendar");
  const out = app.calendars().map(cal => {
    let writable = true;
    try { writable = !!cal.writable(); } catch (e) {}
    let description = null;
    try { description = cal.description() || null; } catch (e) {}
    return { name: cal.name(), description: description, writable: writable };
  });
  return JSON.stringify(out);
})()"#
        .to_string()
}

fn event_json_fragment() -> &'static str {
    r#"{
        id: ev.uid(),
        calendar: cal.name(),
        title: ev.summary() || "",
        start: ev.startDate().toISOString(),
        end: ev.endDate().toISOString(),
        allDay: !!ev.alldayEvent(),
        location: ev.location() || null,
        notes: ev.description() || null,
        url: ev.url() ? String(ev.url()) : null
      }"#
}

fn list_events_script(calendars: &[String], range: &DateRange) -> String {
    let names = serde_json::to_string(calendars).unwrap_or_else(|_| "[]".to_string());
    let start_ms = range.start.timestamp_millis();
    let end_ms = range.end.timestamp_millis();
    format!(
        r#"(() => {{
  const app = Application("Calendar");
  const names = {names};
  const lo = new Date({start_ms});
  const hi = new Date({end_ms});
  const out = [];
  for (const cal of app.calendars()) {{
    if (names.length > 0 && !names.includes(cal.name())) continue;
    const events = cal.events.whose({{ startDate: {{ _lessThan: hi }}, endDate: {{ _greaterThan: lo }} }})();
    for (const ev of events) {{
      out.push({fragment});
    }}
  }}
  return JSON.stringify(out);
}})()"#,
        fragment = event_json_fragment()
    )
}

fn get_event_script(id: &str, calendars: &[String]) -> String {
    let names = serde_json::to_string(calendars).unwrap_or_else(|_| "[]".to_string());
    let uid = js_str(id);
    format!(
        r#"(() => {{
  const app = Application("Calendar");
  const names = {names};
  const uid = {uid};
  for (const cal of app.calendars()) {{
    if (names.length > 0 && !names.includes(cal.name())) continue;
    const matches = cal.events.whose({{ uid: {{ _equals: uid }} }})();
    if (matches.length > 0) {{
      const ev = matches[0];
      return JSON.stringify({fragment});
    }}
  }}
  return JSON.stringify(null);
}})()"#,
        fragment = event_json_fragment()
    )
}

fn create_event_script(
    calendar: Option<&str>,
    title: &str,
    start: DateTime<Local>,
    end: DateTime<Local>,
    all_day: bool,
    location: &Option<String>,
    notes: &Option<String>,
    url: &Option<String>,
) -> String {
    let wanted = match calendar {
        Some(name) => js_str(name),
        None => "null".to_string(),
    };
    format!(
        r#"(() => {{
  const app = Application("Calendar");
  const wanted = {wanted};
  let target = null;
  for (const cal of app.calendars()) {{
    if (wanted !== null) {{
      if (cal.name() === wanted) {{ target = cal; break; }}
      continue;
    }}
    let writable = true;
    try {{ writable = !!cal.writable(); }} catch (e) {{}}
    if (writable) {{ target = cal; break; }}
  }}
  if (!target) {{
    return JSON.stringify({{ error: wanted !== null ? "calendar not found: " + wanted : "no writable calendar" }});
  }}
  const cal = target;
  const ev = app.Event({{
    summary: {title},
    startDate: new Date({start_ms}),
    endDate: new Date({end_ms}),
    alldayEvent: {all_day},
    location: {location},
    description: {notes},
    url: {url}
  }});
  cal.events.push(ev);
  return JSON.stringify({fragment});
}})()"#,
        title = js_str(title),
        start_ms = start.timestamp_millis(),
        end_ms = end.timestamp_millis(),
        location = js_opt_str(location),
        notes = js_opt_str(notes),
        url = js_opt_str(url),
        fragment = event_json_fragment()
    )
}

fn update_event_script(id: &str, merged: &MergedEvent) -> String {
    let uid = js_str(id);
    format!(
        r#"(() => {{
  const app = Application("Calendar");
  const uid = {uid};
  for (const cal of app.calendars()) {{
    const matches = cal.events.whose({{ uid: {{ _equals: uid }} }})();
    if (matches.length > 0) {{
      const ev = matches[0];
      ev.summary = {title};
      ev.startDate = new Date({start_ms});
      ev.endDate = new Date({end_ms});
      ev.alldayEvent = {all_day};
      if ({location} !== null) ev.location = {location};
      if ({notes} !== null) ev.description = {notes};
      if ({url} !== null) ev.url = {url};
      return JSON.stringify({fragment});
    }}
  }}
  return JSON.stringify(null);
}})()"#,
        title = js_str(&merged.title),
        start_ms = merged.start.timestamp_millis(),
        end_ms = merged.end.timestamp_millis(),
        all_day = merged.all_day,
        location = js_opt_str(&merged.location),
        notes = js_opt_str(&merged.notes),
        url = js_opt_str(&merged.url),
        fragment = event_json_fragment()
    )
}

fn delete_event_script(id: &str) -> String {
    let uid = js_str(id);
    format!(
        r#"(() => {{
  const app = Application("Calendar");
  const uid = {uid};
  for (const cal of app.calendars()) {{
    const matches = cal.events.whose({{ uid: {{ _equals: uid }} }})();
    if (matches.length > 0) {{
      app.delete(matches[0]);
      return JSON.stringify({{ deleted: true }});
    }}
  }}
  return JSON.stringify(null);
}})()"#
    )
}

// ── Execution ────────────────────────────────────────────────────────────

fn run_script(
    script: &str,
    timeout_ms: u64,
) -> Result<(ExecOutcome, serde_json::Value), ActionError> {
    let args = vec![
        "-l".to_string(),
        "JavaScript".to_string(),
        "-e".to_string(),
        script.to_string(),
    ];
    let opts = ExecOptions {
        timeout_ms,
        ..Default::default()
    };
    let outcome = run_command(OSASCRIPT_BIN, &args, &opts)
        .map_err(|e| ActionError::backend(e, serde_json::json!({ "transport": true })))?;
    if !outcome.success() {
        return Err(backend_failure(OSASCRIPT_BIN, &outcome));
    }
    let parsed: serde_json::Value =
        serde_json::from_str(outcome.stdout.trim()).map_err(|e| {
            ActionError::backend(
                format!("calendar automation returned unparsable output: {e}"),
                serde_json::json!({ "raw": outcome.stdout }),
            )
        })?;
    if let Some(error) = parsed.get("error").and_then(|v| v.as_str()) {
        let message = error.to_string();
        if message.starts_with("calendar not found") {
            return Err(ActionError::validation(message));
        }
        return Err(ActionError::backend(message, outcome.meta_json()));
    }
    Ok((outcome, parsed))
}

fn fetch_event(
    id: &str,
    calendars: &[String],
    timeout_ms: u64,
) -> Result<(ExecOutcome, EventRecord), ActionError> {
    let (outcome, parsed) = run_script(&get_event_script(id, calendars), timeout_ms)?;
    if parsed.is_null() {
        return Err(ActionError::validation(format!("event not found: {id}")));
    }
    let record: EventRecord = serde_json::from_value(parsed).map_err(|e| {
        ActionError::backend(
            format!("calendar automation returned a malformed event: {e}"),
            serde_json::Value::Null,
        )
    })?;
    Ok((outcome, record))
}

// ── Router ───────────────────────────────────────────────────────────────

pub(crate) fn dispatch(
    action: &str,
    payload: &serde_json::Value,
    settings: &Settings,
    timeout_override: Option<u64>,
) -> Dispatch {
    let result = route(action, payload, settings, timeout_override);
    finish_dispatch("calendar", action, result)
}

fn route(
    action: &str,
    payload: &serde_json::Value,
    settings: &Settings,
    timeout_override: Option<u64>,
) -> Result<serde_json::Value, ActionError> {
    let timeout_ms = settings.calendar_timeout_ms(timeout_override);
    match action {
        "health" | "list_calendars" => {
            let (outcome, parsed) = run_script(&list_calendars_script(), timeout_ms)?;
            let calendars = parsed.as_array().cloned().unwrap_or_default();
            if action == "health" && calendars.is_empty() {
                return Err(ActionError::backend(
                    "calendar backend returned no calendars",
                    outcome.meta_json(),
                ));
            }
            let count = calendars.len();
            Ok(serde_json::json!({
                "calendars": calendars,
                "count": count,
                "exec": outcome.meta_json(),
            }))
        }
        "list_events" | "search" => {
            let parsed: ListEventsPayload = parse_payload(payload)?;
            if action == "search"
                && parsed.query.as_deref().map(str::trim).unwrap_or("").is_empty()
            {
                return Err(ActionError::validation("search requires 'query'"));
            }
            list_events(&parsed, timeout_ms)
        }
        "get_event" => {
            let parsed: GetEventPayload = parse_payload(payload)?;
            let calendars = selected_calendars(&parsed.calendar, &parsed.calendars);
            let (outcome, record) = fetch_event(&parsed.id, &calendars, timeout_ms)?;
            Ok(serde_json::json!({
                "event": record,
                "exec": outcome.meta_json(),
            }))
        }
        "create_event" => {
            let parsed: CreateEventPayload = parse_payload(payload)?;
            create_event(&parsed, settings, timeout_ms)
        }
        "update_event" => {
            let parsed: UpdateEventPayload = parse_payload(payload)?;
            update_event(&parsed, timeout_ms)
        }
        "delete_event" => {
            let parsed: GetEventPayload = parse_payload(payload)?;
            let calendars = selected_calendars(&parsed.calendar, &parsed.calendars);
            // Look the event up first so the response can echo what is gone.
            let (_, record) = fetch_event(&parsed.id, &calendars, timeout_ms)?;
            let (outcome, result) = run_script(&delete_event_script(&parsed.id), timeout_ms)?;
            if result.is_null() {
                return Err(ActionError::backend(
                    format!("event vanished before delete: {}", parsed.id),
                    outcome.meta_json(),
                ));
            }
            Ok(serde_json::json!({
                "deleted": true,
                "event": record,
                "exec": outcome.meta_json(),
            }))
        }
        other => Err(unknown_action(other, CALENDAR_ACTIONS)),
    }
}

fn list_events(
    payload: &ListEventsPayload,
    timeout_ms: u64,
) -> Result<serde_json::Value, ActionError> {
    let range = resolve_range(payload.start.as_deref(), payload.end.as_deref())?;
    let calendars = selected_calendars(&payload.calendar, &payload.calendars);
    let (outcome, parsed) = run_script(&list_events_script(&calendars, &range), timeout_ms)?;
    let records: Vec<EventRecord> = serde_json::from_value(parsed).map_err(|e| {
        ActionError::backend(
            format!("calendar automation returned malformed events: {e}"),
            serde_json::Value::Null,
        )
    })?;
    let events = filter_and_sort(
        records,
        &range,
        payload.query.as_deref(),
        payload.include_notes,
    );
    let count = events.len();
    Ok(serde_json::json!({
        "events": events,
        "count": count,
        "range": {
            "start": range.start.to_rfc3339(),
            "end": range.end.to_rfc3339(),
        },
        "exec": outcome.meta_json(),
    }))
}

fn create_event(
    payload: &CreateEventPayload,
    settings: &Settings,
    timeout_ms: u64,
) -> Result<serde_json::Value, ActionError> {
    let title = payload
        .title
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| ActionError::validation("create_event requires 'title'"))?;
    let start_raw = payload
        .start
        .as_deref()
        .ok_or_else(|| ActionError::validation("create_event requires 'start'"))?;
    let (start, end) = resolve_event_times(start_raw, payload.end.as_deref(), payload.all_day)?;

    // Explicit calendar, else the configured default, else the first
    // writable calendar (resolved inside the script).
    let calendar = payload
        .calendar
        .clone()
        .or_else(|| settings.calendar.default_calendar.clone());

    let script = create_event_script(
        calendar.as_deref(),
        title,
        start,
        end,
        payload.all_day,
        &payload.location,
        &payload.notes,
        &payload.url,
    );
    let (outcome, created) = run_script(&script, timeout_ms)?;
    Ok(serde_json::json!({
        "event": created,
        "exec": outcome.meta_json(),
    }))
}

/// The post-merge view of an event: payload fields layered over the stored
/// record, revalidated as a whole.
#[derive(Debug)]
struct MergedEvent {
    title: String,
    start: DateTime<Local>,
    end: DateTime<Local>,
    all_day: bool,
    location: Option<String>,
    notes: Option<String>,
    url: Option<String>,
}

fn merge_event(
    existing: &EventRecord,
    payload: &UpdateEventPayload,
) -> Result<MergedEvent, ActionError> {
    let all_day = payload.all_day.unwrap_or(existing.all_day);
    let start_raw = payload.start.clone().unwrap_or_else(|| existing.start.clone());
    let start = parse_timestamp(&start_raw).map_err(ActionError::validation)?;
    let end = match &payload.end {
        Some(raw) => parse_timestamp(raw).map_err(ActionError::validation)?,
        None => parse_timestamp(&existing.end).map_err(|e| {
            ActionError::backend(format!("stored event has unparsable end: {e}"), serde_json::Value::Null)
        })?,
    };
    if end <= start {
        return Err(ActionError::validation(
            "'end' must be after 'start' after applying the update",
        ));
    }
    Ok(MergedEvent {
        title: payload.title.clone().unwrap_or_else(|| existing.title.clone()),
        start,
        end,
        all_day,
        location: payload.location.clone().or_else(|| existing.location.clone()),
        notes: payload.notes.clone().or_else(|| existing.notes.clone()),
        url: payload.url.clone().or_else(|| existing.url.clone()),
    })
}

fn update_event(
    payload: &UpdateEventPayload,
    timeout_ms: u64,
) -> Result<serde_json::Value, ActionError> {
    let id = payload
        .id
        .as_deref()
        .filter(|i| !i.trim().is_empty())
        .ok_or_else(|| ActionError::validation("update_event requires 'id'"))?;
    let calendars = selected_calendars(&payload.calendar, &payload.calendars);
    let (_, existing) = fetch_event(id, &calendars, timeout_ms)?;
    let merged = merge_event(&existing, payload)?;
    let (outcome, updated) = run_script(&update_event_script(id, &merged), timeout_ms)?;
    if updated.is_null() {
        return Err(ActionError::backend(
            format!("event vanished before update: {id}"),
            outcome.meta_json(),
        ));
    }
    Ok(serde_json::json!({
        "event": updated,
        "exec": outcome.meta_json(),
    }))
}

// ── Tests ────────────────────────────────────────────────────────────────
