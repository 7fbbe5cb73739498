//! iCalendar handling: canonical encoding of inbound documents and
//! extraction of the queryable metadata stored next to them.
//!
//! Parsing is delegated to the `icalendar` crate's tolerant parser. Only
//! the first VEVENT in document order is inspected; extraction never fails
//! on a malformed value, it leaves the corresponding field absent instead.

use crate::error::{Error, Result};
use crate::event::EventStatus;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Offset, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;
use icalendar::parser::{read_calendar, unfold, Component, Property};

/// Fields derived from the primary VEVENT of a document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventMetadata {
    pub uid: Option<String>,
    pub summary: String,
    pub description: String,
    pub location: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub all_day: bool,
    pub recurrence_rule: Option<String>,
    pub sequence: i64,
    pub status: EventStatus,
}

/// Produce the canonical stored form of an inbound document.
///
/// The body must be UTF-8, hold exactly one `BEGIN:VCALENDAR`/`END:VCALENDAR`
/// object and be accepted by the parser. Line endings are normalised to CRLF
/// and the result ends with exactly one CRLF.
pub fn encode(body: &[u8]) -> Result<String> {
    let text = std::str::from_utf8(body)
        .map_err(|e| Error::BadRequest(format!("iCalendar data is not UTF-8: {}", e)))?;
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);

    let mut lines: Vec<&str> = text
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .collect();
    while lines.last().is_some_and(|line| line.trim().is_empty()) {
        lines.pop();
    }

    let calendars = lines
        .iter()
        .filter(|line| line.trim().eq_ignore_ascii_case("BEGIN:VCALENDAR"))
        .count();
    let framed = calendars == 1
        && matches!(
            (lines.first(), lines.last()),
            (Some(first), Some(last))
                if first.trim().eq_ignore_ascii_case("BEGIN:VCALENDAR")
                    && last.trim().eq_ignore_ascii_case("END:VCALENDAR")
        );
    if !framed {
        return Err(Error::BadRequest(
            "iCalendar data must be a single VCALENDAR object".into(),
        ));
    }

    let mut canonical = lines.join("\r\n");
    canonical.push_str("\r\n");

    let unfolded = unfold(&canonical);
    read_calendar(&unfolded)
        .map_err(|e| Error::BadRequest(format!("invalid iCalendar data: {}", e)))?;

    Ok(canonical)
}

/// Extract metadata from the first VEVENT of `ics`.
///
/// A document without any VEVENT yields default metadata (no start), which
/// the event model rejects.
pub fn extract_metadata(ics: &str) -> Result<EventMetadata> {
    let unfolded = unfold(ics);
    let calendar = read_calendar(&unfolded)
        .map_err(|e| Error::BadRequest(format!("invalid iCalendar data: {}", e)))?;

    let Some(vevent) = first_vevent(&calendar.components) else {
        return Ok(EventMetadata::default());
    };

    let text = |name: &str| {
        vevent
            .find_prop(name)
            .map(|p| p.val.to_string())
            .unwrap_or_default()
    };

    let mut metadata = EventMetadata {
        uid: vevent
            .find_prop("UID")
            .map(|p| p.val.as_ref().trim().to_string())
            .filter(|uid| !uid.is_empty()),
        summary: text("SUMMARY"),
        description: text("DESCRIPTION"),
        location: text("LOCATION"),
        recurrence_rule: vevent
            .find_prop("RRULE")
            .map(|p| p.val.to_string())
            .filter(|rule| !rule.is_empty()),
        sequence: vevent
            .find_prop("SEQUENCE")
            .and_then(|p| p.val.as_ref().trim().parse().ok())
            .unwrap_or(0),
        status: vevent
            .find_prop("STATUS")
            .map(|p| EventStatus::parse(p.val.as_ref()))
            .unwrap_or_default(),
        ..Default::default()
    };

    if let Some((start, date_only)) = vevent.find_prop("DTSTART").and_then(parse_time_property) {
        metadata.start = Some(start);
        metadata.all_day = date_only || has_param(vevent.find_prop("DTSTART"), "VALUE", "DATE");
    }

    if let Some(dtend) = vevent.find_prop("DTEND") {
        metadata.end = parse_time_property(dtend).map(|(end, _)| end);
    } else if let Some(duration) = vevent.find_prop("DURATION") {
        metadata.end = match (metadata.start, parse_duration(duration.val.as_ref())) {
            (Some(start), Some(delta)) => start.checked_add_signed(delta),
            _ => None,
        };
    }

    Ok(metadata)
}

/// Parse a timestamp in one of the accepted layouts, interpreting values
/// without a zone designator as UTC. Returns the instant and whether the
/// value was date-only.
pub fn parse_utc_timestamp(value: &str) -> Option<(DateTime<Utc>, bool)> {
    parse_naive(value).map(|(naive, date_only)| (naive.and_utc(), date_only))
}

fn parse_naive(value: &str) -> Option<(NaiveDateTime, bool)> {
    const DATE_TIME_LAYOUTS: [&str; 4] = [
        "%Y%m%dT%H%M%SZ",
        "%Y%m%dT%H%M%S",
        "%Y-%m-%dT%H:%M:%SZ",
        "%Y-%m-%dT%H:%M:%S",
    ];
    let value = value.trim();

    // Layout order matters: basic forms before extended forms, date-time
    // before date for each.
    let try_datetime = |layout: &str| NaiveDateTime::parse_from_str(value, layout).ok();
    let try_date = |layout: &str| {
        NaiveDate::parse_from_str(value, layout)
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
    };

    if let Some(dt) = try_datetime(DATE_TIME_LAYOUTS[0]).or_else(|| try_datetime(DATE_TIME_LAYOUTS[1])) {
        return Some((dt, false));
    }
    if let Some(dt) = try_date("%Y%m%d") {
        return Some((dt, true));
    }
    if let Some(dt) = try_datetime(DATE_TIME_LAYOUTS[2]).or_else(|| try_datetime(DATE_TIME_LAYOUTS[3])) {
        return Some((dt, false));
    }
    try_date("%Y-%m-%d").map(|dt| (dt, true))
}

fn parse_time_property(prop: &Property) -> Option<(DateTime<Utc>, bool)> {
    let (naive, date_only) = parse_naive(prop.val.as_ref())?;
    let parsed = naive.and_utc();

    let zoned = param(prop, "TZID")
        .and_then(|tzid| tzid.trim_matches('"').parse::<Tz>().ok())
        .and_then(|tz| resolve_local(tz, naive));

    Some((zoned.unwrap_or(parsed), date_only))
}

/// Resolve a wall-clock time in `tz`. Ambiguous times take the earlier
/// instant; times skipped by a forward transition are read with the offset
/// in effect before the transition.
fn resolve_local(tz: Tz, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    if let Some(dt) = tz.from_local_datetime(&naive).earliest() {
        return Some(dt.with_timezone(&Utc));
    }
    let day_before = naive.checked_sub_signed(TimeDelta::days(1))?;
    let offset = tz.from_local_datetime(&day_before).earliest()?.offset().fix();
    naive
        .checked_sub_signed(TimeDelta::seconds(i64::from(offset.local_minus_utc())))
        .map(|utc| utc.and_utc())
}

/// Parse a DURATION of the form `P[T][nH][nM][nS]`.
pub fn parse_duration(value: &str) -> Option<TimeDelta> {
    let rest = value.trim().strip_prefix('P')?;
    let mut rest = rest.strip_prefix('T').unwrap_or(rest);

    let mut seconds: i64 = 0;
    let mut matched = false;
    for (unit, scale) in [('H', 3600i64), ('M', 60), ('S', 1)] {
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        if digits > 0 && rest[digits..].starts_with(unit) {
            let n: i64 = rest[..digits].parse().ok()?;
            seconds = seconds.checked_add(n.checked_mul(scale)?)?;
            rest = &rest[digits + 1..];
            matched = true;
        }
    }

    if !matched || !rest.is_empty() {
        return None;
    }
    TimeDelta::try_seconds(seconds)
}

fn first_vevent<'a, 'c>(components: &'c [Component<'a>]) -> Option<&'c Component<'a>> {
    components.iter().find_map(|c| {
        if c.name == "VEVENT" {
            Some(c)
        } else {
            first_vevent(&c.components)
        }
    })
}

fn param(prop: &Property, key: &str) -> Option<String> {
    prop.params
        .iter()
        .find(|p| p.key == key)
        .and_then(|p| p.val.as_ref().map(|v| v.to_string()))
}

fn has_param(prop: Option<&Property>, key: &str, value: &str) -> bool {
    prop.and_then(|p| param(p, key))
        .is_some_and(|v| v.eq_ignore_ascii_case(value))
}
