//! Calendar events (iCalendar VEVENT resources)
//!
//! Hybrid storage: the full document is kept verbatim for protocol
//! round-trips, and a handful of derived columns are kept alongside it for
//! range queries. The document is the source of truth; derived columns are
//! always recomputed from it on every write.

use crate::error::{Error, Result};
use crate::fingerprint::fingerprint;
use crate::ics::EventMetadata;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// iCalendar STATUS of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventStatus {
    Tentative,
    #[default]
    Confirmed,
    Cancelled,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Tentative => "TENTATIVE",
            EventStatus::Confirmed => "CONFIRMED",
            EventStatus::Cancelled => "CANCELLED",
        }
    }

    /// Lenient parse; anything unrecognised is `Confirmed`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "TENTATIVE" => EventStatus::Tentative,
            "CANCELLED" => EventStatus::Cancelled,
            _ => EventStatus::Confirmed,
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub id: i64,
    pub calendar_id: i64,
    /// iCalendar UID, unique within the calendar
    pub uid: String,
    /// Full iCalendar document, stored as-is
    pub ics: String,
    pub summary: String,
    pub description: String,
    pub location: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub all_day: bool,
    /// RRULE value if recurring; never expanded
    pub recurrence_rule: Option<String>,
    /// SHA-256 fingerprint of `ics`
    pub fingerprint: String,
    pub sequence: i64,
    pub status: EventStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Event {
    /// Build an unsaved event from a canonical document and the metadata
    /// extracted from it. Fails with `Validation` when the document carries
    /// no usable start time.
    pub fn from_document(
        calendar_id: i64,
        uid: impl Into<String>,
        ics: String,
        metadata: EventMetadata,
    ) -> Result<Self> {
        let uid = uid.into();
        let start_time = metadata.start.ok_or_else(|| {
            Error::Validation(format!("event {} has no parseable DTSTART", uid))
        })?;
        let fingerprint = fingerprint(ics.as_bytes());
        Ok(Self {
            id: 0,
            calendar_id,
            uid,
            ics,
            summary: metadata.summary,
            description: metadata.description,
            location: metadata.location,
            start_time,
            end_time: metadata.end,
            all_day: metadata.all_day,
            recurrence_rule: metadata.recurrence_rule,
            fingerprint,
            sequence: metadata.sequence,
            status: metadata.status,
            created_at: DateTime::<Utc>::default(),
            updated_at: DateTime::<Utc>::default(),
        })
    }

    /// Check the invariants every stored event must satisfy.
    pub fn validate(&self) -> Result<()> {
        if self.uid.is_empty() {
            return Err(Error::Validation("event UID is required".into()));
        }
        if self.ics.is_empty() {
            return Err(Error::Validation("event iCalendar data is required".into()));
        }
        if let Some(end) = self.end_time {
            if end < self.start_time {
                return Err(Error::Validation(format!(
                    "event {} ends ({}) before it starts ({})",
                    self.uid, end, self.start_time
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn event(start: DateTime<Utc>, end: Option<DateTime<Utc>>) -> Event {
        let metadata = EventMetadata {
            uid: Some("test-uid".into()),
            start: Some(start),
            end,
            ..Default::default()
        };
        Event::from_document(1, "test-uid", "BEGIN:VEVENT...".into(), metadata).unwrap()
    }

    #[test]
    fn test_validate_accepts_valid_event() {
        let start = Utc.with_ymd_and_hms(2026, 1, 16, 9, 0, 0).unwrap();
        assert!(event(start, Some(start + Duration::hours(1))).validate().is_ok());
        assert!(event(start, Some(start)).validate().is_ok());
        assert!(event(start, None).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_end_before_start() {
        let start = Utc.with_ymd_and_hms(2026, 1, 16, 9, 0, 0).unwrap();
        let err = event(start, Some(start - Duration::hours(1))).validate();
        assert!(matches!(err, Err(Error::Validation(_))));
    }

    #[test]
    fn test_validate_rejects_missing_uid_or_document() {
        let start = Utc.with_ymd_and_hms(2026, 1, 16, 9, 0, 0).unwrap();
        let mut e = event(start, None);
        e.uid.clear();
        assert!(matches!(e.validate(), Err(Error::Validation(_))));

        let mut e = event(start, None);
        e.ics.clear();
        assert!(matches!(e.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_from_document_requires_start() {
        let err = Event::from_document(1, "no-start", "BEGIN:VEVENT...".into(), EventMetadata::default());
        assert!(matches!(err, Err(Error::Validation(_))));
    }

    #[test]
    fn test_from_document_fingerprints_raw_document() {
        let start = Utc.with_ymd_and_hms(2026, 1, 16, 9, 0, 0).unwrap();
        let e = event(start, None);
        assert_eq!(e.fingerprint, fingerprint(b"BEGIN:VEVENT..."));
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(EventStatus::parse("TENTATIVE"), EventStatus::Tentative);
        assert_eq!(EventStatus::parse("cancelled"), EventStatus::Cancelled);
        assert_eq!(EventStatus::parse("CONFIRMED"), EventStatus::Confirmed);
        assert_eq!(EventStatus::parse("X-UNKNOWN"), EventStatus::Confirmed);
    }

    #[test]
    fn test_serializes_status_as_ical_keyword() {
        let start = Utc.with_ymd_and_hms(2026, 1, 16, 9, 0, 0).unwrap();
        let mut e = event(start, None);
        e.status = EventStatus::Tentative;
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["status"], "TENTATIVE");
        assert_eq!(json["uid"], "test-uid");
        assert!(json["end_time"].is_null());
    }
}
