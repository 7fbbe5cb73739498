//! Event mutations and sync tokens committing together

use calsync_core::ics::{encode, extract_metadata};
use calsync_core::{CalendarRepo, Database, Error, Event, EventRepo};
use chrono::{TimeZone, Utc};
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn document(uid: &str, summary: &str, dtstart: &str) -> String {
    let raw = format!(
        "BEGIN:VCALENDAR\nVERSION:2.0\nPRODID:-//calsync//tests//EN\nBEGIN:VEVENT\nUID:{}\nSUMMARY:{}\nDTSTART:{}\nDURATION:PT1H\nEND:VEVENT\nEND:VCALENDAR\n",
        uid, summary, dtstart
    );
    encode(raw.as_bytes()).unwrap()
}

fn to_event(calendar_id: i64, uid: &str, ics: String) -> Event {
    let metadata = extract_metadata(&ics).unwrap();
    Event::from_document(calendar_id, uid, ics, metadata).unwrap()
}

fn sync_token(db: &Database, calendar_id: i64) -> String {
    db.with_conn(|conn| CalendarRepo::new(conn).get_by_id(calendar_id))
        .unwrap()
        .sync_token
}

#[test]
fn test_token_advances_on_every_successful_mutation() {
    let db = Database::open_in_memory().unwrap();
    let (_, calendar) = db.bootstrap("alice").unwrap();
    let cancel = CancellationToken::new();
    assert_eq!(sync_token(&db, calendar.id), "");

    let mut event = to_event(calendar.id, "e1", document("e1", "One", "20260116T100000Z"));
    let created = db
        .apply_event_change(calendar.id, &cancel, |events| events.create(&mut event))
        .unwrap();
    assert_ne!(created.sync_token, "");
    assert_eq!(sync_token(&db, calendar.id), created.sync_token);

    let expected = event.fingerprint.clone();
    let mut updated_event = to_event(calendar.id, "e1", document("e1", "Two", "20260116T100000Z"));
    let updated = db
        .apply_event_change(calendar.id, &cancel, |events| {
            events.update(&mut updated_event, &expected)
        })
        .unwrap();
    assert_ne!(updated.sync_token, created.sync_token);

    let deleted = db
        .apply_event_change(calendar.id, &cancel, |events| events.delete(calendar.id, "e1"))
        .unwrap();
    assert_ne!(deleted.sync_token, updated.sync_token);
    assert_eq!(sync_token(&db, calendar.id), deleted.sync_token);
}

#[test]
fn test_token_unchanged_on_failed_mutation() {
    let db = Database::open_in_memory().unwrap();
    let (_, calendar) = db.bootstrap("alice").unwrap();
    let cancel = CancellationToken::new();

    let mut event = to_event(calendar.id, "e1", document("e1", "One", "20260116T100000Z"));
    db.apply_event_change(calendar.id, &cancel, |events| events.create(&mut event))
        .unwrap();
    let before = sync_token(&db, calendar.id);

    let mut stale = to_event(calendar.id, "e1", document("e1", "Stale", "20260116T100000Z"));
    let result = db.apply_event_change(calendar.id, &cancel, |events| {
        events.update(&mut stale, "\"not-the-fingerprint\"")
    });
    assert!(matches!(result, Err(Error::PreconditionFailed(_))));

    let mut duplicate = to_event(calendar.id, "e1", document("e1", "Dup", "20260116T100000Z"));
    let result = db.apply_event_change(calendar.id, &cancel, |events| events.create(&mut duplicate));
    assert!(matches!(result, Err(Error::Conflict(_))));

    let result = db.apply_event_change(calendar.id, &cancel, |events| events.delete(calendar.id, "nope"));
    assert!(matches!(result, Err(Error::NotFound(_))));

    assert_eq!(sync_token(&db, calendar.id), before);
    let stored = db
        .with_conn(|conn| EventRepo::new(conn).get_by_uid(calendar.id, "e1"))
        .unwrap();
    assert_eq!(stored.summary, "One");
}

#[test]
fn test_stored_document_round_trips_byte_identical() {
    let dir = TempDir::new().unwrap();
    let ics = document("round-trip", "Exact bytes, kept", "20260116T100000Z");
    let calendar_id = {
        let db = Database::open(dir.path()).unwrap();
        let (_, calendar) = db.bootstrap("alice").unwrap();
        let mut event = to_event(calendar.id, "round-trip", ics.clone());
        db.apply_event_change(calendar.id, &CancellationToken::new(), |events| {
            events.create(&mut event)
        })
        .unwrap();
        calendar.id
    };

    let db = Database::open(dir.path()).unwrap();
    let stored = db
        .with_conn(|conn| EventRepo::new(conn).get_by_uid(calendar_id, "round-trip"))
        .unwrap();
    assert_eq!(stored.ics.as_bytes(), ics.as_bytes());
    assert_eq!(stored.fingerprint, calsync_core::fingerprint(ics.as_bytes()));
}

#[test]
fn test_derived_columns_follow_the_document() {
    let db = Database::open_in_memory().unwrap();
    let (_, calendar) = db.bootstrap("alice").unwrap();
    let cancel = CancellationToken::new();

    let mut event = to_event(calendar.id, "e1", document("e1", "Standup", "20260116T090000Z"));
    db.apply_event_change(calendar.id, &cancel, |events| events.create(&mut event))
        .unwrap();

    let mut moved = to_event(calendar.id, "e1", document("e1", "Retro", "20260120T150000Z"));
    db.apply_event_change(calendar.id, &cancel, |events| {
        events.update(&mut moved, &event.fingerprint)
    })
    .unwrap();

    let stored = db
        .with_conn(|conn| EventRepo::new(conn).get_by_uid(calendar.id, "e1"))
        .unwrap();
    assert_eq!(stored.summary, "Retro");
    assert_eq!(stored.start_time, Utc.with_ymd_and_hms(2026, 1, 20, 15, 0, 0).unwrap());
    assert_eq!(stored.end_time, Some(Utc.with_ymd_and_hms(2026, 1, 20, 16, 0, 0).unwrap()));
}

#[test]
fn test_concurrent_updates_with_same_fingerprint_one_wins() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(Database::open(dir.path()).unwrap());
    let (_, calendar) = db.bootstrap("alice").unwrap();

    let mut event = to_event(calendar.id, "race", document("race", "Original", "20260116T100000Z"));
    db.apply_event_change(calendar.id, &CancellationToken::new(), |events| {
        events.create(&mut event)
    })
    .unwrap();
    let token_before = sync_token(&db, calendar.id);

    let writers = 2;
    let barrier = Arc::new(Barrier::new(writers));
    let handles: Vec<_> = (0..writers)
        .map(|i| {
            let db = db.clone();
            let barrier = barrier.clone();
            let expected = event.fingerprint.clone();
            let calendar_id = calendar.id;
            thread::spawn(move || {
                let summary = format!("Writer {}", i);
                let mut mine = to_event(calendar_id, "race", document("race", &summary, "20260116T100000Z"));
                barrier.wait();
                db.apply_event_change(calendar_id, &CancellationToken::new(), |events| {
                    events.update(&mut mine, &expected)
                })
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners = results.iter().filter(|r| r.is_ok()).count();
    let losers = results
        .iter()
        .filter(|r| matches!(r, Err(Error::PreconditionFailed(_))))
        .count();
    assert_eq!(winners, 1);
    assert_eq!(losers, 1);

    let winner_token = results
        .iter()
        .find_map(|r| r.as_ref().ok())
        .map(|applied| applied.sync_token.clone())
        .unwrap();
    assert_ne!(winner_token, token_before);
    assert_eq!(sync_token(&db, calendar.id), winner_token);
}
