//! End-to-end synchronization backend scenarios against an on-disk database

use calsync_core::{Database, Error};
use calsync_dav::{CalendarBackend, EntityTag, Preconditions, RequestContext, TimeRange};
use chrono::{TimeZone, Utc};
use std::sync::Arc;
use tempfile::TempDir;

const E1_PATH: &str = "/dav/calendars/alice/default/e1.ics";
const CALENDAR_PATH: &str = "/dav/calendars/alice/default/";

fn event(uid: &str, summary: &str, start: &str, end: &str) -> String {
    format!(
        "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:-//calsync//tests//EN\r\nBEGIN:VEVENT\r\nUID:{}\r\nSUMMARY:{}\r\nDTSTART:{}\r\nDTEND:{}\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n",
        uid, summary, start, end
    )
}

fn setup() -> (TempDir, CalendarBackend, RequestContext) {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(Database::open(dir.path()).unwrap());
    let (user, _) = db.bootstrap("alice").unwrap();
    (dir, CalendarBackend::new(db, "/dav"), RequestContext::new(user))
}

fn token(backend: &CalendarBackend, ctx: &RequestContext) -> String {
    backend.get_calendar(ctx, CALENDAR_PATH).unwrap().sync_token
}

fn if_match(tag: &str) -> Preconditions {
    Preconditions {
        if_match: Some(EntityTag::Tags(vec![tag.to_string()])),
        if_none_match: None,
    }
}

#[test]
fn test_create_update_conflict_delete() {
    let (_dir, backend, ctx) = setup();

    let v1 = event("e1", "Standup", "20260116T100000Z", "20260116T110000Z");
    let created = backend
        .put_object(&ctx, E1_PATH, v1.as_bytes(), &Preconditions::default())
        .unwrap();
    assert!(created.created);
    let f1 = created.object.fingerprint.clone();
    let t1 = created.sync_token.clone();
    assert_ne!(t1, "");

    let v2 = event("e1", "Standup (moved)", "20260116T113000Z", "20260116T120000Z");
    let updated = backend
        .put_object(&ctx, E1_PATH, v2.as_bytes(), &if_match(&f1))
        .unwrap();
    assert!(!updated.created);
    let f2 = updated.object.fingerprint.clone();
    let t2 = updated.sync_token.clone();
    assert_ne!(f2, f1);
    assert_ne!(t2, t1);

    let v3 = event("e1", "Lost update", "20260116T140000Z", "20260116T150000Z");
    let stale = backend.put_object(&ctx, E1_PATH, v3.as_bytes(), &if_match("\"wrong\""));
    assert!(matches!(stale, Err(Error::PreconditionFailed(_))));

    let current = backend.get_object(&ctx, E1_PATH).unwrap();
    assert_eq!(current.fingerprint, f2);
    assert_eq!(current.data, v2);
    assert_eq!(token(&backend, &ctx), t2);

    let t3 = backend.delete_object(&ctx, E1_PATH).unwrap();
    assert_ne!(t3, t2);
    assert_eq!(token(&backend, &ctx), t3);

    assert!(matches!(
        backend.get_object(&ctx, E1_PATH),
        Err(Error::NotFound(_))
    ));
}

#[test]
fn test_if_none_match_star_guards_creation() {
    let (_dir, backend, ctx) = setup();
    let doc = event("e1", "Once", "20260116T100000Z", "20260116T110000Z");
    let create_only = Preconditions {
        if_match: None,
        if_none_match: Some(EntityTag::Any),
    };

    backend
        .put_object(&ctx, E1_PATH, doc.as_bytes(), &create_only)
        .unwrap();
    let before = token(&backend, &ctx);

    let again = backend.put_object(&ctx, E1_PATH, doc.as_bytes(), &create_only);
    assert!(matches!(again, Err(Error::PreconditionFailed(_))));
    assert_eq!(token(&backend, &ctx), before);
}

#[test]
fn test_if_match_on_missing_object_fails() {
    let (_dir, backend, ctx) = setup();
    let doc = event("e1", "Ghost", "20260116T100000Z", "20260116T110000Z");

    let result = backend.put_object(&ctx, E1_PATH, doc.as_bytes(), &if_match("\"anything\""));
    assert!(matches!(result, Err(Error::PreconditionFailed(_))));
    assert_eq!(token(&backend, &ctx), "");

    let wildcard = Preconditions {
        if_match: Some(EntityTag::Any),
        if_none_match: None,
    };
    let result = backend.put_object(&ctx, E1_PATH, doc.as_bytes(), &wildcard);
    assert!(matches!(result, Err(Error::PreconditionFailed(_))));
}

#[test]
fn test_if_match_wildcard_updates_existing() {
    let (_dir, backend, ctx) = setup();
    let v1 = event("e1", "First", "20260116T100000Z", "20260116T110000Z");
    backend
        .put_object(&ctx, E1_PATH, v1.as_bytes(), &Preconditions::default())
        .unwrap();

    let v2 = event("e1", "Second", "20260116T100000Z", "20260116T110000Z");
    let wildcard = Preconditions {
        if_match: Some(EntityTag::Any),
        if_none_match: None,
    };
    let updated = backend
        .put_object(&ctx, E1_PATH, v2.as_bytes(), &wildcard)
        .unwrap();
    assert!(!updated.created);
    assert_eq!(backend.get_object(&ctx, E1_PATH).unwrap().data, v2);
}

#[test]
fn test_delete_missing_leaves_token_alone() {
    let (_dir, backend, ctx) = setup();
    let result = backend.delete_object(&ctx, E1_PATH);
    assert!(matches!(result, Err(Error::NotFound(_))));
    assert_eq!(token(&backend, &ctx), "");
}

#[test]
fn test_query_window_is_half_open() {
    let (_dir, backend, ctx) = setup();
    let doc = event("e1", "Hour", "20260116T100000Z", "20260116T110000Z");
    backend
        .put_object(&ctx, E1_PATH, doc.as_bytes(), &Preconditions::default())
        .unwrap();

    let at = |h: u32, m: u32| Utc.with_ymd_and_hms(2026, 1, 16, h, m, 0).unwrap();

    let later = backend
        .query_objects(
            &ctx,
            CALENDAR_PATH,
            Some(TimeRange {
                start: at(11, 0),
                end: at(12, 0),
            }),
        )
        .unwrap();
    assert!(later.is_empty());

    let overlapping = backend
        .query_objects(
            &ctx,
            CALENDAR_PATH,
            Some(TimeRange {
                start: at(10, 30),
                end: at(12, 0),
            }),
        )
        .unwrap();
    assert_eq!(overlapping.len(), 1);
    assert_eq!(overlapping[0].uid, "e1");

    assert_eq!(backend.list_objects(&ctx, CALENDAR_PATH).unwrap().len(), 1);
}

#[test]
fn test_state_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let doc = event("e1", "Durable", "20260116T100000Z", "20260116T110000Z");
    let (fingerprint, sync_token) = {
        let db = Arc::new(Database::open(dir.path()).unwrap());
        let (user, _) = db.bootstrap("alice").unwrap();
        let backend = CalendarBackend::new(db, "/dav");
        let outcome = backend
            .put_object(
                &RequestContext::new(user),
                E1_PATH,
                doc.as_bytes(),
                &Preconditions::default(),
            )
            .unwrap();
        (outcome.object.fingerprint, outcome.sync_token)
    };

    let db = Arc::new(Database::open(dir.path()).unwrap());
    let (user, _) = db.bootstrap("alice").unwrap();
    let backend = CalendarBackend::new(db, "/dav");
    let ctx = RequestContext::new(user);
    let object = backend.get_object(&ctx, E1_PATH).unwrap();
    assert_eq!(object.fingerprint, fingerprint);
    assert_eq!(object.data, doc);
    assert_eq!(token(&backend, &ctx), sync_token);
}

#[test]
fn test_cancelled_request_writes_nothing() {
    let (_dir, backend, ctx) = setup();
    ctx.cancel.cancel();
    let doc = event("e1", "Abandoned", "20260116T100000Z", "20260116T110000Z");

    let result = backend.put_object(&ctx, E1_PATH, doc.as_bytes(), &Preconditions::default());
    assert!(matches!(result, Err(Error::Internal(_))));

    let fresh = RequestContext::new(ctx.user.clone());
    assert!(matches!(
        backend.get_object(&fresh, E1_PATH),
        Err(Error::NotFound(_))
    ));
    assert_eq!(token(&backend, &fresh), "");
}
