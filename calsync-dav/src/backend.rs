//! Synchronization backend
//!
//! Turns resource-level reads and writes into conflict-checked, versioned
//! storage operations. Every call carries the authenticated identity in a
//! [`RequestContext`]; there is no ambient current user. All methods block
//! on the database and are meant to run on a blocking worker.

use crate::path::ResourcePath;
use calsync_core::ics::{self, EventMetadata};
use calsync_core::{
    Calendar, CalendarRepo, Database, Error, Event, EventRepo, Result, User, UserRepo,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Authenticated identity and cancellation signal for one request
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub user: User,
    pub cancel: CancellationToken,
}

impl RequestContext {
    pub fn new(user: User) -> Self {
        Self {
            user,
            cancel: CancellationToken::new(),
        }
    }
}

/// Value of an `If-Match` / `If-None-Match` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityTag {
    /// `*`
    Any,
    /// Comma-separated list of quoted tags, as written by the client
    Tags(Vec<String>),
}

impl EntityTag {
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value == "*" {
            return Some(EntityTag::Any);
        }

        let mut tags = Vec::new();
        let mut quoted = false;
        let mut start = 0;
        for (i, c) in value.char_indices() {
            match c {
                '"' => quoted = !quoted,
                ',' if !quoted => {
                    tags.push(&value[start..i]);
                    start = i + 1;
                }
                _ => {}
            }
        }
        tags.push(&value[start..]);

        let tags: Vec<String> = tags
            .into_iter()
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .map(str::to_string)
            .collect();
        (!tags.is_empty()).then_some(EntityTag::Tags(tags))
    }
}

/// Conditional-request headers of a write
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preconditions {
    pub if_match: Option<EntityTag>,
    pub if_none_match: Option<EntityTag>,
}

/// Inclusive start, exclusive end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// A stored calendar object as seen by the protocol layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarObject {
    pub path: String,
    pub uid: String,
    pub data: String,
    pub fingerprint: String,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOutcome {
    pub object: CalendarObject,
    /// True when the write created the object
    pub created: bool,
    pub sync_token: String,
}

pub struct CalendarBackend {
    db: Arc<Database>,
    prefix: String,
}

impl CalendarBackend {
    /// `prefix` is the mount point of the protocol tree, e.g. `/dav`.
    pub fn new(db: Arc<Database>, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into().trim_end_matches('/').to_string();
        Self { db, prefix }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Resolve an authenticated username to its stored user.
    pub fn find_user(&self, username: &str) -> Result<User> {
        self.db.with_conn(|conn| UserRepo::new(conn).get_by_username(username))
    }

    pub fn calendar_home_path(&self, ctx: &RequestContext) -> String {
        format!("{}/calendars/{}/", self.prefix, ctx.user.username)
    }

    pub fn current_user_principal(&self, ctx: &RequestContext) -> String {
        format!("{}/principals/{}/", self.prefix, ctx.user.username)
    }

    pub fn calendar_path(&self, ctx: &RequestContext, calendar: &Calendar) -> String {
        format!("{}{}/", self.calendar_home_path(ctx), calendar.name)
    }

    fn object_path(&self, ctx: &RequestContext, calendar: &Calendar, uid: &str) -> String {
        format!("{}{}.ics", self.calendar_path(ctx, calendar), uid)
    }

    pub fn list_calendars(&self, ctx: &RequestContext) -> Result<Vec<Calendar>> {
        self.db
            .with_conn(|conn| CalendarRepo::new(conn).list_by_user(ctx.user.id))
    }

    pub fn get_calendar(&self, ctx: &RequestContext, path: &str) -> Result<Calendar> {
        let target = self.resolve_read(ctx, path)?;
        self.calendar(ctx, &target)
    }

    pub fn create_calendar(
        &self,
        ctx: &RequestContext,
        path: &str,
        display_name: Option<&str>,
        description: Option<&str>,
        color: Option<&str>,
    ) -> Result<Calendar> {
        let target = self.resolve_write(ctx, path)?;
        if target.is_object() {
            return Err(Error::BadRequest(format!("{} is not a collection path", path)));
        }

        let mut calendar = Calendar::new(
            ctx.user.id,
            target.calendar.as_str(),
            display_name.unwrap_or(target.calendar.as_str()),
        );
        calendar.description = description.unwrap_or_default().to_string();
        calendar.color = color.unwrap_or_default().to_string();
        self.db
            .transaction(|tx| CalendarRepo::new(tx).create(&mut calendar))?;

        info!(
            "Created calendar {} for {}",
            calendar.name, ctx.user.username
        );
        Ok(calendar)
    }

    /// Remove a calendar and everything in it.
    pub fn delete_calendar(&self, ctx: &RequestContext, path: &str) -> Result<()> {
        let target = self.resolve_read(ctx, path)?;
        let calendar = self.calendar(ctx, &target)?;
        self.db
            .transaction(|tx| CalendarRepo::new(tx).delete(calendar.id))?;
        info!(
            "Deleted calendar {} for {}",
            calendar.name, ctx.user.username
        );
        Ok(())
    }

    pub fn get_object(&self, ctx: &RequestContext, path: &str) -> Result<CalendarObject> {
        let target = self.resolve_read(ctx, path)?;
        let uid = target
            .uid
            .as_deref()
            .ok_or_else(|| Error::NotFound(format!("{} is not an object path", path)))?;
        let calendar = self.calendar(ctx, &target)?;
        let event = self
            .db
            .with_conn(|conn| EventRepo::new(conn).get_by_uid(calendar.id, uid))?;
        Ok(self.to_object(ctx, &calendar, event))
    }

    pub fn list_objects(&self, ctx: &RequestContext, path: &str) -> Result<Vec<CalendarObject>> {
        self.query_objects(ctx, path, None)
    }

    /// Objects in the calendar at `path`, optionally restricted to those
    /// overlapping `range`.
    pub fn query_objects(
        &self,
        ctx: &RequestContext,
        path: &str,
        range: Option<TimeRange>,
    ) -> Result<Vec<CalendarObject>> {
        let target = self.resolve_read(ctx, path)?;
        let calendar = self.calendar(ctx, &target)?;
        let events = self.db.with_conn(|conn| {
            let events = EventRepo::new(conn);
            match range {
                Some(range) => events.list_in_range(calendar.id, range.start, range.end),
                None => events.list_all(calendar.id),
            }
        })?;
        Ok(events
            .into_iter()
            .map(|event| self.to_object(ctx, &calendar, event))
            .collect())
    }

    /// Create or replace the object at `path` with `body`.
    ///
    /// The stored document and every derived column come from `body`; the
    /// fingerprint check and the write commit together with the calendar's
    /// sync token, or not at all.
    pub fn put_object(
        &self,
        ctx: &RequestContext,
        path: &str,
        body: &[u8],
        preconditions: &Preconditions,
    ) -> Result<PutOutcome> {
        let target = self.resolve_write(ctx, path)?;
        let calendar = self.calendar(ctx, &target)?;

        let ics = ics::encode(body)?;
        let metadata: EventMetadata = ics::extract_metadata(&ics)?;
        let uid = match (&target.uid, &metadata.uid) {
            (Some(path_uid), Some(doc_uid)) if path_uid != doc_uid => {
                debug!(
                    "Resource name {} differs from document UID {}; keeping resource name",
                    path_uid, doc_uid
                );
                path_uid.clone()
            }
            (Some(uid), _) | (None, Some(uid)) => uid.clone(),
            (None, None) => {
                return Err(Error::BadRequest("no UID in path or iCalendar data".into()));
            }
        };
        let mut event = Event::from_document(calendar.id, uid.as_str(), ics, metadata)?;

        let existing = match self
            .db
            .with_conn(|conn| EventRepo::new(conn).get_by_uid(calendar.id, &uid))
        {
            Ok(existing) => Some(existing),
            Err(Error::NotFound(_)) => None,
            Err(e) => return Err(e),
        };

        let (applied, created) = match existing {
            None => {
                if preconditions.if_match.is_some() {
                    return Err(Error::PreconditionFailed(format!(
                        "If-Match given but {} does not exist",
                        uid
                    )));
                }
                let applied = self
                    .db
                    .apply_event_change(calendar.id, &ctx.cancel, |events| {
                        events.create(&mut event)
                    })
                    .map_err(|e| match e {
                        Error::Conflict(msg) if preconditions.if_none_match == Some(EntityTag::Any) => {
                            Error::PreconditionFailed(msg)
                        }
                        other => other,
                    })?;
                (applied, true)
            }
            Some(current) => {
                if preconditions.if_none_match == Some(EntityTag::Any) {
                    return Err(Error::PreconditionFailed(format!(
                        "If-None-Match: * given but {} exists",
                        uid
                    )));
                }
                // the write re-checks `expected` against the stored row
                let expected = match &preconditions.if_match {
                    Some(EntityTag::Tags(tags)) => tags
                        .iter()
                        .find(|tag| **tag == current.fingerprint)
                        .or(tags.first())
                        .cloned()
                        .unwrap_or_default(),
                    _ => current.fingerprint.clone(),
                };
                event.id = current.id;
                event.created_at = current.created_at;
                let applied = self
                    .db
                    .apply_event_change(calendar.id, &ctx.cancel, |events| {
                        events.update(&mut event, &expected)
                    })?;
                (applied, false)
            }
        };

        info!(
            "{} event {}/{} fingerprint={} sync_token={}",
            if created { "Created" } else { "Updated" },
            calendar.name,
            event.uid,
            event.fingerprint,
            applied.sync_token
        );

        Ok(PutOutcome {
            object: self.to_object(ctx, &calendar, event),
            created,
            sync_token: applied.sync_token,
        })
    }

    /// Delete the object at `path`, returning the calendar's new sync token.
    pub fn delete_object(&self, ctx: &RequestContext, path: &str) -> Result<String> {
        let target = self.resolve_read(ctx, path)?;
        let uid = target
            .uid
            .as_deref()
            .ok_or_else(|| Error::NotFound(format!("{} is not an object path", path)))?;
        let calendar = self.calendar(ctx, &target)?;

        let applied = self
            .db
            .apply_event_change(calendar.id, &ctx.cancel, |events| {
                events.delete(calendar.id, uid)
            })?;

        info!(
            "Deleted event {}/{} sync_token={}",
            calendar.name, uid, applied.sync_token
        );
        Ok(applied.sync_token)
    }

    fn resolve_read(&self, ctx: &RequestContext, path: &str) -> Result<ResourcePath> {
        let target = ResourcePath::parse(path).map_err(|e| Error::NotFound(e.to_string()))?;
        self.check_owner(ctx, target)
    }

    fn resolve_write(&self, ctx: &RequestContext, path: &str) -> Result<ResourcePath> {
        let target = ResourcePath::parse(path).map_err(|e| Error::BadRequest(e.to_string()))?;
        self.check_owner(ctx, target)
    }

    fn check_owner(&self, ctx: &RequestContext, target: ResourcePath) -> Result<ResourcePath> {
        if target.owner != ctx.user.username {
            return Err(Error::NotFound(format!(
                "no calendar home for {}",
                target.owner
            )));
        }
        Ok(target)
    }

    fn calendar(&self, ctx: &RequestContext, target: &ResourcePath) -> Result<Calendar> {
        self.db
            .with_conn(|conn| CalendarRepo::new(conn).get_by_name(ctx.user.id, &target.calendar))
    }

    fn to_object(&self, ctx: &RequestContext, calendar: &Calendar, event: Event) -> CalendarObject {
        CalendarObject {
            path: self.object_path(ctx, calendar, &event.uid),
            uid: event.uid,
            data: event.ics,
            fingerprint: event.fingerprint,
            modified: event.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nBEGIN:VEVENT\r\nUID:doc-uid\r\nDTSTART:20260116T100000Z\r\nDTEND:20260116T110000Z\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";

    fn setup() -> (CalendarBackend, RequestContext) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let (user, _) = db.bootstrap("alice").unwrap();
        (CalendarBackend::new(db, "/dav/"), RequestContext::new(user))
    }

    #[test]
    fn test_entity_tag_parse() {
        assert_eq!(EntityTag::parse("*"), Some(EntityTag::Any));
        assert_eq!(
            EntityTag::parse(" \"abc\" "),
            Some(EntityTag::Tags(vec!["\"abc\"".into()]))
        );
        assert_eq!(
            EntityTag::parse("\"a\", \"b,c\" ,"),
            Some(EntityTag::Tags(vec!["\"a\"".into(), "\"b,c\"".into()]))
        );
        assert_eq!(EntityTag::parse(""), None);
        assert_eq!(EntityTag::parse(" , "), None);
    }

    #[test]
    fn test_if_match_accepts_any_listed_tag() {
        let (backend, ctx) = setup();
        let path = "/dav/calendars/alice/default/doc-uid.ics";
        let created = backend
            .put_object(&ctx, path, DOC.as_bytes(), &Preconditions::default())
            .unwrap();
        let current = created.object.fingerprint;

        let unrelated = Preconditions {
            if_match: EntityTag::parse("\"a\", \"b\""),
            if_none_match: None,
        };
        let result = backend.put_object(&ctx, path, DOC.as_bytes(), &unrelated);
        assert!(matches!(result, Err(Error::PreconditionFailed(_))));

        let listed = Preconditions {
            if_match: EntityTag::parse(&format!("\"stale\", {}", current)),
            if_none_match: None,
        };
        let updated = backend.put_object(&ctx, path, DOC.as_bytes(), &listed).unwrap();
        assert!(!updated.created);
    }

    #[test]
    fn test_paths() {
        let (backend, ctx) = setup();
        assert_eq!(backend.prefix(), "/dav");
        assert_eq!(backend.calendar_home_path(&ctx), "/dav/calendars/alice/");
        assert_eq!(backend.current_user_principal(&ctx), "/dav/principals/alice/");
    }

    #[test]
    fn test_uid_taken_from_document_when_path_has_none() {
        let (backend, ctx) = setup();
        // a collection path with no object segment is still a valid write target
        let outcome = backend
            .put_object(&ctx, "/dav/calendars/alice/default/", DOC.as_bytes(), &Preconditions::default())
            .unwrap();
        assert_eq!(outcome.object.uid, "doc-uid");
        assert_eq!(outcome.object.path, "/dav/calendars/alice/default/doc-uid.ics");
    }

    #[test]
    fn test_path_uid_wins_over_document_uid() {
        let (backend, ctx) = setup();
        let outcome = backend
            .put_object(&ctx, "/dav/calendars/alice/default/other.ics", DOC.as_bytes(), &Preconditions::default())
            .unwrap();
        assert_eq!(outcome.object.uid, "other");
        assert!(backend.get_object(&ctx, "/dav/calendars/alice/default/other.ics").is_ok());
    }

    #[test]
    fn test_foreign_owner_is_not_found() {
        let (backend, ctx) = setup();
        let result = backend.get_calendar(&ctx, "/dav/calendars/mallory/default/");
        assert!(matches!(result, Err(Error::NotFound(_))));
        let result = backend.put_object(
            &ctx,
            "/dav/calendars/mallory/default/e1.ics",
            DOC.as_bytes(),
            &Preconditions::default(),
        );
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_bad_paths() {
        let (backend, ctx) = setup();
        assert!(matches!(
            backend.get_object(&ctx, "/dav/principals/alice/"),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            backend.put_object(&ctx, "/dav/nowhere", DOC.as_bytes(), &Preconditions::default()),
            Err(Error::BadRequest(_))
        ));
    }

    #[test]
    fn test_calendar_lifecycle() {
        let (backend, ctx) = setup();
        let created = backend
            .create_calendar(&ctx, "/dav/calendars/alice/work/", Some("Work"), None, Some("#336699"))
            .unwrap();
        assert_eq!(created.display_name, "Work");
        assert_eq!(created.color, "#336699");

        let dup = backend.create_calendar(&ctx, "/dav/calendars/alice/work/", None, None, None);
        assert!(matches!(dup, Err(Error::Conflict(_))));

        let names: Vec<_> = backend
            .list_calendars(&ctx)
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, ["default", "work"]);

        backend.delete_calendar(&ctx, "/dav/calendars/alice/work/").unwrap();
        assert!(matches!(
            backend.get_calendar(&ctx, "/dav/calendars/alice/work/"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_delete_calendar_removes_its_objects() {
        let (backend, ctx) = setup();
        let work = "/dav/calendars/alice/work/";
        let object = "/dav/calendars/alice/work/doc-uid.ics";
        backend.create_calendar(&ctx, work, None, None, None).unwrap();
        backend
            .put_object(&ctx, object, DOC.as_bytes(), &Preconditions::default())
            .unwrap();

        backend.delete_calendar(&ctx, work).unwrap();
        backend.create_calendar(&ctx, work, None, None, None).unwrap();
        assert!(matches!(backend.get_object(&ctx, object), Err(Error::NotFound(_))));
        assert!(backend.list_objects(&ctx, work).unwrap().is_empty());
        assert_eq!(backend.get_calendar(&ctx, work).unwrap().sync_token, "");
    }

    #[test]
    fn test_put_into_missing_calendar() {
        let (backend, ctx) = setup();
        let result = backend.put_object(
            &ctx,
            "/dav/calendars/alice/nope/e1.ics",
            DOC.as_bytes(),
            &Preconditions::default(),
        );
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_put_rejects_malformed_body() {
        let (backend, ctx) = setup();
        let result = backend.put_object(
            &ctx,
            "/dav/calendars/alice/default/e1.ics",
            b"not a calendar",
            &Preconditions::default(),
        );
        assert!(matches!(result, Err(Error::BadRequest(_))));
    }

    #[test]
    fn test_put_without_start_is_validation_error() {
        let (backend, ctx) = setup();
        let body = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nBEGIN:VEVENT\r\nUID:x\r\nSUMMARY:no start\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        let result = backend.put_object(
            &ctx,
            "/dav/calendars/alice/default/x.ics",
            body.as_bytes(),
            &Preconditions::default(),
        );
        assert!(matches!(result, Err(Error::Validation(_))));
    }
}
