//! CalDAV HTTP method handlers

use super::{Config, DavError, DavHandler, DavRequest, DavResponse};
use crate::backend::{CalendarBackend, CalendarObject, EntityTag, Preconditions, RequestContext, TimeRange};
use crate::path::Target;
use crate::xml::{
    self, Multistatus, PropName, PropSelection, PropValue, Property, ReportRequest, Response as DavXmlResponse,
    APPLE_ICAL_NS, CALENDARSERVER_NS,
};
use bytes::Bytes;
use calsync_core::{Calendar, Error};
use chrono::{DateTime, Utc};
use http_body_util::Full;
use hyper::header::{ALLOW, CONTENT_LENGTH, CONTENT_TYPE, ETAG, LAST_MODIFIED, LOCATION};
use hyper::{Response, StatusCode};
use tracing::debug;

/// Methods served under the CalDAV prefix
pub const ALLOW_METHODS: &str = "OPTIONS, GET, HEAD, PUT, DELETE, PROPFIND, PROPPATCH, REPORT, MKCALENDAR";

const CALENDAR_CONTENT_TYPE: &str = "text/calendar; charset=utf-8";
const XML_CONTENT_TYPE: &str = "application/xml; charset=utf-8";

/// `Depth` header; `infinity` is served as `1`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    Zero,
    One,
}

impl Depth {
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some("0") => Depth::Zero,
            _ => Depth::One,
        }
    }
}

/// RFC 1123 date as used in `Last-Modified` and `getlastmodified`.
pub fn http_date(instant: DateTime<Utc>) -> String {
    instant.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

// ==================== Unauthenticated endpoints ====================

pub fn well_known(config: &Config) -> Result<DavResponse, DavError> {
    let location = format!(
        "{}/principals/{}/",
        config.prefix.trim_end_matches('/'),
        config.username
    );
    Ok(Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(LOCATION, location)
        .body(Full::new(Bytes::new()))?)
}

pub fn health() -> Result<DavResponse, DavError> {
    let body = serde_json::json!({
        "status": "ok",
        "service": "calsync",
        "version": env!("CARGO_PKG_VERSION"),
    });
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body.to_string())))?)
}

pub fn index() -> Result<DavResponse, DavError> {
    let body = "<!DOCTYPE html>\n<html><head><title>calsync</title></head>\
                <body><h1>calsync</h1><p>CalDAV server is running.</p></body></html>\n";
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/html; charset=utf-8")
        .body(Full::new(Bytes::from(body)))?)
}

pub fn options() -> Result<DavResponse, DavError> {
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(ALLOW, ALLOW_METHODS)
        .header("DAV", "1, 2, 3, calendar-access")
        .header(CONTENT_LENGTH, 0)
        .body(Full::new(Bytes::new()))?)
}

// ==================== Object methods ====================

pub async fn get(
    handler: &DavHandler,
    ctx: &RequestContext,
    req: &DavRequest,
    with_body: bool,
) -> Result<DavResponse, DavError> {
    match &req.target {
        Target::Resource(path) if path.is_object() => {}
        Target::Unknown => return Err(DavError::NotFound(req.path.clone())),
        _ => return Err(DavError::MethodNotAllowed(req.method.to_string())),
    }

    let path = req.path.clone();
    let object = handler
        .run_blocking(ctx, move |backend, ctx| backend.get_object(ctx, &path))
        .await?;

    let builder = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, CALENDAR_CONTENT_TYPE)
        .header(ETAG, &object.fingerprint)
        .header(LAST_MODIFIED, http_date(object.modified))
        .header(CONTENT_LENGTH, object.data.len());
    let body = if with_body {
        Bytes::from(object.data)
    } else {
        Bytes::new()
    };
    Ok(builder.body(Full::new(body))?)
}

pub async fn put(
    handler: &DavHandler,
    ctx: &RequestContext,
    req: &DavRequest,
) -> Result<DavResponse, DavError> {
    let preconditions = Preconditions {
        if_match: req.header("If-Match").and_then(EntityTag::parse),
        if_none_match: req.header("If-None-Match").and_then(EntityTag::parse),
    };
    debug!("PUT {} preconditions={:?}", req.path, preconditions);

    let path = req.path.clone();
    let body = req.body.clone();
    let outcome = handler
        .run_blocking(ctx, move |backend, ctx| {
            backend.put_object(ctx, &path, &body, &preconditions)
        })
        .await?;

    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::NO_CONTENT
    };
    Ok(Response::builder()
        .status(status)
        .header(ETAG, &outcome.object.fingerprint)
        .body(Full::new(Bytes::new()))?)
}

pub async fn delete(
    handler: &DavHandler,
    ctx: &RequestContext,
    req: &DavRequest,
) -> Result<DavResponse, DavError> {
    let path = req.path.clone();
    match &req.target {
        Target::Resource(target) if target.is_object() => {
            handler
                .run_blocking(ctx, move |backend, ctx| backend.delete_object(ctx, &path))
                .await?;
        }
        Target::Resource(_) => {
            handler
                .run_blocking(ctx, move |backend, ctx| backend.delete_calendar(ctx, &path))
                .await?;
        }
        Target::Unknown => return Err(DavError::NotFound(req.path.clone())),
        _ => return Err(DavError::MethodNotAllowed(req.method.to_string())),
    }
    Ok(Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(Full::new(Bytes::new()))?)
}

// ==================== Collection methods ====================

pub async fn mkcalendar(
    handler: &DavHandler,
    ctx: &RequestContext,
    req: &DavRequest,
) -> Result<DavResponse, DavError> {
    if !matches!(&req.target, Target::Resource(path) if !path.is_object()) {
        return Err(DavError::MethodNotAllowed(req.method.to_string()));
    }
    let request = xml::parse_mkcalendar(&req.body)?;

    let path = req.path.clone();
    handler
        .run_blocking(ctx, move |backend, ctx| {
            backend.create_calendar(
                ctx,
                &path,
                request.display_name.as_deref(),
                request.description.as_deref(),
                request.color.as_deref(),
            )
        })
        .await?;

    Ok(Response::builder()
        .status(StatusCode::CREATED)
        .body(Full::new(Bytes::new()))?)
}

pub async fn propfind(
    handler: &DavHandler,
    ctx: &RequestContext,
    req: &DavRequest,
) -> Result<DavResponse, DavError> {
    let selection = xml::parse_propfind(&req.body)?;
    let depth = Depth::parse(req.header("Depth"));
    debug!("PROPFIND {} depth={:?}", req.path, depth);

    let path = req.path.clone();
    let target = req.target.clone();
    let responses = handler
        .run_blocking(ctx, move |backend, ctx| {
            propfind_responses(backend, ctx, &target, &path, depth, &selection)
        })
        .await?;

    multistatus(Multistatus {
        responses,
        sync_token: None,
    })
}

/// Property changes are acknowledged but not stored.
pub fn proppatch(req: &DavRequest) -> Result<DavResponse, DavError> {
    let names = xml::parse_proppatch(&req.body)?;
    let props = names
        .into_iter()
        .map(|name| Property::new(name, PropValue::Empty))
        .collect::<Vec<_>>();

    let mut response = DavXmlResponse::new(req.path.clone());
    if !props.is_empty() {
        response.propstats.push(xml::PropStat::new(props, StatusCode::OK));
    }
    multistatus(Multistatus {
        responses: vec![response],
        sync_token: None,
    })
}

pub async fn report(
    handler: &DavHandler,
    ctx: &RequestContext,
    req: &DavRequest,
) -> Result<DavResponse, DavError> {
    let report = xml::parse_report(&req.body)?;
    let path = req.path.clone();

    let responses = match report {
        ReportRequest::CalendarQuery { props, range } => {
            let selection = report_selection(props);
            let range = range.map(|(start, end)| TimeRange { start, end });
            debug!("calendar-query {} range={:?}", path, range);
            handler
                .run_blocking(ctx, move |backend, ctx| {
                    let objects = backend.query_objects(ctx, &path, range)?;
                    Ok(objects
                        .into_iter()
                        .map(|obj| object_response(obj, &selection))
                        .collect::<Vec<_>>())
                })
                .await?
        }
        ReportRequest::Multiget { props, hrefs } => {
            let selection = report_selection(props);
            handler
                .run_blocking(ctx, move |backend, ctx| {
                    let mut responses = Vec::with_capacity(hrefs.len());
                    for href in hrefs {
                        match backend.get_object(ctx, &href) {
                            Ok(obj) => responses.push(object_response(obj, &selection)),
                            Err(Error::NotFound(_)) => responses
                                .push(DavXmlResponse::with_status(href, StatusCode::NOT_FOUND)),
                            Err(e) => return Err(e),
                        }
                    }
                    Ok(responses)
                })
                .await?
        }
        ReportRequest::Unsupported(name) => {
            return Err(DavError::NotImplemented(format!("REPORT {}", name)));
        }
    };

    multistatus(Multistatus {
        responses,
        sync_token: None,
    })
}

fn multistatus(body: Multistatus) -> Result<DavResponse, DavError> {
    let xml = body.to_xml()?;
    Ok(Response::builder()
        .status(StatusCode::MULTI_STATUS)
        .header(CONTENT_TYPE, XML_CONTENT_TYPE)
        .body(Full::new(Bytes::from(xml)))?)
}

// ==================== Property sets ====================

fn propfind_responses(
    backend: &CalendarBackend,
    ctx: &RequestContext,
    target: &Target,
    path: &str,
    depth: Depth,
    selection: &PropSelection,
) -> calsync_core::Result<Vec<DavXmlResponse>> {
    let mut responses = Vec::new();
    match target {
        Target::Root => {
            responses.push(DavXmlResponse::select(
                format!("{}/", backend.prefix()),
                root_props(backend, ctx),
                selection,
            ));
            if depth == Depth::One {
                responses.push(principal_response(backend, ctx, selection));
            }
        }
        Target::Principal(user) => {
            ensure_self(ctx, user)?;
            responses.push(principal_response(backend, ctx, selection));
        }
        Target::Home(user) => {
            ensure_self(ctx, user)?;
            responses.push(DavXmlResponse::select(
                backend.calendar_home_path(ctx),
                home_props(backend, ctx),
                selection,
            ));
            if depth == Depth::One {
                for calendar in backend.list_calendars(ctx)? {
                    responses.push(calendar_response(backend, ctx, &calendar, selection));
                }
            }
        }
        Target::Resource(resource) if resource.is_object() => {
            let object = backend.get_object(ctx, path)?;
            responses.push(object_response(object, selection));
        }
        Target::Resource(_) => {
            let calendar = backend.get_calendar(ctx, path)?;
            responses.push(calendar_response(backend, ctx, &calendar, selection));
            if depth == Depth::One {
                for object in backend.list_objects(ctx, path)? {
                    responses.push(object_response(object, selection));
                }
            }
        }
        Target::Unknown => return Err(Error::NotFound(path.to_string())),
    }
    Ok(responses)
}

fn ensure_self(ctx: &RequestContext, user: &str) -> calsync_core::Result<()> {
    if user == ctx.user.username {
        Ok(())
    } else {
        Err(Error::NotFound(format!("no principal {}", user)))
    }
}

fn collection() -> PropName {
    PropName::dav("collection")
}

fn common_props(backend: &CalendarBackend, ctx: &RequestContext) -> Vec<Property> {
    let principal = backend.current_user_principal(ctx);
    vec![
        Property::href(PropName::dav("current-user-principal"), principal.clone()),
        Property::href(PropName::dav("owner"), principal),
    ]
}

fn root_props(backend: &CalendarBackend, ctx: &RequestContext) -> Vec<Property> {
    let mut props = vec![
        Property::new(PropName::dav("resourcetype"), PropValue::Elements(vec![collection()])),
        Property::text(PropName::dav("displayname"), "calsync"),
    ];
    props.extend(common_props(backend, ctx));
    props
}

fn principal_response(
    backend: &CalendarBackend,
    ctx: &RequestContext,
    selection: &PropSelection,
) -> DavXmlResponse {
    let href = backend.current_user_principal(ctx);
    let mut props = vec![
        Property::new(
            PropName::dav("resourcetype"),
            PropValue::Elements(vec![collection(), PropName::dav("principal")]),
        ),
        Property::text(PropName::dav("displayname"), ctx.user.username.clone()),
        Property::href(PropName::dav("principal-URL"), href.clone()),
        Property::href(PropName::caldav("calendar-home-set"), backend.calendar_home_path(ctx)),
    ];
    props.extend(common_props(backend, ctx));
    DavXmlResponse::select(href, props, selection)
}

fn home_props(backend: &CalendarBackend, ctx: &RequestContext) -> Vec<Property> {
    let mut props = vec![
        Property::new(PropName::dav("resourcetype"), PropValue::Elements(vec![collection()])),
        Property::text(PropName::dav("displayname"), ctx.user.username.clone()),
        Property::href(PropName::caldav("calendar-home-set"), backend.calendar_home_path(ctx)),
    ];
    props.extend(common_props(backend, ctx));
    props
}

fn calendar_response(
    backend: &CalendarBackend,
    ctx: &RequestContext,
    calendar: &Calendar,
    selection: &PropSelection,
) -> DavXmlResponse {
    let mut props = vec![
        Property::new(
            PropName::dav("resourcetype"),
            PropValue::Elements(vec![collection(), PropName::caldav("calendar")]),
        ),
        Property::text(PropName::dav("displayname"), calendar.display_name.clone()),
        Property::text(PropName::caldav("calendar-description"), calendar.description.clone()),
        Property::text(PropName::new(APPLE_ICAL_NS, "calendar-color"), calendar.color.clone()),
        Property::new(
            PropName::caldav("supported-calendar-component-set"),
            PropValue::Components(vec!["VEVENT".to_string()]),
        ),
        Property::text(PropName::new(CALENDARSERVER_NS, "getctag"), calendar.sync_token.clone()),
        Property::text(PropName::dav("sync-token"), calendar.sync_token.clone()),
    ];
    props.extend(common_props(backend, ctx));
    DavXmlResponse::select(backend.calendar_path(ctx, calendar), props, selection)
}

fn object_response(object: CalendarObject, selection: &PropSelection) -> DavXmlResponse {
    let mut props = vec![
        Property::new(PropName::dav("resourcetype"), PropValue::Elements(Vec::new())),
        Property::text(PropName::dav("getetag"), object.fingerprint),
        Property::text(
            PropName::dav("getcontenttype"),
            "text/calendar; charset=utf-8; component=vevent",
        ),
        Property::text(PropName::dav("getcontentlength"), object.data.len().to_string()),
        Property::text(PropName::dav("getlastmodified"), http_date(object.modified)),
    ];
    // allprop leaves out the document itself
    if *selection != PropSelection::All {
        props.push(Property::text(PropName::caldav("calendar-data"), object.data));
    }
    DavXmlResponse::select(object.path, props, selection)
}

/// An empty REPORT `prop` list means `getetag` plus `calendar-data`.
fn report_selection(selection: PropSelection) -> PropSelection {
    match selection {
        PropSelection::All => PropSelection::Named(vec![
            PropName::dav("getetag"),
            PropName::caldav("calendar-data"),
        ]),
        named => named,
    }
}
