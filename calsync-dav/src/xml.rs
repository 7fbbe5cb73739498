//! WebDAV/CalDAV XML parsing and generation
//!
//! Request bodies are read into a small namespace-resolved element tree and
//! interpreted from there; responses are written with quick-xml's writer.

use calsync_core::ics::parse_utc_timestamp;
use chrono::{DateTime, Utc};
use hyper::StatusCode;
use quick_xml::events::{BytesDecl, BytesStart, BytesText, Event};
use quick_xml::name::{Namespace, ResolveResult};
use quick_xml::reader::NsReader;
use quick_xml::writer::Writer;
use std::io::Cursor;

/// WebDAV XML namespace
pub const DAV_NS: &str = "DAV:";

/// CalDAV XML namespace (RFC 4791)
pub const CALDAV_NS: &str = "urn:ietf:params:xml:ns:caldav";

/// Calendar Server extensions (getctag)
pub const CALENDARSERVER_NS: &str = "http://calendarserver.org/ns/";

/// Apple iCal extensions (calendar-color)
pub const APPLE_ICAL_NS: &str = "http://apple.com/ns/ical/";

const PREFIXES: [(&str, &str); 4] = [
    (DAV_NS, "D"),
    (CALDAV_NS, "C"),
    (CALENDARSERVER_NS, "CS"),
    (APPLE_ICAL_NS, "A"),
];

/// XML parsing errors
#[derive(Debug, thiserror::Error)]
pub enum XmlError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid XML structure: {0}")]
    InvalidStructure(String),
}

/// A namespace-qualified property name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PropName {
    pub namespace: String,
    pub name: String,
}

impl PropName {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn dav(name: &str) -> Self {
        Self::new(DAV_NS, name)
    }

    pub fn caldav(name: &str) -> Self {
        Self::new(CALDAV_NS, name)
    }
}

// ==================== Request parsing ====================

/// Parsed XML element with resolved namespace
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    pub namespace: String,
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Element>,
    pub text: String,
}

impl Element {
    fn from_start(namespace: String, start: &BytesStart<'_>) -> Self {
        let attributes = start
            .attributes()
            .flatten()
            .map(|a| {
                (
                    String::from_utf8_lossy(a.key.local_name().as_ref()).into_owned(),
                    String::from_utf8_lossy(&a.value).into_owned(),
                )
            })
            .collect();
        Self {
            namespace,
            name: String::from_utf8_lossy(start.local_name().as_ref()).into_owned(),
            attributes,
            children: Vec::new(),
            text: String::new(),
        }
    }

    pub fn is(&self, namespace: &str, name: &str) -> bool {
        self.namespace == namespace && self.name == name
    }

    pub fn prop_name(&self) -> PropName {
        PropName::new(&self.namespace, &self.name)
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn child(&self, namespace: &str, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.is(namespace, name))
    }

    /// First matching element in depth-first order, including `self`.
    pub fn find(&self, namespace: &str, name: &str) -> Option<&Element> {
        if self.is(namespace, name) {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(namespace, name))
    }

    /// All matching elements in depth-first order, including `self`.
    pub fn find_all<'a>(&'a self, namespace: &str, name: &str, out: &mut Vec<&'a Element>) {
        if self.is(namespace, name) {
            out.push(self);
        }
        for child in &self.children {
            child.find_all(namespace, name, out);
        }
    }
}

/// Parse a request body into an element tree.
pub fn parse_document(xml: &str) -> Result<Element, XmlError> {
    let mut reader = NsReader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        match reader.read_resolved_event() {
            Ok((ns, Event::Start(e))) => {
                stack.push(Element::from_start(namespace_of(&ns), &e));
            }
            Ok((ns, Event::Empty(e))) => {
                let element = Element::from_start(namespace_of(&ns), &e);
                attach(&mut stack, &mut root, element)?;
            }
            Ok((_, Event::End(_))) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| XmlError::InvalidStructure("unbalanced end tag".into()))?;
                attach(&mut stack, &mut root, element)?;
            }
            Ok((_, Event::Text(text))) => {
                if let Some(top) = stack.last_mut() {
                    let text = text.unescape().map_err(|e| XmlError::Parse(e.to_string()))?;
                    top.text.push_str(&text);
                }
            }
            Ok((_, Event::CData(data))) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Ok((_, Event::Eof)) => break,
            Ok(_) => {}
            Err(e) => return Err(XmlError::Parse(e.to_string())),
        }
    }

    if !stack.is_empty() {
        return Err(XmlError::InvalidStructure("unclosed element".into()));
    }
    root.ok_or_else(|| XmlError::InvalidStructure("empty document".into()))
}

fn namespace_of(resolved: &ResolveResult<'_>) -> String {
    match resolved {
        ResolveResult::Bound(Namespace(ns)) => String::from_utf8_lossy(ns).into_owned(),
        _ => String::new(),
    }
}

fn attach(
    stack: &mut [Element],
    root: &mut Option<Element>,
    element: Element,
) -> Result<(), XmlError> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None if root.is_none() => *root = Some(element),
        None => {
            return Err(XmlError::InvalidStructure(
                "more than one root element".into(),
            ))
        }
    }
    Ok(())
}

fn body_text(body: &[u8]) -> Result<Option<&str>, XmlError> {
    let text = std::str::from_utf8(body).map_err(|e| XmlError::Parse(e.to_string()))?;
    Ok((!text.trim().is_empty()).then_some(text))
}

/// Which properties a request asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropSelection {
    /// `allprop`, or no body at all
    All,
    Named(Vec<PropName>),
}

impl PropSelection {
    fn from_parent(parent: &Element) -> Self {
        match parent.child(DAV_NS, "prop") {
            Some(prop) => PropSelection::Named(prop.children.iter().map(Element::prop_name).collect()),
            None => PropSelection::All,
        }
    }
}

/// Parse a PROPFIND body. An empty body means `allprop`.
pub fn parse_propfind(body: &[u8]) -> Result<PropSelection, XmlError> {
    let Some(text) = body_text(body)? else {
        return Ok(PropSelection::All);
    };
    let root = parse_document(text)?;
    if !root.is(DAV_NS, "propfind") {
        return Err(XmlError::InvalidStructure(format!(
            "expected DAV:propfind, found {}",
            root.name
        )));
    }
    Ok(PropSelection::from_parent(&root))
}

/// Property names a PROPPATCH body sets or removes.
pub fn parse_proppatch(body: &[u8]) -> Result<Vec<PropName>, XmlError> {
    let Some(text) = body_text(body)? else {
        return Ok(Vec::new());
    };
    let root = parse_document(text)?;
    let mut props = Vec::new();
    root.find_all(DAV_NS, "prop", &mut props);
    Ok(props
        .into_iter()
        .flat_map(|p| p.children.iter().map(Element::prop_name))
        .collect())
}

/// Properties supplied with MKCALENDAR
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MkcalendarRequest {
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub color: Option<String>,
}

pub fn parse_mkcalendar(body: &[u8]) -> Result<MkcalendarRequest, XmlError> {
    let Some(text) = body_text(body)? else {
        return Ok(MkcalendarRequest::default());
    };
    let root = parse_document(text)?;
    let value = |ns: &str, name: &str| {
        root.find(ns, name)
            .map(|e| e.text.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    Ok(MkcalendarRequest {
        display_name: value(DAV_NS, "displayname"),
        description: value(CALDAV_NS, "calendar-description"),
        color: value(APPLE_ICAL_NS, "calendar-color"),
    })
}

/// Supported REPORT bodies
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportRequest {
    /// calendar-query; the range is only set when both bounds parsed
    CalendarQuery {
        props: PropSelection,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    },
    /// calendar-multiget
    Multiget {
        props: PropSelection,
        hrefs: Vec<String>,
    },
    Unsupported(String),
}

pub fn parse_report(body: &[u8]) -> Result<ReportRequest, XmlError> {
    let text = body_text(body)?
        .ok_or_else(|| XmlError::InvalidStructure("REPORT requires a body".into()))?;
    let root = parse_document(text)?;
    let props = PropSelection::from_parent(&root);

    if root.is(CALDAV_NS, "calendar-query") {
        let range = root.find(CALDAV_NS, "time-range").and_then(|tr| {
            let bound = |name: &str| {
                tr.attribute(name)
                    .and_then(parse_utc_timestamp)
                    .map(|(t, _)| t)
            };
            Some((bound("start")?, bound("end")?))
        });
        Ok(ReportRequest::CalendarQuery { props, range })
    } else if root.is(CALDAV_NS, "calendar-multiget") {
        let mut hrefs = Vec::new();
        root.find_all(DAV_NS, "href", &mut hrefs);
        Ok(ReportRequest::Multiget {
            props,
            hrefs: hrefs.into_iter().map(|h| h.text.trim().to_string()).collect(),
        })
    } else {
        Ok(ReportRequest::Unsupported(root.name))
    }
}

// ==================== Response generation ====================

/// Value of a property in a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropValue {
    Empty,
    Text(String),
    Href(String),
    /// Child elements without content, e.g. `resourcetype`
    Elements(Vec<PropName>),
    /// `supported-calendar-component-set`
    Components(Vec<String>),
}

/// Property element
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub name: PropName,
    pub value: PropValue,
}

impl Property {
    pub fn new(name: PropName, value: PropValue) -> Self {
        Self { name, value }
    }

    pub fn text(name: PropName, value: impl Into<String>) -> Self {
        Self::new(name, PropValue::Text(value.into()))
    }

    pub fn href(name: PropName, href: impl Into<String>) -> Self {
        Self::new(name, PropValue::Href(href.into()))
    }
}

/// WebDAV propstat element
#[derive(Debug, Clone)]
pub struct PropStat {
    pub props: Vec<Property>,
    pub status: String,
}

impl PropStat {
    pub fn new(props: Vec<Property>, status: StatusCode) -> Self {
        Self {
            props,
            status: status_line(status),
        }
    }

    fn write_xml<W: std::io::Write>(&self, writer: &mut Writer<W>) -> std::io::Result<()> {
        writer
            .create_element("D:propstat")
            .write_inner_content(|w| {
                w.create_element("D:prop").write_inner_content(|w| {
                    for prop in &self.props {
                        write_property(w, prop)?;
                    }
                    Ok(())
                })?;
                w.create_element("D:status")
                    .write_text_content(BytesText::new(&self.status))?;
                Ok(())
            })?;
        Ok(())
    }
}

/// WebDAV response element
#[derive(Debug, Clone)]
pub struct Response {
    pub href: String,
    pub propstats: Vec<PropStat>,
    /// Response-level status, used instead of propstats (e.g. 404 in multiget)
    pub status: Option<String>,
}

impl Response {
    pub fn new(href: impl Into<String>) -> Self {
        Self {
            href: href.into(),
            propstats: Vec::new(),
            status: None,
        }
    }

    pub fn with_status(href: impl Into<String>, status: StatusCode) -> Self {
        Self {
            href: href.into(),
            propstats: Vec::new(),
            status: Some(status_line(status)),
        }
    }

    /// Answer `selection` from `available`: found properties under 200,
    /// unknown requested ones under 404.
    pub fn select(href: impl Into<String>, available: Vec<Property>, selection: &PropSelection) -> Self {
        let mut response = Self::new(href);
        let (found, missing) = match selection {
            PropSelection::All => (available, Vec::new()),
            PropSelection::Named(names) => {
                let mut found = Vec::new();
                let mut missing = Vec::new();
                let mut available = available;
                for name in names {
                    match available.iter().position(|p| &p.name == name) {
                        Some(i) => found.push(available.swap_remove(i)),
                        None => missing.push(Property::new(name.clone(), PropValue::Empty)),
                    }
                }
                (found, missing)
            }
        };
        if !found.is_empty() {
            response.propstats.push(PropStat::new(found, StatusCode::OK));
        }
        if !missing.is_empty() {
            response.propstats.push(PropStat::new(missing, StatusCode::NOT_FOUND));
        }
        response
    }

    fn write_xml<W: std::io::Write>(&self, writer: &mut Writer<W>) -> std::io::Result<()> {
        writer
            .create_element("D:response")
            .write_inner_content(|w| {
                w.create_element("D:href")
                    .write_text_content(BytesText::new(&self.href))?;
                for propstat in &self.propstats {
                    propstat.write_xml(w)?;
                }
                if let Some(status) = &self.status {
                    w.create_element("D:status")
                        .write_text_content(BytesText::new(status))?;
                }
                Ok(())
            })?;
        Ok(())
    }
}

/// WebDAV multistatus response
#[derive(Debug, Clone, Default)]
pub struct Multistatus {
    pub responses: Vec<Response>,
    pub sync_token: Option<String>,
}

impl Multistatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize to XML
    pub fn to_xml(&self) -> Result<String, XmlError> {
        let mut writer = Writer::new(Cursor::new(Vec::new()));
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))
            .map_err(|e| XmlError::Serialization(e.to_string()))?;

        let namespaces: Vec<(String, &str)> = PREFIXES
            .iter()
            .map(|(ns, prefix)| (format!("xmlns:{}", prefix), *ns))
            .collect();
        writer
            .create_element("D:multistatus")
            .with_attributes(namespaces.iter().map(|(k, v)| (k.as_str(), *v)))
            .write_inner_content(|w| {
                for response in &self.responses {
                    response.write_xml(w)?;
                }
                if let Some(token) = &self.sync_token {
                    w.create_element("D:sync-token")
                        .write_text_content(BytesText::new(token))?;
                }
                Ok(())
            })
            .map_err(|e| XmlError::Serialization(e.to_string()))?;

        String::from_utf8(writer.into_inner().into_inner())
            .map_err(|e| XmlError::Serialization(e.to_string()))
    }
}

fn qualified(name: &PropName) -> (String, Option<(&'static str, String)>) {
    match PREFIXES.iter().find(|(ns, _)| *ns == name.namespace) {
        Some((_, prefix)) => (format!("{}:{}", prefix, name.name), None),
        None => (
            format!("X:{}", name.name),
            Some(("xmlns:X", name.namespace.clone())),
        ),
    }
}

fn write_property<W: std::io::Write>(writer: &mut Writer<W>, prop: &Property) -> std::io::Result<()> {
    let (qname, extra_ns) = qualified(&prop.name);
    let mut element = writer.create_element(qname);
    if let Some((key, ns)) = &extra_ns {
        element = element.with_attribute((*key, ns.as_str()));
    }
    match &prop.value {
        PropValue::Empty => {
            element.write_empty()?;
        }
        PropValue::Text(text) => {
            element.write_text_content(BytesText::new(text))?;
        }
        PropValue::Href(href) => {
            element.write_inner_content(|w| {
                w.create_element("D:href")
                    .write_text_content(BytesText::new(href))?;
                Ok(())
            })?;
        }
        PropValue::Elements(names) => {
            element.write_inner_content(|w| {
                for name in names {
                    write_property(w, &Property::new(name.clone(), PropValue::Empty))?;
                }
                Ok(())
            })?;
        }
        PropValue::Components(components) => {
            element.write_inner_content(|w| {
                for comp in components {
                    w.create_element("C:comp")
                        .with_attribute(("name", comp.as_str()))
                        .write_empty()?;
                }
                Ok(())
            })?;
        }
    }
    Ok(())
}

/// `HTTP/1.1 <code> <reason>`
pub fn status_line(status: StatusCode) -> String {
    format!(
        "HTTP/1.1 {} {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    )
}
