//! Resource path grammar
//!
//! Calendar resources live at `…/calendars/{owner}/{calendar}/{uid}.ics`.
//! Anything before the `calendars` segment (usually the mount prefix) is
//! ignored, so the grammar works with or without the prefix attached.

use std::fmt;
use std::str::FromStr;

const CALENDARS_SEGMENT: &str = "calendars";
const PRINCIPALS_SEGMENT: &str = "principals";
const OBJECT_SUFFIX: &str = ".ics";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("path has no calendars segment: {0}")]
    NotACalendarPath(String),

    #[error("path does not name both an owner and a calendar: {0}")]
    Incomplete(String),

    #[error("path has unexpected trailing segments: {0}")]
    TooDeep(String),
}

/// A calendar collection, or an object inside one when `uid` is set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePath {
    pub owner: String,
    pub calendar: String,
    pub uid: Option<String>,
}

impl ResourcePath {
    pub fn parse(path: &str) -> Result<Self, PathError> {
        let segments = segments(path);
        let start = segments
            .iter()
            .position(|s| *s == CALENDARS_SEGMENT)
            .ok_or_else(|| PathError::NotACalendarPath(path.to_string()))?;

        match &segments[start + 1..] {
            [owner, calendar] => Ok(Self {
                owner: owner.to_string(),
                calendar: calendar.to_string(),
                uid: None,
            }),
            [owner, calendar, object] => {
                let uid = object.strip_suffix(OBJECT_SUFFIX).unwrap_or(*object);
                if uid.is_empty() {
                    return Err(PathError::Incomplete(path.to_string()));
                }
                Ok(Self {
                    owner: owner.to_string(),
                    calendar: calendar.to_string(),
                    uid: Some(uid.to_string()),
                })
            }
            rest if rest.len() < 2 => Err(PathError::Incomplete(path.to_string())),
            _ => Err(PathError::TooDeep(path.to_string())),
        }
    }

    pub fn is_object(&self) -> bool {
        self.uid.is_some()
    }

    /// The same path with the object segment removed.
    pub fn collection(&self) -> Self {
        Self {
            owner: self.owner.clone(),
            calendar: self.calendar.clone(),
            uid: None,
        }
    }
}

impl FromStr for ResourcePath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}/{}/", CALENDARS_SEGMENT, self.owner, self.calendar)?;
        if let Some(uid) = &self.uid {
            write!(f, "{}{}", uid, OBJECT_SUFFIX)?;
        }
        Ok(())
    }
}

/// What a request path under the mount prefix addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// The prefix itself
    Root,
    /// `principals/{user}/`
    Principal(String),
    /// `calendars/{user}/`
    Home(String),
    /// A calendar or an object within it
    Resource(ResourcePath),
    /// Anything else
    Unknown,
}

impl Target {
    /// Classify `path`, which must already have the mount prefix stripped.
    pub fn classify(path: &str) -> Self {
        let segments = segments(path);
        match segments.as_slice() {
            [] => Target::Root,
            [PRINCIPALS_SEGMENT, user] => Target::Principal(user.to_string()),
            [CALENDARS_SEGMENT, user] => Target::Home(user.to_string()),
            [CALENDARS_SEGMENT, ..] => ResourcePath::parse(path)
                .map(Target::Resource)
                .unwrap_or(Target::Unknown),
            _ => Target::Unknown,
        }
    }
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}
