//! Calendar collections

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// A named collection of events owned by one user.
///
/// `sync_token` is empty for a calendar that has never held a mutation and
/// changes exactly once per committed event create/update/delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Calendar {
    pub id: i64,
    pub user_id: i64,
    /// URL-safe identifier, unique per owner (e.g. "personal")
    pub name: String,
    pub display_name: String,
    /// Hex color code (e.g. "#FF5733")
    pub color: String,
    pub description: String,
    pub sync_token: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Calendar {
    /// A not-yet-persisted calendar; id and timestamps are assigned on create.
    pub fn new(user_id: i64, name: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: 0,
            user_id,
            name: name.into(),
            display_name: display_name.into(),
            color: String::new(),
            description: String::new(),
            sync_token: String::new(),
            created_at: DateTime::<Utc>::default(),
            updated_at: DateTime::<Utc>::default(),
        }
    }

    /// Check required fields.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Validation("calendar name is required".into()));
        }
        if self.name.contains('/') || self.name == "." || self.name == ".." {
            return Err(Error::Validation(format!(
                "calendar name {:?} is not URL-safe",
                self.name
            )));
        }
        if self.user_id <= 0 {
            return Err(Error::Validation(
                "calendar user_id must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calendar_validate() {
        assert!(Calendar::new(1, "personal", "Personal").validate().is_ok());
        assert!(matches!(
            Calendar::new(1, "", "Empty").validate(),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            Calendar::new(0, "personal", "No owner").validate(),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            Calendar::new(1, "a/b", "Slash").validate(),
            Err(Error::Validation(_))
        ));
    }
}
