//! To-do items owned by a user. Not exposed over the sync protocol.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

pub const MIN_PRIORITY: i64 = 1;
pub const MAX_PRIORITY: i64 = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Task {
    pub id: i64,
    pub user_id: i64,
    /// Identifier in an upstream task service, if mirrored from one
    pub external_id: Option<String>,
    pub content: String,
    pub description: String,
    /// 1 (normal) through 4 (urgent)
    pub priority: i64,
    pub due_date: Option<DateTime<Utc>>,
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(user_id: i64, content: impl Into<String>) -> Self {
        Self {
            id: 0,
            user_id,
            external_id: None,
            content: content.into(),
            description: String::new(),
            priority: MIN_PRIORITY,
            due_date: None,
            completed: false,
            completed_at: None,
            created_at: DateTime::<Utc>::default(),
            updated_at: DateTime::<Utc>::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.content.trim().is_empty() {
            return Err(Error::Validation("task content is required".into()));
        }
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.priority) {
            return Err(Error::Validation(format!(
                "task priority must be between {} and {}, got {}",
                MIN_PRIORITY, MAX_PRIORITY, self.priority
            )));
        }
        if self.user_id <= 0 {
            return Err(Error::Validation("task user_id must be greater than 0".into()));
        }
        Ok(())
    }

    /// Mark the task done at `at`, or reopen it.
    pub fn set_completed(&mut self, completed: bool, at: DateTime<Utc>) {
        self.completed = completed;
        self.completed_at = completed.then_some(at);
    }
}
