//! Authenticated principal

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A calendar owner. Created once at bootstrap and never modified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
