use super::{instant, now};
use crate::error::{is_unique_violation, Error, Result};
use crate::user::User;
use rusqlite::{params, Connection, OptionalExtension, Row};

const COLUMNS: &str = "id, username, created_at, updated_at";

pub struct UserRepo<'c> {
    conn: &'c Connection,
}

impl<'c> UserRepo<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn create(&self, username: &str) -> Result<User> {
        if username.is_empty() {
            return Err(Error::Validation("username is required".into()));
        }
        let ts = now();
        self.conn
            .execute(
                "INSERT INTO users (username, created_at, updated_at) VALUES (?1, ?2, ?2)",
                params![username, ts.timestamp()],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    Error::Conflict(format!("user {} already exists", username))
                } else {
                    e.into()
                }
            })?;
        Ok(User {
            id: self.conn.last_insert_rowid(),
            username: username.to_string(),
            created_at: ts,
            updated_at: ts,
        })
    }

    pub fn get_by_id(&self, id: i64) -> Result<User> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM users WHERE id = ?1", COLUMNS),
                params![id],
                from_row,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("user {}", id)))
    }

    pub fn get_by_username(&self, username: &str) -> Result<User> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM users WHERE username = ?1", COLUMNS),
                params![username],
                from_row,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("user {}", username)))
    }
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        created_at: instant(row, 2)?,
        updated_at: instant(row, 3)?,
    })
}
