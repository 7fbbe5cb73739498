//! Calendar collections and their sync tokens

use super::{instant, now, nullable};
use crate::calendar::Calendar;
use crate::error::{is_foreign_key_violation, is_unique_violation, Error, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};

const COLUMNS: &str =
    "id, user_id, name, display_name, color, description, sync_token, created_at, updated_at";

pub struct CalendarRepo<'c> {
    conn: &'c Connection,
}

impl<'c> CalendarRepo<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Insert `calendar`, assigning its id and timestamps.
    pub fn create(&self, calendar: &mut Calendar) -> Result<()> {
        calendar.validate()?;
        let ts = now();
        self.conn
            .execute(
                "INSERT INTO calendars \
                 (user_id, name, display_name, color, description, sync_token, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, '', ?6, ?6)",
                params![
                    calendar.user_id,
                    calendar.name,
                    nullable(&calendar.display_name),
                    nullable(&calendar.color),
                    nullable(&calendar.description),
                    ts.timestamp(),
                ],
            )
            .map_err(|e| self.write_error(e, calendar))?;
        calendar.id = self.conn.last_insert_rowid();
        calendar.sync_token.clear();
        calendar.created_at = ts;
        calendar.updated_at = ts;
        Ok(())
    }

    pub fn get_by_id(&self, id: i64) -> Result<Calendar> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM calendars WHERE id = ?1", COLUMNS),
                params![id],
                from_row,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("calendar {}", id)))
    }

    pub fn get_by_name(&self, user_id: i64, name: &str) -> Result<Calendar> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM calendars WHERE user_id = ?1 AND name = ?2",
                    COLUMNS
                ),
                params![user_id, name],
                from_row,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("calendar {}", name)))
    }

    /// All calendars of a user, in creation order.
    pub fn list_by_user(&self, user_id: i64) -> Result<Vec<Calendar>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {} FROM calendars WHERE user_id = ?1 ORDER BY created_at, id",
            COLUMNS
        ))?;
        let rows = stmt.query_map(params![user_id], from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Update name, display name, color and description. The sync token is
    /// left alone.
    pub fn update(&self, calendar: &mut Calendar) -> Result<()> {
        calendar.validate()?;
        let ts = now();
        let changed = self
            .conn
            .execute(
                "UPDATE calendars SET name = ?1, display_name = ?2, color = ?3, description = ?4, \
                 updated_at = ?5 WHERE id = ?6",
                params![
                    calendar.name,
                    nullable(&calendar.display_name),
                    nullable(&calendar.color),
                    nullable(&calendar.description),
                    ts.timestamp(),
                    calendar.id,
                ],
            )
            .map_err(|e| self.write_error(e, calendar))?;
        if changed == 0 {
            return Err(Error::NotFound(format!("calendar {}", calendar.id)));
        }
        calendar.updated_at = ts;
        Ok(())
    }

    /// Delete a calendar and, by cascade, its events.
    pub fn delete(&self, id: i64) -> Result<()> {
        let changed = self
            .conn
            .execute("DELETE FROM calendars WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(Error::NotFound(format!("calendar {}", id)));
        }
        Ok(())
    }

    /// Advance the sync token to `v<unix-nanos>`, strictly past the previous
    /// token even if the clock has not moved or went backwards.
    pub(crate) fn bump_sync_version(&self, calendar_id: i64) -> Result<String> {
        let previous: String = self
            .conn
            .query_row(
                "SELECT sync_token FROM calendars WHERE id = ?1",
                params![calendar_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("calendar {}", calendar_id)))?;

        let floor = previous
            .strip_prefix('v')
            .and_then(|n| n.parse::<i64>().ok())
            .map_or(0, |n| n.saturating_add(1));
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        let token = format!("v{}", nanos.max(floor));

        self.conn.execute(
            "UPDATE calendars SET sync_token = ?1, updated_at = ?2 WHERE id = ?3",
            params![token, now().timestamp(), calendar_id],
        )?;
        Ok(token)
    }

    fn write_error(&self, err: rusqlite::Error, calendar: &Calendar) -> Error {
        if is_unique_violation(&err) {
            Error::Conflict(format!("calendar {} already exists", calendar.name))
        } else if is_foreign_key_violation(&err) {
            Error::Validation(format!("user {} does not exist", calendar.user_id))
        } else {
            err.into()
        }
    }
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<Calendar> {
    Ok(Calendar {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        display_name: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        color: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        description: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        sync_token: row.get(6)?,
        created_at: instant(row, 7)?,
        updated_at: instant(row, 8)?,
    })
}
