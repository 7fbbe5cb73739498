//! Event resources with optimistic concurrency on update

use super::{instant, now, nullable, opt_instant};
use crate::error::{is_foreign_key_violation, is_unique_violation, Error, Result};
use crate::event::{Event, EventStatus};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

const COLUMNS: &str = "id, calendar_id, uid, ics, summary, description, location, start_time, \
     end_time, all_day, recurrence_rule, etag, sequence, status, created_at, updated_at";

pub struct EventRepo<'c> {
    conn: &'c Connection,
}

impl<'c> EventRepo<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Insert `event`, assigning its id and timestamps.
    pub fn create(&self, event: &mut Event) -> Result<()> {
        event.validate()?;
        let ts = now();
        self.conn
            .execute(
                "INSERT INTO events (calendar_id, uid, ics, summary, description, location, \
                 start_time, end_time, all_day, recurrence_rule, etag, sequence, status, \
                 created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)",
                params![
                    event.calendar_id,
                    event.uid,
                    event.ics,
                    nullable(&event.summary),
                    nullable(&event.description),
                    nullable(&event.location),
                    event.start_time.timestamp(),
                    event.end_time.map(|t| t.timestamp()),
                    event.all_day,
                    event.recurrence_rule,
                    event.fingerprint,
                    event.sequence,
                    event.status.as_str(),
                    ts.timestamp(),
                ],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    Error::Conflict(format!("event {} already exists", event.uid))
                } else if is_foreign_key_violation(&e) {
                    Error::NotFound(format!("calendar {}", event.calendar_id))
                } else {
                    e.into()
                }
            })?;
        event.id = self.conn.last_insert_rowid();
        event.created_at = ts;
        event.updated_at = ts;
        Ok(())
    }

    pub fn get_by_uid(&self, calendar_id: i64, uid: &str) -> Result<Event> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM events WHERE calendar_id = ?1 AND uid = ?2",
                    COLUMNS
                ),
                params![calendar_id, uid],
                from_row,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("event {}", uid)))
    }

    pub fn get_by_id(&self, id: i64) -> Result<Event> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM events WHERE id = ?1", COLUMNS),
                params![id],
                from_row,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("event {}", id)))
    }

    /// Events overlapping the half-open window `[start, end)`, by start time.
    /// An event without an end occupies the single instant of its start.
    pub fn list_in_range(
        &self,
        calendar_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Event>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {} FROM events WHERE calendar_id = ?1 AND start_time < ?3 \
             AND COALESCE(end_time, start_time) > ?2 ORDER BY start_time, id",
            COLUMNS
        ))?;
        // stored instants are whole seconds; round the exclusive end up
        let end_secs = end.timestamp() + i64::from(end.timestamp_subsec_nanos() > 0);
        let rows = stmt.query_map(
            params![calendar_id, start.timestamp(), end_secs],
            from_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn list_all(&self, calendar_id: i64) -> Result<Vec<Event>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {} FROM events WHERE calendar_id = ?1 ORDER BY start_time, id",
            COLUMNS
        ))?;
        let rows = stmt.query_map(params![calendar_id], from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Overwrite the stored event if its fingerprint still equals
    /// `expected_fingerprint`.
    ///
    /// The check and the write run in one transaction: the caller's, or a
    /// private one when the connection is in autocommit mode.
    pub fn update(&self, event: &mut Event, expected_fingerprint: &str) -> Result<()> {
        event.validate()?;
        if self.conn.is_autocommit() {
            let tx = self
                .conn
                .unchecked_transaction()
                .map_err(|e| Error::internal("failed to begin transaction", e))?;
            self.update_checked(event, expected_fingerprint)?;
            tx.commit()
                .map_err(|e| Error::internal("failed to commit transaction", e))
        } else {
            self.update_checked(event, expected_fingerprint)
        }
    }

    fn update_checked(&self, event: &mut Event, expected_fingerprint: &str) -> Result<()> {
        let stored: String = self
            .conn
            .query_row(
                "SELECT etag FROM events WHERE calendar_id = ?1 AND uid = ?2",
                params![event.calendar_id, event.uid],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("event {}", event.uid)))?;

        if stored != expected_fingerprint {
            debug!(
                "Fingerprint mismatch on {}: expected {}, stored {}",
                event.uid, expected_fingerprint, stored
            );
            return Err(Error::PreconditionFailed(format!(
                "event {} was modified concurrently",
                event.uid
            )));
        }

        let ts = now();
        self.conn.execute(
            "UPDATE events SET ics = ?1, summary = ?2, description = ?3, location = ?4, \
             start_time = ?5, end_time = ?6, all_day = ?7, recurrence_rule = ?8, etag = ?9, \
             sequence = ?10, status = ?11, updated_at = ?12 \
             WHERE calendar_id = ?13 AND uid = ?14",
            params![
                event.ics,
                nullable(&event.summary),
                nullable(&event.description),
                nullable(&event.location),
                event.start_time.timestamp(),
                event.end_time.map(|t| t.timestamp()),
                event.all_day,
                event.recurrence_rule,
                event.fingerprint,
                event.sequence,
                event.status.as_str(),
                ts.timestamp(),
                event.calendar_id,
                event.uid,
            ],
        )?;
        event.updated_at = ts;
        Ok(())
    }

    pub fn delete(&self, calendar_id: i64, uid: &str) -> Result<()> {
        let changed = self.conn.execute(
            "DELETE FROM events WHERE calendar_id = ?1 AND uid = ?2",
            params![calendar_id, uid],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("event {}", uid)));
        }
        Ok(())
    }
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<Event> {
    Ok(Event {
        id: row.get(0)?,
        calendar_id: row.get(1)?,
        uid: row.get(2)?,
        ics: row.get(3)?,
        summary: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        description: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        location: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
        start_time: instant(row, 7)?,
        end_time: opt_instant(row, 8)?,
        all_day: row.get(9)?,
        recurrence_rule: row.get(10)?,
        fingerprint: row.get(11)?,
        sequence: row.get(12)?,
        status: EventStatus::parse(&row.get::<_, String>(13)?),
        created_at: instant(row, 14)?,
        updated_at: instant(row, 15)?,
    })
}
