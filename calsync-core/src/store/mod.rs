//! SQLite-backed storage
//!
//! A single connection (WAL mode, foreign keys on) is shared behind a mutex.
//! Repositories borrow a `&Connection`, which may be a plain connection or an
//! open transaction, so the same repository code serves both read paths and
//! units of work.

mod calendars;
mod events;
mod schema;
mod tasks;
mod users;

pub use calendars::CalendarRepo;
pub use events::EventRepo;
pub use tasks::TaskRepo;
pub use users::UserRepo;

use crate::calendar::Calendar;
use crate::error::{Error, Result};
use crate::user::User;
use chrono::{DateTime, SubsecRound, Utc};
use rusqlite::{Connection, Row, Transaction, TransactionBehavior};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Name of the calendar every user gets at bootstrap
pub const DEFAULT_CALENDAR_NAME: &str = "default";
const DEFAULT_CALENDAR_DISPLAY_NAME: &str = "Calendar";

const DB_FILE_NAME: &str = "calendar.db";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of a committed unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied<T> {
    pub value: T,
    /// Calendar sync token after the commit
    pub sync_token: String,
}

/// Handle to the calendar database
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (creating if needed) `<data_dir>/calendar.db` and apply the schema.
    pub fn open(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir).map_err(|e| {
            Error::internal(&format!("failed to create data directory {:?}", data_dir), e)
        })?;
        let db_path = data_dir.join(DB_FILE_NAME);
        let conn = Connection::open(&db_path).map_err(|e| {
            Error::internal(&format!("failed to open SQLite database at {:?}", db_path), e)
        })?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        info!("Opened database at {:?}", db_path);
        Self::with_connection(conn)
    }

    /// Private in-memory database, mainly for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic mid-transaction drops the Transaction, which rolls back,
        // so the connection is consistent again once the guard is recovered.
        self.conn.lock().unwrap_or_else(|poisoned| {
            warn!("database mutex was poisoned; recovering connection");
            poisoned.into_inner()
        })
    }

    /// Current schema version recorded in the database.
    pub fn schema_version(&self) -> Result<i64> {
        schema::version(&self.conn())
    }

    /// Run `f` against the shared connection in autocommit mode.
    ///
    /// Each statement commits on its own; work that must change several rows
    /// atomically belongs in [`Database::transaction`].
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        f(&self.conn())
    }

    /// Run `f` inside an IMMEDIATE transaction, committing on `Ok`.
    ///
    /// The write lock is taken up front, so a read-check-write sequence in
    /// `f` cannot interleave with another writer.
    pub fn transaction<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| Error::internal("failed to begin transaction", e))?;
        let value = f(&tx)?;
        tx.commit()
            .map_err(|e| Error::internal("failed to commit transaction", e))?;
        Ok(value)
    }

    /// Apply one event mutation and advance the calendar's sync token in the
    /// same transaction.
    ///
    /// This is the only way to advance a sync token. If `f` fails, the
    /// calendar has disappeared, or `cancel` fires before commit, nothing is
    /// written.
    pub fn apply_event_change<T>(
        &self,
        calendar_id: i64,
        cancel: &CancellationToken,
        f: impl FnOnce(&EventRepo<'_>) -> Result<T>,
    ) -> Result<Applied<T>> {
        self.transaction(|tx| {
            let value = f(&EventRepo::new(tx))?;
            let sync_token = CalendarRepo::new(tx).bump_sync_version(calendar_id)?;
            if cancel.is_cancelled() {
                debug!("Unit of work for calendar {} cancelled before commit", calendar_id);
                return Err(Error::Internal("request cancelled before commit".into()));
            }
            Ok(Applied { value, sync_token })
        })
    }

    /// Ensure `username` exists and owns the default calendar.
    pub fn bootstrap(&self, username: &str) -> Result<(User, Calendar)> {
        self.transaction(|tx| {
            let users = UserRepo::new(tx);
            let user = match users.get_by_username(username) {
                Ok(user) => user,
                Err(Error::NotFound(_)) => {
                    let user = users.create(username)?;
                    info!("Created user {}", username);
                    user
                }
                Err(e) => return Err(e),
            };

            let calendars = CalendarRepo::new(tx);
            let calendar = match calendars.get_by_name(user.id, DEFAULT_CALENDAR_NAME) {
                Ok(calendar) => calendar,
                Err(Error::NotFound(_)) => {
                    let mut calendar = Calendar::new(
                        user.id,
                        DEFAULT_CALENDAR_NAME,
                        DEFAULT_CALENDAR_DISPLAY_NAME,
                    );
                    calendars.create(&mut calendar)?;
                    info!("Created default calendar for {}", username);
                    calendar
                }
                Err(e) => return Err(e),
            };

            Ok((user, calendar))
        })
    }
}

/// Current time at the storage resolution (whole seconds).
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

pub(crate) fn instant(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let secs: i64 = row.get(idx)?;
    DateTime::from_timestamp(secs, 0).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, secs))
}

pub(crate) fn opt_instant(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<i64>>(idx)? {
        Some(secs) => DateTime::from_timestamp(secs, 0)
            .map(Some)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, secs)),
        None => Ok(None),
    }
}

/// Empty strings are stored as NULL.
pub(crate) fn nullable(value: &str) -> Option<&str> {
    (!value.is_empty()).then_some(value)
}
