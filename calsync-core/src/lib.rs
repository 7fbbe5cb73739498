//! calsync Core Library
//!
//! Core functionality for calsync including:
//! - Domain model (User, Calendar, Event, Task)
//! - iCalendar metadata extraction and canonical encoding
//! - Content fingerprints used as entity tags
//! - SQLite repositories (rusqlite, WAL mode) with optimistic concurrency
//! - The unit of work coupling event mutations with calendar sync tokens

pub mod calendar;
pub mod error;
pub mod event;
pub mod fingerprint;
pub mod ics;
pub mod store;
pub mod task;
pub mod user;

pub use calendar::Calendar;
pub use error::{Error, Result};
pub use event::{Event, EventStatus};
pub use fingerprint::fingerprint;
pub use ics::EventMetadata;
pub use store::{
    Applied, CalendarRepo, Database, EventRepo, TaskRepo, UserRepo, DEFAULT_CALENDAR_NAME,
};
pub use task::Task;
pub use user::User;
