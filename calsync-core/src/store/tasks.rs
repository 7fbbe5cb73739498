use super::{instant, now, nullable, opt_instant};
use crate::error::{is_foreign_key_violation, Error, Result};
use crate::task::Task;
use rusqlite::{params, Connection, OptionalExtension, Row};

const COLUMNS: &str = "id, user_id, external_id, content, description, priority, due_date, \
     completed, completed_at, created_at, updated_at";

pub struct TaskRepo<'c> {
    conn: &'c Connection,
}

impl<'c> TaskRepo<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn create(&self, task: &mut Task) -> Result<()> {
        task.validate()?;
        let ts = now();
        self.conn
            .execute(
                "INSERT INTO tasks (user_id, external_id, content, description, priority, \
                 due_date, completed, completed_at, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                params![
                    task.user_id,
                    task.external_id,
                    task.content,
                    nullable(&task.description),
                    task.priority,
                    task.due_date.map(|t| t.timestamp()),
                    task.completed,
                    task.completed_at.map(|t| t.timestamp()),
                    ts.timestamp(),
                ],
            )
            .map_err(|e| {
                if is_foreign_key_violation(&e) {
                    Error::Validation(format!("user {} does not exist", task.user_id))
                } else {
                    e.into()
                }
            })?;
        task.id = self.conn.last_insert_rowid();
        task.created_at = ts;
        task.updated_at = ts;
        Ok(())
    }

    pub fn get_by_id(&self, id: i64) -> Result<Task> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM tasks WHERE id = ?1", COLUMNS),
                params![id],
                from_row,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("task {}", id)))
    }

    pub fn list_by_user(&self, user_id: i64) -> Result<Vec<Task>> {
        self.query(
            &format!(
                "SELECT {} FROM tasks WHERE user_id = ?1 ORDER BY created_at, id",
                COLUMNS
            ),
            user_id,
        )
    }

    /// Open tasks, soonest due first (undated last), then most urgent.
    pub fn list_pending(&self, user_id: i64) -> Result<Vec<Task>> {
        self.query(
            &format!(
                "SELECT {} FROM tasks WHERE user_id = ?1 AND completed = 0 \
                 ORDER BY due_date IS NULL, due_date, priority DESC, id",
                COLUMNS
            ),
            user_id,
        )
    }

    pub fn update(&self, task: &mut Task) -> Result<()> {
        task.validate()?;
        let ts = now();
        let changed = self.conn.execute(
            "UPDATE tasks SET external_id = ?1, content = ?2, description = ?3, priority = ?4, \
             due_date = ?5, completed = ?6, completed_at = ?7, updated_at = ?8 WHERE id = ?9",
            params![
                task.external_id,
                task.content,
                nullable(&task.description),
                task.priority,
                task.due_date.map(|t| t.timestamp()),
                task.completed,
                task.completed_at.map(|t| t.timestamp()),
                ts.timestamp(),
                task.id,
            ],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("task {}", task.id)));
        }
        task.updated_at = ts;
        Ok(())
    }

    pub fn delete(&self, id: i64) -> Result<()> {
        let changed = self
            .conn
            .execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(Error::NotFound(format!("task {}", id)));
        }
        Ok(())
    }

    fn query(&self, sql: &str, user_id: i64) -> Result<Vec<Task>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params![user_id], from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        user_id: row.get(1)?,
        external_id: row.get(2)?,
        content: row.get(3)?,
        description: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        priority: row.get(5)?,
        due_date: opt_instant(row, 6)?,
        completed: row.get(7)?,
        completed_at: opt_instant(row, 8)?,
        created_at: instant(row, 9)?,
        updated_at: instant(row, 10)?,
    })
}
