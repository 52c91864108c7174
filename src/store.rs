//! Stage 1 platform activity store over SQLite.
//!
//! Read side consumed by the pipeline (courses, enrolments, activity
//! existence queries) plus the write side used by seeding and tests.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use crate::analysable::{Analysable, Context, ContextLevel, EntityError};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid stored value: {0}")]
    InvalidValue(#[from] EntityError),
}

/// One raw activity event. The log is append-only; events carry the
/// context they happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityEvent {
    pub user_id: i64,
    pub context: Context,
    pub ts_utc: i64,
}

/// Read-side queries the analyser, indicators and targets run against the
/// platform. Object safe; the pipeline only ever holds `&dyn ActivityStore`.
pub trait ActivityStore {
    /// One analysable per course, ordered by id.
    fn courses(&self) -> Result<Vec<Analysable>, StoreError>;

    /// Deduplicated, ordered user ids enrolled in a course.
    fn enrolled_users(&self, course_id: i64) -> Result<Vec<i64>, StoreError>;

    /// Every user id known to the platform (site-scope row universe).
    fn all_user_ids(&self) -> Result<Vec<i64>, StoreError>;

    /// Min and max activity timestamp across the whole log, if any.
    fn activity_bounds(&self) -> Result<Option<(i64, i64)>, StoreError>;

    /// Whether the user has at least one event in the context within
    /// `[from, to)`. A `System` context matches activity anywhere. `None`
    /// bounds leave that side of the window open.
    fn has_activity(
        &self,
        user_id: i64,
        context: Context,
        from_ts_utc: Option<i64>,
        to_ts_utc_exclusive: Option<i64>,
    ) -> Result<bool, StoreError>;
}

pub struct SqliteActivityStore {
    conn: Connection,
}

impl SqliteActivityStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA temp_store=MEMORY;
            ",
        )?;
        ensure_platform_schema(&conn)?;

        Ok(Self { conn })
    }

    pub fn upsert_course(&mut self, course: &Analysable) -> Result<(), StoreError> {
        self.conn.execute(
            "
            INSERT INTO courses (course_id, start_ts_utc, end_ts_utc)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(course_id) DO UPDATE SET
                start_ts_utc = excluded.start_ts_utc,
                end_ts_utc = excluded.end_ts_utc
            ",
            params![course.id, course.start_ts_utc, course.end_ts_utc],
        )?;
        Ok(())
    }

    pub fn enrol_user(&mut self, course_id: i64, user_id: i64) -> Result<(), StoreError> {
        self.conn.execute(
            "
            INSERT INTO enrolments (course_id, user_id)
            VALUES (?1, ?2)
            ON CONFLICT(course_id, user_id) DO NOTHING
            ",
            params![course_id, user_id],
        )?;
        Ok(())
    }

    pub fn record_activity_batch(&mut self, events: &[ActivityEvent]) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "
                INSERT INTO activity_log (user_id, context_level, context_id, ts_utc)
                VALUES (?1, ?2, ?3, ?4)
                ",
            )?;

            for event in events {
                stmt.execute(params![
                    event.user_id,
                    event.context.level.as_str(),
                    event.context.instance_id,
                    event.ts_utc,
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    pub fn count_activity(&self) -> Result<u64, StoreError> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM activity_log", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

impl ActivityStore for SqliteActivityStore {
    fn courses(&self) -> Result<Vec<Analysable>, StoreError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT course_id, start_ts_utc, end_ts_utc
            FROM courses
            ORDER BY course_id
            ",
        )?;
        let mut rows = stmt.query([])?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let course_id: i64 = row.get(0)?;
            out.push(Analysable {
                id: course_id,
                context: Context::course(course_id),
                start_ts_utc: row.get(1)?,
                end_ts_utc: row.get(2)?,
            });
        }
        Ok(out)
    }

    fn enrolled_users(&self, course_id: i64) -> Result<Vec<i64>, StoreError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT DISTINCT user_id
            FROM enrolments
            WHERE course_id = ?1
            ORDER BY user_id
            ",
        )?;
        let mut rows = stmt.query(params![course_id])?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row.get(0)?);
        }
        Ok(out)
    }

    fn all_user_ids(&self) -> Result<Vec<i64>, StoreError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT DISTINCT user_id
            FROM enrolments
            ORDER BY user_id
            ",
        )?;
        let mut rows = stmt.query([])?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row.get(0)?);
        }
        Ok(out)
    }

    fn activity_bounds(&self) -> Result<Option<(i64, i64)>, StoreError> {
        let (min, max): (Option<i64>, Option<i64>) = self.conn.query_row(
            "SELECT MIN(ts_utc), MAX(ts_utc) FROM activity_log",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        match (min, max) {
            (Some(min), Some(max)) => Ok(Some((min, max))),
            _ => Ok(None),
        }
    }

    fn has_activity(
        &self,
        user_id: i64,
        context: Context,
        from_ts_utc: Option<i64>,
        to_ts_utc_exclusive: Option<i64>,
    ) -> Result<bool, StoreError> {
        let hit = match context.level {
            ContextLevel::System => self
                .conn
                .query_row(
                    "
                    SELECT 1
                    FROM activity_log
                    WHERE user_id = ?1
                      AND (?2 IS NULL OR ts_utc >= ?2)
                      AND (?3 IS NULL OR ts_utc < ?3)
                    LIMIT 1
                    ",
                    params![user_id, from_ts_utc, to_ts_utc_exclusive],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?,
            ContextLevel::Course => self
                .conn
                .query_row(
                    "
                    SELECT 1
                    FROM activity_log
                    WHERE user_id = ?1
                      AND context_level = 'course'
                      AND context_id = ?2
                      AND (?3 IS NULL OR ts_utc >= ?3)
                      AND (?4 IS NULL OR ts_utc < ?4)
                    LIMIT 1
                    ",
                    params![
                        user_id,
                        context.instance_id,
                        from_ts_utc,
                        to_ts_utc_exclusive
                    ],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?,
        };
        Ok(hit.is_some())
    }
}

fn ensure_platform_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS courses (
            course_id INTEGER PRIMARY KEY,
            start_ts_utc INTEGER,
            end_ts_utc INTEGER
        );
        CREATE TABLE IF NOT EXISTS enrolments (
            course_id INTEGER NOT NULL,
            user_id INTEGER NOT NULL,
            PRIMARY KEY(course_id, user_id)
        ) WITHOUT ROWID;
        CREATE TABLE IF NOT EXISTS activity_log (
            user_id INTEGER NOT NULL,
            context_level TEXT NOT NULL,
            context_id INTEGER NOT NULL,
            ts_utc INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_activity_user_ctx_ts
            ON activity_log (user_id, context_level, context_id, ts_utc);
        CREATE INDEX IF NOT EXISTS idx_activity_ts
            ON activity_log (ts_utc);
        ",
    )?;
    Ok(())
}
