use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::models::{sort_by_timestamp, Screenshot, Session, SessionStatus};
use crate::report::SUMMARY_FILE_NAME;

const CURRENT_VERSION: i32 = 2;
const DB_FILE_NAME: &str = "sessions.db";

/// An `active` session older than this is presumed abandoned by a crashed
/// process and is completed by the next `start_session`. This is a wall-clock
/// guess, not a liveness probe.
pub const STALE_SESSION_MINUTES: i64 = 10;

const SESSION_COLUMNS: &str = "id, start_time, end_time, description, student_name, status";

pub struct Database {
    conn: Connection,
    base_dir: PathBuf,
}

impl Database {
    /// Opens (creating if needed) the store inside `base_dir`. Session
    /// directories are created alongside the database file.
    pub fn open<P: AsRef<Path>>(base_dir: P) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir)?;

        let conn = Connection::open(base_dir.join(DB_FILE_NAME))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let mut db = Database { conn, base_dir };
        db.init_schema()?;
        Ok(db)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn session_dir(&self, session_id: i64) -> PathBuf {
        self.base_dir.join(format!("session_{}", session_id))
    }

    fn init_schema(&mut self) -> Result<()> {
        let version: i32 = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;

        if version == 0 {
            self.create_initial_schema()?;
        }

        if version < 2 {
            self.migrate_to_v2()?;
        }

        debug!(version = CURRENT_VERSION, "session store schema ready");
        Ok(())
    }

    fn create_initial_schema(&self) -> Result<()> {
        // Tables may already exist from an older build that never set
        // user_version, hence IF NOT EXISTS and the v2 column check.
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                start_time TEXT NOT NULL,
                end_time TEXT,
                description TEXT,
                student_name TEXT,
                status TEXT NOT NULL DEFAULT 'active'
            );

            CREATE TABLE IF NOT EXISTS screenshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                file_path TEXT NOT NULL,
                file_size INTEGER NOT NULL,
                FOREIGN KEY (session_id) REFERENCES sessions (id)
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);
            CREATE INDEX IF NOT EXISTS idx_screenshots_session_time ON screenshots(session_id, timestamp);

            PRAGMA user_version = 1;",
        )?;
        Ok(())
    }

    fn migrate_to_v2(&self) -> Result<()> {
        let has_student_name: bool = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM pragma_table_info('sessions') WHERE name = 'student_name'",
                [],
                |row| row.get::<_, i64>(0),
            )
            .unwrap_or(0)
            > 0;

        if !has_student_name {
            self.conn
                .execute("ALTER TABLE sessions ADD COLUMN student_name TEXT", [])?;
        }

        self.conn.execute_batch("PRAGMA user_version = 2;")?;
        Ok(())
    }

    pub fn start_session(&self, description: &str, student_name: &str) -> Result<Session> {
        self.start_session_at(description, student_name, Utc::now())
    }

    pub(crate) fn start_session_at(
        &self,
        description: &str,
        student_name: &str,
        now: DateTime<Utc>,
    ) -> Result<Session> {
        // IMMEDIATE takes the write lock up front so the active check and the
        // insert cannot interleave with another process doing the same.
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;

        let active = query_sessions(
            &tx,
            &format!(
                "SELECT {} FROM sessions WHERE status = 'active' ORDER BY start_time DESC",
                SESSION_COLUMNS
            ),
            params![],
        )?;

        for session in &active {
            if now - session.start_time <= Duration::minutes(STALE_SESSION_MINUTES) {
                return Err(Error::AlreadyActive { id: session.id });
            }
        }

        for session in &active {
            warn!(
                session_id = session.id,
                started = %session.start_time.format("%Y-%m-%d %H:%M:%S"),
                "found stale session, marking it completed"
            );
            complete_session(&tx, session, now)?;
        }

        tx.execute(
            "INSERT INTO sessions (start_time, description, student_name, status)
             VALUES (?, ?, ?, ?)",
            params![
                format_timestamp(now),
                description,
                student_name,
                SessionStatus::Active.as_str()
            ],
        )?;
        let id = tx.last_insert_rowid();

        // Rolls back with the transaction if the directory cannot be made.
        let dir = self.session_dir(id);
        fs::create_dir_all(&dir)?;
        tx.commit()?;

        info!(session_id = id, dir = %dir.display(), "session started");

        Ok(Session {
            id,
            start_time: now,
            end_time: None,
            description: description.to_string(),
            student_name: student_name.to_string(),
            status: SessionStatus::Active,
        })
    }

    pub fn stop_session(&self, session_id: i64) -> Result<Session> {
        self.stop_session_at(session_id, Utc::now())
    }

    pub(crate) fn stop_session_at(&self, session_id: i64, now: DateTime<Utc>) -> Result<Session> {
        let session = self.get_session(session_id)?;
        if !session.is_active() {
            return Err(Error::NoActiveSession);
        }

        let end_time = complete_session(&self.conn, &session, now)?.ok_or(Error::NoActiveSession)?;
        info!(
            session_id,
            duration_secs = (end_time - session.start_time).num_seconds(),
            "session stopped"
        );

        Ok(Session {
            end_time: Some(end_time),
            status: SessionStatus::Completed,
            ..session
        })
    }

    pub fn record_screenshot<P: AsRef<Path>>(&self, session_id: i64, path: P) -> Result<Screenshot> {
        self.record_screenshot_at(session_id, path, Utc::now())
    }

    pub(crate) fn record_screenshot_at<P: AsRef<Path>>(
        &self,
        session_id: i64,
        path: P,
        timestamp: DateTime<Utc>,
    ) -> Result<Screenshot> {
        let path = path.as_ref();

        let status: Option<String> = self
            .conn
            .query_row(
                "SELECT status FROM sessions WHERE id = ?",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        if status.as_deref() != Some(SessionStatus::Active.as_str()) {
            return Err(Error::NoActiveSession);
        }

        let file_size = fs::metadata(path)
            .map_err(|source| Error::FileUnreadable {
                path: path.to_path_buf(),
                source,
            })?
            .len();

        self.conn.execute(
            "INSERT INTO screenshots (session_id, timestamp, file_path, file_size)
             VALUES (?, ?, ?, ?)",
            params![
                session_id,
                format_timestamp(timestamp),
                path.to_string_lossy(),
                file_size as i64
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        debug!(session_id, screenshot_id = id, file_size, "screenshot recorded");

        Ok(Screenshot {
            id,
            session_id,
            timestamp,
            file_path: path.to_path_buf(),
            file_size,
        })
    }

    pub fn get_active_session(&self) -> Result<Option<Session>> {
        let mut sessions = query_sessions(
            &self.conn,
            &format!(
                "SELECT {} FROM sessions WHERE status = 'active' ORDER BY start_time DESC LIMIT 1",
                SESSION_COLUMNS
            ),
            params![],
        )?;
        Ok(sessions.pop())
    }

    pub fn get_session(&self, session_id: i64) -> Result<Session> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM sessions WHERE id = ?", SESSION_COLUMNS),
                params![session_id],
                session_from_row,
            )
            .optional()?
            .ok_or(Error::NotFound(session_id))
    }

    /// Screenshots of a session, ascending by capture time.
    pub fn get_session_screenshots(&self, session_id: i64) -> Result<Vec<Screenshot>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, session_id, timestamp, file_path, file_size
             FROM screenshots WHERE session_id = ?",
        )?;

        let mut screenshots = stmt
            .query_map(params![session_id], |row| {
                Ok(Screenshot {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    timestamp: parse_timestamp(2, &row.get::<_, String>(2)?)?,
                    file_path: PathBuf::from(row.get::<_, String>(3)?),
                    file_size: row.get::<_, i64>(4)?.max(0) as u64,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        sort_by_timestamp(&mut screenshots);
        Ok(screenshots)
    }

    /// Completed sessions, newest first. `limit <= 0` means unbounded.
    pub fn list_completed_sessions(&self, limit: i64) -> Result<Vec<Session>> {
        query_sessions(
            &self.conn,
            &format!(
                "SELECT {} FROM sessions WHERE status = 'completed'
                 ORDER BY start_time DESC LIMIT ?",
                SESSION_COLUMNS
            ),
            params![sql_limit(limit)],
        )
    }

    pub fn list_completed_sessions_for_student(
        &self,
        student_name: &str,
        limit: i64,
    ) -> Result<Vec<Session>> {
        query_sessions(
            &self.conn,
            &format!(
                "SELECT {} FROM sessions WHERE student_name = ? AND status = 'completed'
                 ORDER BY start_time DESC LIMIT ?",
                SESSION_COLUMNS
            ),
            params![student_name, sql_limit(limit)],
        )
    }

    /// Completed sessions whose directory has no summary yet.
    pub fn list_unanalyzed_sessions(&self) -> Result<Vec<Session>> {
        Ok(self
            .list_completed_sessions(0)?
            .into_iter()
            .filter(|s| !self.session_dir(s.id).join(SUMMARY_FILE_NAME).exists())
            .collect())
    }

    pub fn export_session_data<P: AsRef<Path>>(&self, session_id: i64, output: P) -> Result<()> {
        #[derive(Serialize)]
        struct Export {
            session: Session,
            screenshots: Vec<Screenshot>,
        }

        let export = Export {
            session: self.get_session(session_id)?,
            screenshots: self.get_session_screenshots(session_id)?,
        };
        fs::write(output.as_ref(), serde_json::to_string_pretty(&export)?)?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }
}

/// Moves `session` to completed. Returns the end time written, or `None` if
/// the row was no longer active.
fn complete_session(
    conn: &Connection,
    session: &Session,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    let end_time = now.max(session.start_time);
    let updated = conn.execute(
        "UPDATE sessions SET end_time = ?, status = 'completed'
         WHERE id = ? AND status = 'active'",
        params![format_timestamp(end_time), session.id],
    )?;
    Ok((updated > 0).then_some(end_time))
}

fn query_sessions(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<Session>> {
    let mut stmt = conn.prepare(sql)?;
    let sessions = stmt
        .query_map(params, session_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(sessions)
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    let status: String = row.get(5)?;
    Ok(Session {
        id: row.get(0)?,
        start_time: parse_timestamp(1, &row.get::<_, String>(1)?)?,
        end_time: row
            .get::<_, Option<String>>(2)?
            .map(|s| parse_timestamp(2, &s))
            .transpose()?,
        description: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        student_name: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        status: SessionStatus::parse(&status).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                Type::Text,
                format!("unknown session status '{}'", status).into(),
            )
        })?,
    })
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

// SQLite treats a negative LIMIT as "no limit".
fn sql_limit(limit: i64) -> i64 {
    if limit > 0 {
        limit
    } else {
        -1
    }
}
