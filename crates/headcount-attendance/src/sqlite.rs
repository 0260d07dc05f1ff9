//! SQLite-backed roster and attendance store.

use crate::event::{AttendanceEvent, AttendanceStatus, EventId, EventPatch, NewEvent};
use crate::store::{RecordStore, StoreError};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use headcount_core::{EnrolledStudent, FaceDescriptor, StudentId};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use std::path::Path;

const DATE_FMT: &str = "%Y-%m-%d";
const TIME_FMT: &str = "%H:%M:%S";
const DATETIME_FMT: &str = "%Y-%m-%d %H:%M:%S";

const SCHEMA_SQL: &str = "
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS students (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    code          TEXT UNIQUE NOT NULL,
    display_name  TEXT NOT NULL,
    face_encoding TEXT,
    status        TEXT NOT NULL DEFAULT 'active',
    revision      INTEGER NOT NULL DEFAULT 0,
    created_at    TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at    TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS attendance (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    student_id      INTEGER NOT NULL REFERENCES students(id),
    attendance_date TEXT NOT NULL,
    time_in         TEXT,
    time_out        TEXT,
    status          TEXT NOT NULL,
    confidence      REAL NOT NULL,
    photo_path      TEXT,
    created_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_attendance_date ON attendance(attendance_date);
CREATE INDEX IF NOT EXISTS idx_attendance_student ON attendance(student_id);
CREATE INDEX IF NOT EXISTS idx_student_status ON students(status);
";

const EVENT_COLUMNS: &str =
    "id, student_id, attendance_date, time_in, time_out, status, confidence, photo_path, created_at";

/// A roster row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StudentRecord {
    pub id: StudentId,
    /// School-issued student number.
    pub code: String,
    pub display_name: String,
    #[serde(skip)]
    pub face_encoding: Option<String>,
    pub active: bool,
}

impl StudentRecord {
    pub fn has_face(&self) -> bool {
        self.face_encoding.is_some()
    }
}

impl From<StudentRecord> for EnrolledStudent {
    fn from(record: StudentRecord) -> Self {
        EnrolledStudent {
            id: record.id,
            display_name: record.display_name,
            face_encoding: record.face_encoding,
        }
    }
}

/// Roster data for an insert-or-update keyed on `code`.
#[derive(Debug, Clone)]
pub struct NewStudent {
    pub code: String,
    pub display_name: String,
    pub descriptor: Option<FaceDescriptor>,
}

/// Roster and attendance tables in one SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
    conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
    /// Open (or create) the database file and apply the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("create {}: {e}", parent.display()))
            })?;
        }

        let conn = tokio_rusqlite::Connection::open(path).await?;
        conn.call(|conn| {
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            })?;
            Ok(())
        })
        .await?;

        let store = Self { conn };
        store.migrate().await?;
        tracing::info!(path = %path.display(), "attendance database opened");
        Ok(store)
    }

    /// Open a private in-memory database.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = tokio_rusqlite::Connection::open_in_memory().await?;
        let store = Self { conn };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(SCHEMA_SQL)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // --- Roster ---

    /// Insert a student, or update name and face of the one with the same
    /// code. Re-activates a deactivated student.
    pub async fn upsert_student(&self, student: NewStudent) -> Result<StudentId, StoreError> {
        let encoding = student.descriptor.as_ref().map(FaceDescriptor::to_json);
        let id = self
            .conn
            .call(move |conn| {
                let id = conn.query_row(
                    "INSERT INTO students (code, display_name, face_encoding, revision)
                     VALUES (?1, ?2, ?3, (SELECT COALESCE(MAX(revision), 0) + 1 FROM students))
                     ON CONFLICT(code) DO UPDATE SET
                         display_name = excluded.display_name,
                         face_encoding = COALESCE(excluded.face_encoding, students.face_encoding),
                         status = 'active',
                         revision = (SELECT MAX(revision) + 1 FROM students),
                         updated_at = CURRENT_TIMESTAMP
                     RETURNING id",
                    params![student.code, student.display_name, encoding],
                    |row| row.get::<_, i64>(0),
                )?;
                Ok(id)
            })
            .await?;
        Ok(StudentId(id))
    }

    /// Active students in roster order, the order the registry indexes them.
    pub async fn active_students(&self) -> Result<Vec<StudentRecord>, StoreError> {
        self.select_students("WHERE status = 'active' ORDER BY id").await
    }

    /// Every student, active or not, ordered by code.
    pub async fn all_students(&self) -> Result<Vec<StudentRecord>, StoreError> {
        self.select_students("ORDER BY code").await
    }

    pub async fn student_by_code(&self, code: &str) -> Result<Option<StudentRecord>, StoreError> {
        let code = code.to_string();
        let record = self
            .conn
            .call(move |conn| {
                let record = conn
                    .query_row(
                        "SELECT id, code, display_name, face_encoding, status
                         FROM students WHERE code = ?1",
                        params![code],
                        decode_student,
                    )
                    .optional()?;
                Ok(record)
            })
            .await?;
        Ok(record)
    }

    /// Mark a student inactive. Their attendance history is kept.
    /// Returns `false` when no student has that code.
    pub async fn deactivate_student(&self, code: &str) -> Result<bool, StoreError> {
        let code = code.to_string();
        let changed = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE students SET
                         status = 'inactive',
                         revision = (SELECT MAX(revision) + 1 FROM students),
                         updated_at = CURRENT_TIMESTAMP
                     WHERE code = ?1",
                    params![code],
                )?;
                Ok(changed)
            })
            .await?;
        Ok(changed > 0)
    }

    /// Roster revision. Every upsert or deactivation moves it forward, so a
    /// changed value means the registry is stale.
    pub async fn roster_revision(&self) -> Result<i64, StoreError> {
        let revision = self
            .conn
            .call(|conn| {
                let revision = conn.query_row(
                    "SELECT COALESCE(MAX(revision), 0) FROM students",
                    [],
                    |row| row.get::<_, i64>(0),
                )?;
                Ok(revision)
            })
            .await?;
        Ok(revision)
    }

    async fn select_students(&self, tail: &'static str) -> Result<Vec<StudentRecord>, StoreError> {
        let rows = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT id, code, display_name, face_encoding, status FROM students {tail}"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([], decode_student)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    async fn select_events<P>(
        &self,
        filter: &'static str,
        args: P,
    ) -> Result<Vec<AttendanceEvent>, StoreError>
    where
        P: rusqlite::Params + Send + 'static,
    {
        let rows = self
            .conn
            .call(move |conn| {
                let sql = format!("SELECT {EVENT_COLUMNS} FROM attendance {filter}");
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(args, decode_event)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }
}

impl RecordStore for SqliteStore {
    async fn insert_event(&self, event: NewEvent) -> Result<EventId, StoreError> {
        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO attendance
                         (student_id, attendance_date, time_in, status, confidence, photo_path, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        event.student_id.0,
                        event.date.format(DATE_FMT).to_string(),
                        event.time_in.format(TIME_FMT).to_string(),
                        event.status.as_str(),
                        event.confidence as f64,
                        event.photo_path,
                        event.created_at.format(DATETIME_FMT).to_string(),
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        Ok(EventId(id))
    }

    async fn update_event(&self, id: EventId, patch: EventPatch) -> Result<(), StoreError> {
        let changed = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE attendance SET
                         time_out = COALESCE(?1, time_out),
                         confidence = COALESCE(?2, confidence),
                         photo_path = COALESCE(?3, photo_path)
                     WHERE id = ?4",
                    params![
                        patch.time_out.map(|t| t.format(TIME_FMT).to_string()),
                        patch.confidence.map(f64::from),
                        patch.photo_path,
                        id.0,
                    ],
                )?;
                Ok(changed)
            })
            .await?;

        if changed == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn find_open_event(
        &self,
        student_id: StudentId,
        date: NaiveDate,
    ) -> Result<Option<AttendanceEvent>, StoreError> {
        let rows = self
            .select_events(
                "WHERE student_id = ?1 AND attendance_date = ?2
                   AND time_in IS NOT NULL AND time_out IS NULL
                 ORDER BY id DESC LIMIT 1",
                (student_id.0, date.format(DATE_FMT).to_string()),
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn events_for_day(
        &self,
        student_id: StudentId,
        date: NaiveDate,
    ) -> Result<Vec<AttendanceEvent>, StoreError> {
        self.select_events(
            "WHERE student_id = ?1 AND attendance_date = ?2 ORDER BY id",
            (student_id.0, date.format(DATE_FMT).to_string()),
        )
        .await
    }

    async fn events_on(&self, date: NaiveDate) -> Result<Vec<AttendanceEvent>, StoreError> {
        self.select_events(
            "WHERE attendance_date = ?1 ORDER BY id DESC",
            (date.format(DATE_FMT).to_string(),),
        )
        .await
    }

    async fn events_between(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<AttendanceEvent>, StoreError> {
        self.select_events(
            "WHERE attendance_date BETWEEN ?1 AND ?2 ORDER BY attendance_date DESC, id DESC",
            (
                from.format(DATE_FMT).to_string(),
                to.format(DATE_FMT).to_string(),
            ),
        )
        .await
    }

    async fn student_history(
        &self,
        student_id: StudentId,
    ) -> Result<Vec<AttendanceEvent>, StoreError> {
        self.select_events(
            "WHERE student_id = ?1 ORDER BY attendance_date DESC, id DESC",
            (student_id.0,),
        )
        .await
    }
}

fn conversion_error(idx: usize, ty: Type, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, ty, msg.into())
}

fn parse_text<T>(
    row: &Row<'_>,
    idx: usize,
    fmt: &str,
    parse: fn(&str, &str) -> chrono::ParseResult<T>,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw, fmt).map_err(|e| conversion_error(idx, Type::Text, format!("{raw:?}: {e}")))
}

fn parse_optional_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<NaiveTime>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        NaiveTime::parse_from_str(&s, TIME_FMT)
            .map_err(|e| conversion_error(idx, Type::Text, format!("{s:?}: {e}")))
    })
    .transpose()
}

fn decode_event(row: &Row<'_>) -> rusqlite::Result<AttendanceEvent> {
    let status: String = row.get(5)?;
    let status = status
        .parse::<AttendanceStatus>()
        .map_err(|e| conversion_error(5, Type::Text, e))?;

    Ok(AttendanceEvent {
        id: EventId(row.get(0)?),
        student_id: StudentId(row.get(1)?),
        date: parse_text(row, 2, DATE_FMT, NaiveDate::parse_from_str)?,
        time_in: parse_optional_time(row, 3)?,
        time_out: parse_optional_time(row, 4)?,
        status,
        confidence: row.get::<_, f64>(6)? as f32,
        photo_path: row.get(7)?,
        created_at: parse_text(row, 8, DATETIME_FMT, NaiveDateTime::parse_from_str)?,
    })
}

fn decode_student(row: &Row<'_>) -> rusqlite::Result<StudentRecord> {
    let status: String = row.get(4)?;
    Ok(StudentRecord {
        id: StudentId(row.get(0)?),
        code: row.get(1)?,
        display_name: row.get(2)?,
        face_encoding: row.get(3)?,
        active: status == "active",
    })
}
