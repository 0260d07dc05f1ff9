//! Record store contract for attendance rows.

use crate::event::{AttendanceEvent, EventId, EventPatch, NewEvent};
use chrono::NaiveDate;
use headcount_core::StudentId;
use std::future::Future;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("record store unavailable: {0}")]
    Unavailable(String),
    #[error("attendance event {0} not found")]
    NotFound(EventId),
    #[error("corrupt attendance row: {0}")]
    Corrupt(String),
    #[error("write rejected: {0}")]
    Rejected(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::InvalidColumnType(..)
            | rusqlite::Error::IntegralValueOutOfRange(..) => StoreError::Corrupt(err.to_string()),
            rusqlite::Error::SqliteFailure(ref e, _)
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Rejected(err.to_string())
            }
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

impl From<tokio_rusqlite::Error> for StoreError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        match err {
            tokio_rusqlite::Error::Rusqlite(e) => e.into(),
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

/// Persistence for attendance rows.
///
/// Every insert or update touches a single row and is atomic on its own.
/// Calls are applied in the order they are issued, and a call keeps running
/// when the caller stops waiting for it. A read issued after a write sees it.
/// Callers serialize access per `(student, date)`; the store does not.
pub trait RecordStore: Send + Sync {
    /// Insert a time-in row and return its id.
    fn insert_event(
        &self,
        event: NewEvent,
    ) -> impl Future<Output = Result<EventId, StoreError>> + Send;

    /// Apply `patch` to row `id`. Fails with `NotFound` when no such row.
    fn update_event(
        &self,
        id: EventId,
        patch: EventPatch,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Most recently inserted open row for the student on `date`.
    fn find_open_event(
        &self,
        student_id: StudentId,
        date: NaiveDate,
    ) -> impl Future<Output = Result<Option<AttendanceEvent>, StoreError>> + Send;

    /// All rows for the student on `date`, oldest first.
    fn events_for_day(
        &self,
        student_id: StudentId,
        date: NaiveDate,
    ) -> impl Future<Output = Result<Vec<AttendanceEvent>, StoreError>> + Send;

    /// All rows on `date`, newest first.
    fn events_on(
        &self,
        date: NaiveDate,
    ) -> impl Future<Output = Result<Vec<AttendanceEvent>, StoreError>> + Send;

    /// All rows with `from <= date <= to`, newest day first.
    fn events_between(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> impl Future<Output = Result<Vec<AttendanceEvent>, StoreError>> + Send;

    /// Every row for one student, newest day first.
    fn student_history(
        &self,
        student_id: StudentId,
    ) -> impl Future<Output = Result<Vec<AttendanceEvent>, StoreError>> + Send;
}
