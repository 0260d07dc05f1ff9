//! Time-in / time-out reconciliation against the attendance log.
//!
//! Per `(student, date)` the log is either closed (no open row) or has
//! exactly one open row. Every transition for a key runs under that key's
//! lock, so two recognitions of the same student racing each other cannot
//! both see "closed" and both insert a time-in.

use crate::clock::{Clock, SystemClock};
use crate::event::{AttendanceEvent, AttendanceStatus, EventId, EventPatch, NewEvent};
use crate::store::{RecordStore, StoreError};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use headcount_core::StudentId;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;

const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("record store unavailable: {0}")]
    StoreUnavailable(String),
    /// No write was applied.
    #[error("record store did not answer within {0:?}")]
    Timeout(Duration),
    /// A write was sent but the store never confirmed whether it landed.
    #[error("record store did not confirm the write within {0:?}; it may have been recorded")]
    Unconfirmed(Duration),
    #[error("attendance event {0} not found")]
    NotFound(EventId),
    #[error("record store rejected the write: {0}")]
    Rejected(String),
    #[error("student {student_id} already has open event {event_id}")]
    AlreadyOpen {
        student_id: StudentId,
        event_id: EventId,
    },
}

impl ReconcileError {
    /// Whether trying again later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReconcileError::StoreUnavailable(_) | ReconcileError::Timeout(_)
        )
    }
}

impl From<StoreError> for ReconcileError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => ReconcileError::StoreUnavailable(msg),
            StoreError::NotFound(id) => ReconcileError::NotFound(id),
            StoreError::Corrupt(msg) | StoreError::Rejected(msg) => ReconcileError::Rejected(msg),
        }
    }
}

/// Status assignment for new time-in rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatePolicy {
    /// A first time-in of the day after this time is `Late`.
    pub cutoff: Option<NaiveTime>,
}

impl LatePolicy {
    pub fn status_for(&self, time_in: NaiveTime, first_of_day: bool) -> AttendanceStatus {
        match self.cutoff {
            Some(cutoff) if first_of_day && time_in > cutoff => AttendanceStatus::Late,
            _ => AttendanceStatus::Present,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcilerConfig {
    pub late: LatePolicy,
    /// Upper bound on a single store call. A read that exceeds it fails the
    /// event; a write that exceeds it is checked with one more read.
    pub store_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            late: LatePolicy::default(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }
}

/// What a toggle did.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    TimeIn(AttendanceEvent),
    TimeOut(AttendanceEvent),
}

impl Transition {
    pub fn event(&self) -> &AttendanceEvent {
        match self {
            Transition::TimeIn(e) | Transition::TimeOut(e) => e,
        }
    }
}

type Key = (StudentId, NaiveDate);

/// One async mutex per `(student, date)`, dropped once nobody holds it.
#[derive(Default)]
struct KeyLocks {
    slots: Mutex<HashMap<Key, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyLocks {
    async fn acquire(&self, key: Key) -> OwnedMutexGuard<()> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            // Only the map references an idle slot.
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            Arc::clone(slots.entry(key).or_default())
        };
        slot.lock_owned().await
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Records time-in and time-out events for recognized students.
///
/// Debouncing repeat recognitions is the caller's job; the reconciler only
/// enforces the one-open-row rule.
pub struct Reconciler<S> {
    store: S,
    clock: Arc<dyn Clock>,
    config: ReconcilerConfig,
    locks: KeyLocks,
}

impl<S: RecordStore> Reconciler<S> {
    pub fn new(store: S, config: ReconcilerConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(store: S, config: ReconcilerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            config,
            locks: KeyLocks::default(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Today's date on the reconciler's clock.
    pub fn today(&self) -> NaiveDate {
        self.clock.now().date()
    }

    /// The open row for the student on `date`, if any.
    pub async fn get_open_event(
        &self,
        student_id: StudentId,
        date: NaiveDate,
    ) -> Result<Option<AttendanceEvent>, ReconcileError> {
        self.bounded(self.store.find_open_event(student_id, date)).await
    }

    /// Open a new row for today. Fails with `AlreadyOpen` when one is open.
    pub async fn record_time_in(
        &self,
        student_id: StudentId,
        confidence: f32,
        photo_path: Option<String>,
    ) -> Result<AttendanceEvent, ReconcileError> {
        let now = self.clock.now();
        let _guard = self.locks.acquire((student_id, now.date())).await;

        if let Some(open) = self.get_open_event(student_id, now.date()).await? {
            return Err(ReconcileError::AlreadyOpen {
                student_id,
                event_id: open.id,
            });
        }
        self.insert_time_in(student_id, now, confidence, photo_path).await
    }

    /// Close the most recent open row for today. `Ok(None)` when nothing is
    /// open; no row is touched in that case.
    pub async fn record_time_out(
        &self,
        student_id: StudentId,
        confidence: f32,
        photo_path: Option<String>,
    ) -> Result<Option<AttendanceEvent>, ReconcileError> {
        let now = self.clock.now();
        let _guard = self.locks.acquire((student_id, now.date())).await;

        match self.get_open_event(student_id, now.date()).await? {
            Some(open) => self
                .close(open, now, confidence, photo_path)
                .await
                .map(Some),
            None => {
                tracing::debug!(student = %student_id, "time-out with no open event");
                Ok(None)
            }
        }
    }

    /// Time out if a row is open, otherwise time in.
    pub async fn record_toggle(
        &self,
        student_id: StudentId,
        confidence: f32,
        photo_path: Option<String>,
    ) -> Result<Transition, ReconcileError> {
        let now = self.clock.now();
        let _guard = self.locks.acquire((student_id, now.date())).await;

        match self.get_open_event(student_id, now.date()).await? {
            Some(open) => self
                .close(open, now, confidence, photo_path)
                .await
                .map(Transition::TimeOut),
            None => self
                .insert_time_in(student_id, now, confidence, photo_path)
                .await
                .map(Transition::TimeIn),
        }
    }

    async fn insert_time_in(
        &self,
        student_id: StudentId,
        now: NaiveDateTime,
        confidence: f32,
        photo_path: Option<String>,
    ) -> Result<AttendanceEvent, ReconcileError> {
        let date = now.date();
        let earlier = self
            .bounded(self.store.events_for_day(student_id, date))
            .await?;
        let status = self.config.late.status_for(now.time(), earlier.is_empty());

        let new = NewEvent {
            student_id,
            date,
            time_in: now.time(),
            status,
            confidence,
            photo_path,
            created_at: now,
        };
        let id = match self.bounded(self.store.insert_event(new.clone())).await {
            Ok(id) => id,
            Err(ReconcileError::Timeout(waited)) => {
                return self
                    .settle(student_id, date, waited, |e| {
                        e.created_at == now && e.time_in == Some(now.time())
                    })
                    .await;
            }
            Err(err) => return Err(err),
        };

        tracing::info!(
            student = %student_id,
            event = %id,
            %status,
            confidence,
            "time-in recorded"
        );
        Ok(AttendanceEvent::from_new(id, new))
    }

    async fn close(
        &self,
        mut open: AttendanceEvent,
        now: NaiveDateTime,
        confidence: f32,
        photo_path: Option<String>,
    ) -> Result<AttendanceEvent, ReconcileError> {
        let patch = EventPatch {
            time_out: Some(now.time()),
            confidence: Some(confidence),
            photo_path,
        };
        match self
            .bounded(self.store.update_event(open.id, patch.clone()))
            .await
        {
            Ok(()) => {}
            Err(ReconcileError::Timeout(waited)) => {
                let id = open.id;
                return self
                    .settle(open.student_id, open.date, waited, |e| {
                        e.id == id && e.time_out == Some(now.time())
                    })
                    .await;
            }
            Err(err) => return Err(err),
        }
        open.apply(&patch);

        tracing::info!(
            student = %open.student_id,
            event = %open.id,
            confidence,
            "time-out recorded"
        );
        Ok(open)
    }

    /// Resolve a write that timed out. The store keeps applying it after the
    /// caller stops waiting, and reads queue behind it, so one more read of
    /// the day shows whether it landed.
    async fn settle<P>(
        &self,
        student_id: StudentId,
        date: NaiveDate,
        waited: Duration,
        landed: P,
    ) -> Result<AttendanceEvent, ReconcileError>
    where
        P: Fn(&AttendanceEvent) -> bool,
    {
        match self.bounded(self.store.events_for_day(student_id, date)).await {
            Ok(rows) => match rows.into_iter().find(|e| landed(e)) {
                Some(event) => {
                    tracing::warn!(
                        student = %student_id,
                        event = %event.id,
                        "slow write confirmed after timeout"
                    );
                    Ok(event)
                }
                None => Err(ReconcileError::Timeout(waited)),
            },
            Err(err) => {
                tracing::error!(
                    student = %student_id,
                    error = %err,
                    "could not tell whether a timed-out write landed"
                );
                Err(ReconcileError::Unconfirmed(waited))
            }
        }
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, ReconcileError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.config.store_timeout, call).await {
            Ok(result) => result.map_err(|err| {
                tracing::warn!(error = %err, "record store call failed");
                ReconcileError::from(err)
            }),
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.config.store_timeout.as_millis() as u64,
                    "record store call timed out"
                );
                Err(ReconcileError::Timeout(self.config.store_timeout))
            }
        }
    }
}
