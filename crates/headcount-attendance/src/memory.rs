//! In-process record store.

use crate::event::{AttendanceEvent, EventId, EventPatch, NewEvent};
use crate::store::{RecordStore, StoreError};
use chrono::NaiveDate;
use headcount_core::StudentId;
use std::cmp::Reverse;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct State {
    next_id: i64,
    events: Vec<AttendanceEvent>,
}

/// Attendance rows held in memory, lost on drop.
///
/// Can be switched offline to exercise `Unavailable` handling.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<State>,
    online: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            state: Mutex::new(State::default()),
            online: AtomicBool::new(true),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Every stored row in insertion order.
    pub fn all_events(&self) -> Vec<AttendanceEvent> {
        self.lock().events.clone()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store is offline".into()))
        }
    }

    fn select<F>(&self, keep: F) -> Result<Vec<AttendanceEvent>, StoreError>
    where
        F: Fn(&AttendanceEvent) -> bool,
    {
        self.check_online()?;
        Ok(self.lock().events.iter().filter(|e| keep(e)).cloned().collect())
    }
}

fn newest_day_first(events: &mut [AttendanceEvent]) {
    events.sort_by_key(|e| (Reverse(e.date), Reverse(e.id)));
}

impl RecordStore for MemoryStore {
    async fn insert_event(&self, event: NewEvent) -> Result<EventId, StoreError> {
        self.check_online()?;
        let mut state = self.lock();
        state.next_id += 1;
        let id = EventId(state.next_id);
        state.events.push(AttendanceEvent::from_new(id, event));
        Ok(id)
    }

    async fn update_event(&self, id: EventId, patch: EventPatch) -> Result<(), StoreError> {
        self.check_online()?;
        let mut state = self.lock();
        let event = state
            .events
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(StoreError::NotFound(id))?;
        event.apply(&patch);
        Ok(())
    }

    async fn find_open_event(
        &self,
        student_id: StudentId,
        date: NaiveDate,
    ) -> Result<Option<AttendanceEvent>, StoreError> {
        let open = self.select(|e| e.student_id == student_id && e.date == date && e.is_open())?;
        Ok(open.into_iter().max_by_key(|e| e.id))
    }

    async fn events_for_day(
        &self,
        student_id: StudentId,
        date: NaiveDate,
    ) -> Result<Vec<AttendanceEvent>, StoreError> {
        self.select(|e| e.student_id == student_id && e.date == date)
    }

    async fn events_on(&self, date: NaiveDate) -> Result<Vec<AttendanceEvent>, StoreError> {
        let mut events = self.select(|e| e.date == date)?;
        newest_day_first(&mut events);
        Ok(events)
    }

    async fn events_between(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<AttendanceEvent>, StoreError> {
        let mut events = self.select(|e| e.date >= from && e.date <= to)?;
        newest_day_first(&mut events);
        Ok(events)
    }

    async fn student_history(
        &self,
        student_id: StudentId,
    ) -> Result<Vec<AttendanceEvent>, StoreError> {
        let mut events = self.select(|e| e.student_id == student_id)?;
        newest_day_first(&mut events);
        Ok(events)
    }
}
