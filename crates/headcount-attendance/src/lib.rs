//! headcount-attendance — Attendance event log and reconciliation.
//!
//! Turns a matched student into a time-in or time-out row. Storage sits
//! behind [`RecordStore`]; [`SqliteStore`] persists to SQLite and
//! [`MemoryStore`] keeps everything in process.

pub mod clock;
pub mod event;
pub mod memory;
pub mod reconcile;
pub mod sqlite;
pub mod store;

pub use clock::{Clock, FixedClock, SystemClock};
pub use event::{AttendanceEvent, AttendanceStatus, EventId, EventPatch, NewEvent};
pub use memory::MemoryStore;
pub use reconcile::{LatePolicy, ReconcileError, Reconciler, ReconcilerConfig, Transition};
pub use sqlite::{NewStudent, SqliteStore, StudentRecord};
pub use store::{RecordStore, StoreError};
