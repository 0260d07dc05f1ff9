//! Recognition station: one frame at a time from extraction to attendance.
//!
//! Frames arrive as JSON lines, each holding the descriptors of every face
//! the on-device model found. The station owns the duplicate-window
//! debounce; the reconciler below it only keeps the event log consistent.

use chrono::NaiveDateTime;
use headcount_attendance::{
    AttendanceEvent, Clock, ReconcileError, Reconciler, RecordStore, Transition,
};
use headcount_core::{
    DescriptorRegistry, EmbeddingExtractor, EuclideanMatcher, ExtractError, FaceDescriptor,
    MatchError, MatchResult, Matcher, StudentId,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Decodes a frame line: a JSON array with one descriptor per detected face.
#[derive(Debug, Default)]
pub struct FrameDescriptors;

impl EmbeddingExtractor for FrameDescriptors {
    type Frame = str;

    fn extract(&mut self, frame: &str) -> Result<FaceDescriptor, ExtractError> {
        let mut faces: Vec<Vec<f32>> =
            serde_json::from_str(frame).map_err(|e| ExtractError::Malformed(e.to_string()))?;
        match faces.len() {
            0 => Err(ExtractError::NoFaceDetected),
            1 => FaceDescriptor::new(faces.remove(0))
                .map_err(|e| ExtractError::Malformed(e.to_string())),
            n => Err(ExtractError::MultipleFacesDetected(n)),
        }
    }
}

/// Suppresses repeat recognitions of a student shortly after their last
/// recorded event.
#[derive(Debug)]
pub struct DuplicateWindow {
    window: chrono::Duration,
    last_recorded: HashMap<StudentId, NaiveDateTime>,
}

impl DuplicateWindow {
    pub fn new(window: chrono::Duration) -> Self {
        Self {
            window,
            last_recorded: HashMap::new(),
        }
    }

    pub fn is_suppressed(&self, student_id: StudentId, now: NaiveDateTime) -> bool {
        self.last_recorded
            .get(&student_id)
            .is_some_and(|last| now - *last < self.window)
    }

    pub fn record(&mut self, student_id: StudentId, at: NaiveDateTime) {
        self.last_recorded.insert(student_id, at);
    }
}

/// What happened to one frame.
#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    NoFace,
    MultipleFaces {
        count: usize,
    },
    BadFrame {
        reason: String,
    },
    Unknown {
        best_distance: Option<f32>,
    },
    Suppressed {
        student_id: StudentId,
        display_name: String,
    },
    TimeIn {
        display_name: String,
        event: AttendanceEvent,
    },
    TimeOut {
        display_name: String,
        event: AttendanceEvent,
    },
    /// Nothing was written; the same face may be presented again.
    StoreFailed {
        student_id: StudentId,
        error: String,
    },
    /// A write was sent but never confirmed. It may be in the log, so the
    /// student is held off for the duplicate window as if it were.
    Unconfirmed {
        student_id: StudentId,
        display_name: String,
    },
}

pub struct Station<S> {
    registry: Arc<DescriptorRegistry>,
    matcher: EuclideanMatcher,
    threshold: f32,
    reconciler: Reconciler<S>,
    debounce: DuplicateWindow,
    clock: Arc<dyn Clock>,
    extractor: FrameDescriptors,
}

impl<S: RecordStore> Station<S> {
    pub fn new(
        registry: Arc<DescriptorRegistry>,
        matcher: EuclideanMatcher,
        threshold: f32,
        reconciler: Reconciler<S>,
        debounce: DuplicateWindow,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            matcher,
            threshold,
            reconciler,
            debounce,
            clock,
            extractor: FrameDescriptors,
        }
    }

    /// Process one frame. Only a descriptor length mismatch is an error: it
    /// means the roster and the model disagree and no frame can be trusted.
    pub async fn process(&mut self, frame: &str) -> Result<Outcome, MatchError> {
        let query = match self.extractor.extract(frame) {
            Ok(q) => q,
            Err(ExtractError::NoFaceDetected) => return Ok(Outcome::NoFace),
            Err(ExtractError::MultipleFacesDetected(count)) => {
                return Ok(Outcome::MultipleFaces { count })
            }
            Err(ExtractError::Malformed(reason)) => return Ok(Outcome::BadFrame { reason }),
        };

        let snapshot = self.registry.snapshot();
        let (student_id, display_name, confidence) =
            match self.matcher.compare(&query, &snapshot, self.threshold)? {
                MatchResult::Matched {
                    student_id,
                    display_name,
                    confidence,
                    ..
                } => (student_id, display_name, confidence),
                MatchResult::Unmatched { best_distance } => {
                    return Ok(Outcome::Unknown { best_distance })
                }
            };

        let now = self.clock.now();
        if self.debounce.is_suppressed(student_id, now) {
            tracing::debug!(student = %student_id, "recognition inside duplicate window");
            return Ok(Outcome::Suppressed {
                student_id,
                display_name,
            });
        }

        match self.reconciler.record_toggle(student_id, confidence, None).await {
            Ok(transition) => {
                self.debounce.record(student_id, now);
                Ok(match transition {
                    Transition::TimeIn(event) => Outcome::TimeIn {
                        display_name,
                        event,
                    },
                    Transition::TimeOut(event) => Outcome::TimeOut {
                        display_name,
                        event,
                    },
                })
            }
            Err(ReconcileError::Unconfirmed(waited)) => {
                tracing::warn!(
                    student = %student_id,
                    waited_ms = waited.as_millis() as u64,
                    "attendance write unconfirmed; holding off repeats"
                );
                self.debounce.record(student_id, now);
                Ok(Outcome::Unconfirmed {
                    student_id,
                    display_name,
                })
            }
            Err(err) => {
                log_store_failure(student_id, &err);
                Ok(Outcome::StoreFailed {
                    student_id,
                    error: err.to_string(),
                })
            }
        }
    }
}

fn log_store_failure(student_id: StudentId, err: &ReconcileError) {
    if err.is_retryable() {
        tracing::warn!(student = %student_id, error = %err, "attendance not recorded; retry");
    } else {
        tracing::error!(student = %student_id, error = %err, "attendance not recorded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use headcount_attendance::{
        EventId, EventPatch, FixedClock, MemoryStore, NewEvent, ReconcilerConfig, StoreError,
    };
    use headcount_core::{DistancePolicy, EnrolledStudent};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Answers reads until the first write, which never comes back and
    /// blocks every call behind it.
    #[derive(Default)]
    struct WedgedOnWrite {
        inner: MemoryStore,
        wedged: AtomicBool,
    }

    impl WedgedOnWrite {
        async fn gate(&self) {
            if self.wedged.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
        }
    }

    impl RecordStore for WedgedOnWrite {
        async fn insert_event(&self, _: NewEvent) -> Result<EventId, StoreError> {
            self.wedged.store(true, Ordering::SeqCst);
            std::future::pending().await
        }

        async fn update_event(&self, _: EventId, _: EventPatch) -> Result<(), StoreError> {
            self.wedged.store(true, Ordering::SeqCst);
            std::future::pending().await
        }

        async fn find_open_event(
            &self,
            student_id: StudentId,
            date: NaiveDate,
        ) -> Result<Option<AttendanceEvent>, StoreError> {
            self.gate().await;
            self.inner.find_open_event(student_id, date).await
        }

        async fn events_for_day(
            &self,
            student_id: StudentId,
            date: NaiveDate,
        ) -> Result<Vec<AttendanceEvent>, StoreError> {
            self.gate().await;
            self.inner.events_for_day(student_id, date).await
        }

        async fn events_on(&self, date: NaiveDate) -> Result<Vec<AttendanceEvent>, StoreError> {
            self.gate().await;
            self.inner.events_on(date).await
        }

        async fn events_between(
            &self,
            from: NaiveDate,
            to: NaiveDate,
        ) -> Result<Vec<AttendanceEvent>, StoreError> {
            self.gate().await;
            self.inner.events_between(from, to).await
        }

        async fn student_history(
            &self,
            student_id: StudentId,
        ) -> Result<Vec<AttendanceEvent>, StoreError> {
            self.gate().await;
            self.inner.student_history(student_id).await
        }
    }

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 2)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn roster() -> Vec<EnrolledStudent> {
        vec![
            EnrolledStudent::new(StudentId(1), "Ada")
                .with_descriptor(&FaceDescriptor::new(vec![0.0, 0.0, 0.0]).unwrap()),
            EnrolledStudent::new(StudentId(2), "Grace")
                .with_descriptor(&FaceDescriptor::new(vec![1.0, 1.0, 1.0]).unwrap()),
        ]
    }

    fn station(clock: Arc<FixedClock>) -> Station<MemoryStore> {
        station_over(MemoryStore::new(), ReconcilerConfig::default(), clock)
    }

    fn station_over<S: RecordStore>(
        store: S,
        config: ReconcilerConfig,
        clock: Arc<FixedClock>,
    ) -> Station<S> {
        let registry = Arc::new(DescriptorRegistry::new());
        registry.load(&roster());
        let reconciler = Reconciler::with_clock(store, config, clock.clone());
        Station::new(
            registry,
            EuclideanMatcher::new(DistancePolicy::live()),
            0.6,
            reconciler,
            DuplicateWindow::new(chrono::Duration::seconds(300)),
            clock,
        )
    }

    #[test]
    fn test_frame_extraction() {
        let mut ex = FrameDescriptors;
        assert!(matches!(ex.extract("[]"), Err(ExtractError::NoFaceDetected)));
        assert!(matches!(
            ex.extract("[[0.1], [0.2]]"),
            Err(ExtractError::MultipleFacesDetected(2))
        ));
        assert!(matches!(ex.extract("garbage"), Err(ExtractError::Malformed(_))));
        assert!(matches!(ex.extract("[[]]"), Err(ExtractError::Malformed(_))));
        assert_eq!(ex.extract("[[0.5, 0.25]]").unwrap().values(), &[0.5, 0.25]);
    }

    #[test]
    fn test_duplicate_window() {
        let mut window = DuplicateWindow::new(chrono::Duration::seconds(300));
        assert!(!window.is_suppressed(StudentId(1), at(8, 0)));
        window.record(StudentId(1), at(8, 0));
        assert!(window.is_suppressed(StudentId(1), at(8, 4)));
        assert!(!window.is_suppressed(StudentId(2), at(8, 4)));
        assert!(!window.is_suppressed(StudentId(1), at(8, 5)));
    }

    #[tokio::test]
    async fn test_station_in_then_out() {
        let clock = Arc::new(FixedClock::new(at(8, 0)));
        let mut st = station(clock.clone());

        let out = st.process("[[0.05, 0.0, 0.0]]").await.unwrap();
        assert!(matches!(out, Outcome::TimeIn { ref display_name, .. } if display_name == "Ada"));

        // Same face a minute later: debounced, nothing written.
        clock.advance(chrono::Duration::minutes(1));
        let out = st.process("[[0.0, 0.0, 0.0]]").await.unwrap();
        assert!(matches!(out, Outcome::Suppressed { student_id: StudentId(1), .. }));

        clock.advance(chrono::Duration::minutes(10));
        match st.process("[[0.0, 0.0, 0.0]]").await.unwrap() {
            Outcome::TimeOut { event, .. } => {
                assert_eq!(event.time_in, Some(at(8, 0).time()));
                assert_eq!(event.time_out, Some(at(8, 11).time()));
            }
            other => panic!("expected time-out, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_station_unknown_and_bad_frames() {
        let clock = Arc::new(FixedClock::new(at(8, 0)));
        let mut st = station(clock);

        match st.process("[[0.5, 0.5, 0.5]]").await.unwrap() {
            Outcome::Unknown { best_distance: Some(d) } => assert!(d > 0.4),
            other => panic!("expected unknown, got {other:?}"),
        }
        assert!(matches!(st.process("[]").await.unwrap(), Outcome::NoFace));
        assert!(matches!(
            st.process("[[0,0,0],[1,1,1]]").await.unwrap(),
            Outcome::MultipleFaces { count: 2 }
        ));
        assert!(matches!(st.process("{").await.unwrap(), Outcome::BadFrame { .. }));
    }

    #[tokio::test]
    async fn test_station_dimension_mismatch_is_fatal() {
        let clock = Arc::new(FixedClock::new(at(8, 0)));
        let mut st = station(clock);
        let err = st.process("[[0.0, 0.0]]").await.unwrap_err();
        assert!(matches!(err, MatchError::DimensionMismatch { .. }));
    }

    #[tokio::test]
    async fn test_station_store_failure_is_not_debounced() {
        let clock = Arc::new(FixedClock::new(at(8, 0)));
        let mut st = station(clock);

        st.reconciler.store().set_online(false);
        let out = st.process("[[1.0, 1.0, 1.0]]").await.unwrap();
        assert!(matches!(out, Outcome::StoreFailed { student_id: StudentId(2), .. }));

        st.reconciler.store().set_online(true);
        let out = st.process("[[1.0, 1.0, 1.0]]").await.unwrap();
        assert!(matches!(out, Outcome::TimeIn { .. }));
    }

    #[tokio::test]
    async fn test_station_unconfirmed_write_is_debounced() {
        let clock = Arc::new(FixedClock::new(at(8, 0)));
        let config = ReconcilerConfig {
            store_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let mut st = station_over(WedgedOnWrite::default(), config, clock.clone());

        let out = st.process("[[0.0, 0.0, 0.0]]").await.unwrap();
        assert!(matches!(out, Outcome::Unconfirmed { student_id: StudentId(1), .. }));

        // A repeat inside the window must not toggle the possibly-open row.
        clock.advance(chrono::Duration::seconds(30));
        let out = st.process("[[0.0, 0.0, 0.0]]").await.unwrap();
        assert!(matches!(out, Outcome::Suppressed { student_id: StudentId(1), .. }));
    }

    #[test]
    fn test_outcome_json_shape() {
        let json = serde_json::to_value(Outcome::MultipleFaces { count: 3 }).unwrap();
        assert_eq!(json["outcome"], "multiple_faces");
        assert_eq!(json["count"], 3);
    }
}
