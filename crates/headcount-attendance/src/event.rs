use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use headcount_core::StudentId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Insertion sequence of an attendance row. Later rows have larger ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub i64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Late,
    Absent,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Late => "late",
            AttendanceStatus::Absent => "absent",
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttendanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "present" => Ok(AttendanceStatus::Present),
            "late" => Ok(AttendanceStatus::Late),
            "absent" => Ok(AttendanceStatus::Absent),
            other => Err(format!("unknown attendance status: {other}")),
        }
    }
}

/// One attendance row: a time-in and, once the student leaves, a time-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceEvent {
    pub id: EventId,
    pub student_id: StudentId,
    /// Local calendar day of the time-in.
    pub date: NaiveDate,
    pub time_in: Option<NaiveTime>,
    pub time_out: Option<NaiveTime>,
    pub status: AttendanceStatus,
    /// Match confidence of the most recent recognition on this row.
    pub confidence: f32,
    pub photo_path: Option<String>,
    pub created_at: NaiveDateTime,
}

impl AttendanceEvent {
    /// Timed in and not yet timed out.
    pub fn is_open(&self) -> bool {
        self.time_in.is_some() && self.time_out.is_none()
    }

    pub(crate) fn from_new(id: EventId, new: NewEvent) -> Self {
        Self {
            id,
            student_id: new.student_id,
            date: new.date,
            time_in: Some(new.time_in),
            time_out: None,
            status: new.status,
            confidence: new.confidence,
            photo_path: new.photo_path,
            created_at: new.created_at,
        }
    }

    pub(crate) fn apply(&mut self, patch: &EventPatch) {
        if let Some(t) = patch.time_out {
            self.time_out = Some(t);
        }
        if let Some(c) = patch.confidence {
            self.confidence = c;
        }
        if let Some(p) = &patch.photo_path {
            self.photo_path = Some(p.clone());
        }
    }
}

/// A time-in row about to be inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub student_id: StudentId,
    pub date: NaiveDate,
    pub time_in: NaiveTime,
    pub status: AttendanceStatus,
    pub confidence: f32,
    pub photo_path: Option<String>,
    pub created_at: NaiveDateTime,
}

/// Partial update of an existing row. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventPatch {
    pub time_out: Option<NaiveTime>,
    pub confidence: Option<f32>,
    pub photo_path: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_event() -> NewEvent {
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let time_in = NaiveTime::from_hms_opt(8, 0, 0).unwrap();
        NewEvent {
            student_id: StudentId(1),
            date,
            time_in,
            status: AttendanceStatus::Present,
            confidence: 0.8,
            photo_path: Some("in.jpg".into()),
            created_at: date.and_time(time_in),
        }
    }

    #[test]
    fn test_status_strings() {
        for status in [
            AttendanceStatus::Present,
            AttendanceStatus::Late,
            AttendanceStatus::Absent,
        ] {
            assert_eq!(status.as_str().parse::<AttendanceStatus>().unwrap(), status);
        }
        assert!("tardy".parse::<AttendanceStatus>().is_err());
        assert_eq!(serde_json::to_string(&AttendanceStatus::Late).unwrap(), "\"late\"");
    }

    #[test]
    fn test_patch_keeps_unset_fields() {
        let mut event = AttendanceEvent::from_new(EventId(4), new_event());
        assert!(event.is_open());

        event.apply(&EventPatch {
            time_out: NaiveTime::from_hms_opt(12, 30, 0),
            confidence: Some(0.9),
            photo_path: None,
        });

        assert!(!event.is_open());
        assert_eq!(event.confidence, 0.9);
        assert_eq!(event.photo_path.as_deref(), Some("in.jpg"));
    }
}
