//! Descriptor registry: one face descriptor per enrolled student.
//!
//! The registry is rebuilt from a full roster snapshot on every `load`.
//! Readers take an `Arc` to the current snapshot; a reload swaps in a new
//! snapshot and never touches one that is already handed out.

use crate::types::{EnrolledStudent, FaceDescriptor, StudentId};
use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};

/// An indexed student.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub student_id: StudentId,
    pub display_name: String,
    pub descriptor: FaceDescriptor,
}

/// Immutable view of the registry at one point in time.
///
/// Entries are kept in roster order, which is the match tie-break order.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    entries: Vec<RegistryEntry>,
}

impl RegistrySnapshot {
    /// Build a snapshot from a roster. Students without a usable descriptor
    /// are skipped; the second row for an already indexed student is skipped.
    pub fn build(students: &[EnrolledStudent]) -> Self {
        let mut entries = Vec::with_capacity(students.len());
        let mut seen = HashSet::with_capacity(students.len());

        for student in students {
            let descriptor = match student.descriptor() {
                Ok(Some(d)) => d,
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(
                        student = %student.id,
                        error = %err,
                        "skipping student with unreadable face encoding"
                    );
                    continue;
                }
            };

            if !seen.insert(student.id) {
                tracing::warn!(
                    student = %student.id,
                    "duplicate roster row for student; keeping the first descriptor"
                );
                continue;
            }

            entries.push(RegistryEntry {
                student_id: student.id,
                display_name: student.display_name.clone(),
                descriptor,
            });
        }

        Self { entries }
    }

    pub fn entries(&self) -> &[RegistryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, student_id: StudentId) -> Option<&RegistryEntry> {
        self.entries.iter().find(|e| e.student_id == student_id)
    }
}

/// Holder of the current registry snapshot.
#[derive(Debug, Default)]
pub struct DescriptorRegistry {
    current: RwLock<Arc<RegistrySnapshot>>,
}

impl DescriptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole index with one built from `students`.
    ///
    /// Returns the number of indexed descriptors.
    pub fn load(&self, students: &[EnrolledStudent]) -> usize {
        let snapshot = Arc::new(RegistrySnapshot::build(students));
        let indexed = snapshot.len();

        *self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner) = snapshot;

        tracing::info!(
            roster = students.len(),
            indexed,
            skipped = students.len() - indexed,
            "descriptor registry loaded"
        );
        indexed
    }

    /// Count of indexed descriptors.
    pub fn size(&self) -> usize {
        self.snapshot().len()
    }

    /// The current snapshot. Stays valid across later `load` calls.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }
}
