use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DescriptorError {
    #[error("face encoding is not a JSON number array: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("face encoding is empty")]
    Empty,
    #[error("face encoding has a non-finite value at index {0}")]
    NonFinite(usize),
    #[error("descriptor length mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Roster identity of an enrolled student.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StudentId(pub i64);

impl fmt::Display for StudentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Face descriptor (typically 128-dimensional for the roster model).
///
/// Serializes as a bare number array; deserializing goes through `new`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct FaceDescriptor {
    values: Vec<f32>,
}

impl FaceDescriptor {
    /// Wrap raw model output. Rejects empty vectors and NaN/infinite values.
    pub fn new(values: Vec<f32>) -> Result<Self, DescriptorError> {
        if values.is_empty() {
            return Err(DescriptorError::Empty);
        }
        if let Some(idx) = values.iter().position(|v| !v.is_finite()) {
            return Err(DescriptorError::NonFinite(idx));
        }
        Ok(Self { values })
    }

    /// Parse a stored face encoding (a JSON array of numbers).
    pub fn from_json(encoding: &str) -> Result<Self, DescriptorError> {
        let values: Vec<f32> = serde_json::from_str(encoding)?;
        Self::new(values)
    }

    /// Serialize to the stored face encoding format.
    pub fn to_json(&self) -> String {
        // A Vec<f32> of finite values always serializes.
        serde_json::to_string(&self.values).unwrap_or_else(|_| "[]".to_string())
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Compute Euclidean distance between two descriptors.
    ///
    /// Descriptors of different length come from different models (or a
    /// corrupt row) and cannot be compared.
    pub fn euclidean_distance(&self, other: &FaceDescriptor) -> Result<f32, DescriptorError> {
        if self.values.len() != other.values.len() {
            return Err(DescriptorError::DimensionMismatch {
                expected: self.values.len(),
                actual: other.values.len(),
            });
        }
        Ok(self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt())
    }
}

impl TryFrom<Vec<f32>> for FaceDescriptor {
    type Error = DescriptorError;

    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        Self::new(values)
    }
}

impl From<FaceDescriptor> for Vec<f32> {
    fn from(descriptor: FaceDescriptor) -> Self {
        descriptor.values
    }
}

/// A roster entry as handed to the registry.
///
/// The face encoding is kept in its stored form so the registry decides
/// what is loadable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrolledStudent {
    pub id: StudentId,
    pub display_name: String,
    pub face_encoding: Option<String>,
}

impl EnrolledStudent {
    pub fn new(id: StudentId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            face_encoding: None,
        }
    }

    pub fn with_descriptor(mut self, descriptor: &FaceDescriptor) -> Self {
        self.face_encoding = Some(descriptor.to_json());
        self
    }

    /// Parse the stored encoding. `Ok(None)` when the student has none.
    pub fn descriptor(&self) -> Result<Option<FaceDescriptor>, DescriptorError> {
        match self.face_encoding.as_deref() {
            None => Ok(None),
            Some(s) if s.trim().is_empty() => Ok(None),
            Some(s) => FaceDescriptor::from_json(s).map(Some),
        }
    }
}
