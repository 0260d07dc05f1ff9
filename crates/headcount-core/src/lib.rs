//! headcount-core — Face descriptor registry and matching.
//!
//! Descriptors are produced by an external embedding model. This crate
//! indexes one descriptor per enrolled student and finds the nearest
//! enrolled face for a query by Euclidean distance.

pub mod extractor;
pub mod matcher;
pub mod registry;
pub mod types;

pub use extractor::{EmbeddingExtractor, ExtractError};
pub use matcher::{
    DistancePolicy, EuclideanMatcher, MatchError, MatchResult, MatchScan, Matcher,
    DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_MAX_DISTANCE,
};
pub use registry::{DescriptorRegistry, RegistryEntry, RegistrySnapshot};
pub use types::{DescriptorError, EnrolledStudent, FaceDescriptor, StudentId};
