//! Contract for the external face-embedding model.

use crate::types::FaceDescriptor;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("multiple faces detected ({0})")]
    MultipleFacesDetected(usize),
    #[error("malformed model output: {0}")]
    Malformed(String),
}

/// Produces a single face descriptor from one captured frame.
///
/// Implementations wrap whatever model runs on the device; the matcher only
/// ever sees the descriptor.
pub trait EmbeddingExtractor {
    type Frame: ?Sized;

    fn extract(&mut self, frame: &Self::Frame) -> Result<FaceDescriptor, ExtractError>;
}
