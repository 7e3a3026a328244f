//! Seams to the camera and model collaborators.
//!
//! Frames are opaque to the engine: a [`FrameSource`] hands them out, a
//! [`FaceLandmarker`] finds eye landmarks in them and an
//! [`EmbeddingExtractor`] turns them into embeddings.

use crate::error::AttendanceError;
use crate::liveness::FaceLandmarks;
use crate::types::Embedding;

/// A live stream of frames. Dropping the source releases the device.
pub trait FrameSource {
    type Frame;

    /// Next available frame, or `None` when nothing is ready this tick.
    fn next_frame(&mut self) -> Option<Self::Frame>;
}

/// Something that can be opened into a [`FrameSource`].
///
/// Opening is the only step whose failure aborts a detection run.
pub trait CaptureDevice {
    type Source: FrameSource;

    fn open(&self) -> Result<Self::Source, AttendanceError>;
}

/// Locates faces and their eye landmarks in a frame.
pub trait FaceLandmarker<F> {
    fn landmarks(&mut self, frame: &F) -> Vec<FaceLandmarks>;
}

/// Computes a face embedding, `None` when no usable face is present.
pub trait EmbeddingExtractor<F> {
    fn extract(&mut self, frame: &F) -> Option<Embedding>;
}
