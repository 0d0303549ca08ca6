//! Narrow interfaces to the external collaborators the capture pipeline drives.
//!
//! The ONNX adapters in [`crate::detector`] and [`crate::recognizer`], the
//! V4L2 camera in `greeter-hw` and the SQLite store in `greeter-store` are the
//! production implementations; tests substitute fakes.

use crate::detector::DetectorError;
use crate::recognizer::RecognizerError;
use crate::types::{Detection, Embedding, FaceBox, Frame, GuestId};
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    /// A single read failed; the next read may succeed.
    #[error("frame read failed: {0}")]
    Transient(String),
    /// The source can no longer produce frames.
    #[error("frame source closed: {0}")]
    Closed(String),
}

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("image encoding failed: {0}")]
    Encode(String),
    #[error("storage backend failed: {0}")]
    Backend(String),
}

/// Supplies successive frames.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Frame, SourceError>;
}

/// Object detector restricted to the person class.
pub trait PersonDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectorError>;
}

/// Face detector run on a person crop; returns the best face, if any.
pub trait FaceLocator {
    fn locate(&mut self, person: &RgbImage) -> Result<Option<FaceBox>, DetectorError>;
}

/// Face embedding model.
pub trait FaceEmbedder {
    fn embed(&mut self, face: &RgbImage) -> Result<Embedding, RecognizerError>;
}

/// Persists the person crop of an accepted capture.
pub trait CaptureStore {
    fn save_capture(&self, person: &RgbImage) -> Result<GuestId, PersistError>;
}
