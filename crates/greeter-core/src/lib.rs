//! greeter-core — capture gating, identity matching and greeting dispatch.
//!
//! Turns a continuous stream of frames into a small number of well-formed
//! capture events: one per subject who stands close, sharp and centered.
//! Person detection, face detection and face embedding run via ONNX Runtime.

pub mod collaborators;
pub mod config;
pub mod detector;
pub mod greeting;
pub mod ledger;
pub mod matcher;
pub mod pipeline;
pub mod position;
pub mod preview;
pub mod quality;
pub mod recognizer;
pub mod tracker;
pub mod types;

pub use collaborators::{
    CaptureStore, FaceEmbedder, FaceLocator, FrameSource, PersistError, PersonDetector, SourceError,
};
pub use config::{GateConfig, SafeZone};
pub use greeting::{FallbackPhrases, Greetee, GreetingDispatcher, GreetingJob, GreetingSink};
pub use matcher::{Gallery, IdentityMatcher, KnownVisitor};
pub use pipeline::{CapturePipeline, CaptureState, FrameVerdict, RunOutcome};
pub use types::{CaptureEvent, Detection, Embedding, FaceBox, Frame, GuestId, Rect, VisitorId};

use std::path::PathBuf;

/// Person detector weights (YOLOv10, end-to-end ONNX export).
pub const PERSON_MODEL_FILE: &str = "yolov10n.onnx";
/// Face detector weights (ResNet-10 SSD).
pub const FACE_MODEL_FILE: &str = "res10_300x300_ssd.onnx";
/// Face embedding weights (ArcFace).
pub const EMBEDDING_MODEL_FILE: &str = "w600k_r50.onnx";

/// `$XDG_DATA_HOME/greeter/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    data_dir().join("models")
}

/// Root of greeter's persistent data.
pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("greeter")
}
