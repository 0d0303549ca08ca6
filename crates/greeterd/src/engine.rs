use crate::config::Config;
use crate::describe::OpenAiDescriber;
use crate::speech::Speaker;
use greeter_core::collaborators::{FrameSource, SourceError};
use greeter_core::detector::{DetectorError, SsdFaceDetector, YoloPersonDetector};
use greeter_core::greeting::{DescribeError, GreetingDispatcher, GreetingJob};
use greeter_core::pipeline::{CapturePipeline, FrameReport, RunOutcome};
use greeter_core::preview::render_preview;
use greeter_core::recognizer::{ArcFaceEmbedder, RecognizerError};
use greeter_core::tracker::{IouTracker, TrackedDetector};
use greeter_core::types::{CaptureEvent, Frame};
use greeter_core::IdentityMatcher;
use greeter_hw::{Camera, CameraError};
use greeter_store::{LiveGallery, Store, StoreError};
use image::ImageFormat;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("frame source error: {0}")]
    Source(#[from] SourceError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("description client error: {0}")]
    Describe(#[from] DescribeError),
    #[error("failed to spawn loop thread: {0}")]
    Thread(#[source] std::io::Error),
}

pub type Dispatcher = GreetingDispatcher<OpenAiDescriber, Speaker, Store>;

/// Post-capture behaviour.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub overlay: Duration,
    pub greet_returning_visitors: bool,
    pub preview_path: Option<PathBuf>,
}

/// The frame loop: pulls frames until quit, handling each accepted capture.
pub struct FrameLoop<F> {
    pipeline: CapturePipeline,
    source: F,
    store: Arc<Store>,
    dispatcher: Dispatcher,
    settings: LoopSettings,
}

impl<F: FrameSource> FrameLoop<F> {
    pub fn new(
        pipeline: CapturePipeline,
        source: F,
        store: Arc<Store>,
        dispatcher: Dispatcher,
        settings: LoopSettings,
    ) -> Self {
        Self {
            pipeline,
            source,
            store,
            dispatcher,
            settings,
        }
    }

    /// Run until `quit` is set or the source fails for good.
    pub fn run(mut self, quit: &AtomicBool) -> Result<(), EngineError> {
        tracing::info!("frame loop started");
        let preview_path = self.settings.preview_path.clone();

        loop {
            let outcome = self
                .pipeline
                .run_until_capture(&mut self.source, quit, |frame, report| {
                    if let Some(path) = &preview_path {
                        write_preview(path, frame, report);
                    }
                })?;

            match outcome {
                RunOutcome::Exit => break,
                RunOutcome::Captured(event) => self.on_capture(&event),
            }
        }

        tracing::info!("frame loop exiting");
        Ok(())
    }

    fn on_capture(&mut self, event: &CaptureEvent) {
        if should_greet(&self.store, event, self.settings.greet_returning_visitors) {
            // detached; the loop never waits on a greeting
            drop(self.dispatcher.dispatch(GreetingJob::from_event(event)));
        }
        self.pipeline.start_overlay_window(self.settings.overlay);
    }
}

/// Log the visit of an identified visitor and decide whether to greet.
///
/// Guests are always greeted. Visitors are greeted on their first logged
/// visit, or every time when `greet_returning` is set. A failed visit
/// write still greets.
pub fn should_greet(store: &Store, event: &CaptureEvent, greet_returning: bool) -> bool {
    let Some(identity) = &event.identity else {
        return true;
    };

    match store.record_visit(&identity.visitor_id, &event.guest_id, "") {
        Ok(true) => true,
        Ok(false) if greet_returning => true,
        Ok(false) => {
            tracing::info!(visitor = %identity.visitor_id, name = %identity.name, "returning visitor; not greeting again");
            false
        }
        Err(e) => {
            tracing::warn!(visitor = %identity.visitor_id, error = %e, "failed to log visit");
            true
        }
    }
}

fn write_preview(path: &Path, frame: &Frame, report: &FrameReport) {
    let preview = render_preview(frame, &report.annotations);
    let tmp = path.with_extension("tmp.jpg");
    let result = preview
        .save_with_format(&tmp, ImageFormat::Jpeg)
        .map_err(|e| e.to_string())
        .and_then(|_| std::fs::rename(&tmp, path).map_err(|e| e.to_string()));
    if let Err(e) = result {
        tracing::debug!(path = %path.display(), error = %e, "failed to write preview");
    }
}

/// Open the camera, load all models and start the frame loop on a
/// dedicated OS thread.
///
/// Fails fast if any resource is unavailable.
pub fn spawn_loop(
    config: &Config,
    distance_threshold: f32,
    store: Arc<Store>,
    runtime: Handle,
    quit: Arc<AtomicBool>,
) -> Result<JoinHandle<Result<(), EngineError>>, EngineError> {
    let person_path = config.models.person_model_path();
    let detector = YoloPersonDetector::load(&person_path, config.models.person_confidence)?;
    tracing::info!(path = %person_path, "person detector loaded");

    let face_path = config.models.face_model_path();
    let faces = SsdFaceDetector::load(&face_path, config.models.face_confidence)?;
    tracing::info!(path = %face_path, "face detector loaded");

    let embed_path = config.models.embedding_model_path();
    let embedder = ArcFaceEmbedder::load(&embed_path)?;
    tracing::info!(path = %embed_path, "ArcFace embedder loaded");

    // Fail fast on corrupt rows; lookups re-read the table per capture.
    let enrolled = store.load_gallery()?.len();

    let device = config.camera.device_path();
    let mut camera = Camera::open(
        &device,
        config.camera.width,
        config.camera.height,
        config.camera.rotation,
    )?;
    let (frame_width, frame_height) = config
        .camera
        .rotation
        .output_size(camera.width, camera.height);
    tracing::info!(
        device = %device,
        format = ?camera.pixel_format(),
        frame_width,
        frame_height,
        "camera opened"
    );

    if config.camera.warmup_frames > 0 {
        tracing::info!(count = config.camera.warmup_frames, "discarding warmup frames");
        camera.warm_up(config.camera.warmup_frames)?;
    }

    let matcher = IdentityMatcher::new(
        Box::new(embedder),
        Box::new(LiveGallery::new(store.clone())),
        distance_threshold,
    );
    tracing::info!(visitors = enrolled, threshold = matcher.threshold(), "identity matcher ready");
    let pipeline = CapturePipeline::new(
        Box::new(TrackedDetector::new(detector, IouTracker::default())),
        Box::new(faces),
        matcher,
        store.clone(),
        config.gates.clone(),
    );

    let dispatcher = GreetingDispatcher::new(
        runtime,
        Arc::new(OpenAiDescriber::new(&config.greeting)?),
        Arc::new(Speaker::from_config(&config.speech)),
        store.clone(),
        config.greeting.fallbacks.clone(),
        config.greeting.timeout(),
    );

    let settings = LoopSettings {
        overlay: config.display.overlay_duration(),
        greet_returning_visitors: config.identity.greet_returning_visitors,
        preview_path: config.display.preview_path.clone(),
    };
    let frame_loop = FrameLoop::new(pipeline, camera, store, dispatcher, settings);

    std::thread::Builder::new()
        .name("greeter-loop".into())
        .spawn(move || frame_loop.run(&quit))
        .map_err(EngineError::Thread)
}

#[cfg(test)]
mod tests {
    use super::*;
    use greeter_core::types::{GuestId, IdentityMatch, Rect, VisitorId};
    use image::RgbImage;

    fn event(guest: GuestId, identity: Option<IdentityMatch>) -> CaptureEvent {
        CaptureEvent {
            guest_id: guest,
            track_id: Some(1),
            person_crop: RgbImage::new(2, 2),
            face_crop: RgbImage::new(1, 1),
            face_rect: Rect::new(0.0, 0.0, 1.0, 1.0),
            identity,
            person_sharpness: 50.0,
            face_sharpness: 50.0,
            center_overlap: 1.0,
            timestamp: chrono::Utc::now(),
        }
    }

    fn matched(id: &VisitorId) -> Option<IdentityMatch> {
        Some(IdentityMatch {
            visitor_id: id.clone(),
            name: "Ada".into(),
            distance: 0.1,
        })
    }

    #[test]
    fn test_guest_is_always_greeted() {
        let store = Store::open_in_memory().unwrap();
        let guest = store.save_guest(&RgbImage::new(2, 2)).unwrap();
        assert!(should_greet(&store, &event(guest, None), false));
    }

    #[test]
    fn test_visitor_greeted_once_by_default() {
        let store = Store::open_in_memory().unwrap();
        let ada = store
            .add_visitor("Ada", &greeter_core::Embedding { values: vec![1.0] })
            .unwrap();
        let g1 = store.save_guest(&RgbImage::new(2, 2)).unwrap();
        let g2 = store.save_guest(&RgbImage::new(2, 2)).unwrap();

        assert!(should_greet(&store, &event(g1, matched(&ada)), false));
        assert!(!should_greet(&store, &event(g2, matched(&ada)), false));
    }

    #[test]
    fn test_returning_visitor_greeted_when_enabled() {
        let store = Store::open_in_memory().unwrap();
        let ada = VisitorId("v-ada".into());
        let g1 = store.save_guest(&RgbImage::new(2, 2)).unwrap();
        let g2 = store.save_guest(&RgbImage::new(2, 2)).unwrap();

        assert!(should_greet(&store, &event(g1, matched(&ada)), true));
        assert!(should_greet(&store, &event(g2, matched(&ada)), true));
    }

    #[test]
    fn test_preview_written_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preview.jpg");
        let frame = Frame::new(RgbImage::new(16, 16), 0);
        let report = FrameReport {
            verdict: greeter_core::FrameVerdict::NoCandidate,
            annotations: Default::default(),
        };
        write_preview(&path, &frame, &report);
        assert!(path.exists());
        assert!(!path.with_extension("tmp.jpg").exists());
    }
}
