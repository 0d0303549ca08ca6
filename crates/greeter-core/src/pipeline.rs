//! Capture decision state machine.
//!
//! Each frame flows through a fixed gate order:
//!
//! 1. quit request: stop before anything else
//! 2. person detection and Near/Far classification
//! 3. ledger sweep when zero or several Near persons are present
//! 4. Near count: 0 keeps scanning, >1 blurs the frame and skips gating
//! 5. single Near candidate: ledger, person blur, face presence,
//!    face blur, face centering
//! 6. overlay-only window: a passing frame is displayed but not captured
//! 7. accept: persist the person crop, resolve identity, mark the track
//!
//! A rejected frame has no side effects beyond logging; only an accepted
//! frame writes to the capture store and the ledger.

use crate::collaborators::{CaptureStore, FaceLocator, FrameSource, PersonDetector, SourceError};
use crate::config::GateConfig;
use crate::ledger::{TrackLedger, TrackStatus};
use crate::matcher::IdentityMatcher;
use crate::position::{is_centered, overlap_ratio};
use crate::preview::Annotations;
use crate::quality::{classify, sharpness, NearCandidate};
use crate::types::{crop_image, CaptureEvent, Frame, Rect};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Consecutive transient read failures tolerated before the run aborts.
pub const MAX_CONSECUTIVE_SOURCE_FAILURES: u32 = 30;

/// Where the state machine ended up after the last frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Scanning,
    SingleCandidateEvaluation,
    Accepted,
    Rejected,
    MultiCandidateBlur,
    Exit,
}

/// Why a single Near candidate did not produce a capture.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    PersonBlurry { sharpness: f64 },
    NoFace,
    FaceDetectorFailed,
    FaceBlurry { sharpness: f64 },
    OffCenter { overlap: f32 },
    PersistFailed,
}

/// Outcome of one frame.
#[derive(Debug)]
pub enum FrameVerdict {
    Exit,
    /// No Near person in view.
    NoCandidate,
    MultipleCandidates { count: usize },
    /// The candidate's track was already handled.
    AlreadyHandled { track_id: Option<u32> },
    Rejected(RejectReason),
    /// Every gate passed but the overlay-only window is active.
    OverlayOnly,
    DetectorFailed,
    Accepted(Box<CaptureEvent>),
}

/// Verdict plus what to draw on the preview.
#[derive(Debug)]
pub struct FrameReport {
    pub verdict: FrameVerdict,
    pub annotations: Annotations,
}

/// How a call to [`CapturePipeline::run_until_capture`] ended.
#[derive(Debug)]
pub enum RunOutcome {
    Captured(Box<CaptureEvent>),
    Exit,
}

#[derive(Debug, Clone, Copy)]
struct OverlayWindow {
    started: Instant,
    duration: Duration,
}

/// Owns the gates and the per-loop state (ledger, overlay window).
pub struct CapturePipeline {
    detector: Box<dyn PersonDetector + Send>,
    faces: Box<dyn FaceLocator + Send>,
    matcher: IdentityMatcher,
    store: Arc<dyn CaptureStore + Send + Sync>,
    config: GateConfig,
    ledger: TrackLedger,
    overlay_window: Option<OverlayWindow>,
    state: CaptureState,
}

impl CapturePipeline {
    pub fn new(
        detector: Box<dyn PersonDetector + Send>,
        faces: Box<dyn FaceLocator + Send>,
        matcher: IdentityMatcher,
        store: Arc<dyn CaptureStore + Send + Sync>,
        config: GateConfig,
    ) -> Self {
        Self {
            detector,
            faces,
            matcher,
            store,
            config,
            ledger: TrackLedger::new(),
            overlay_window: None,
            state: CaptureState::Scanning,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn ledger(&self) -> &TrackLedger {
        &self.ledger
    }

    /// Open the overlay-only window: for `duration`, frames are still
    /// gated and annotated but never captured.
    pub fn start_overlay_window(&mut self, duration: Duration) {
        tracing::debug!(duration_ms = duration.as_millis() as u64, "overlay-only window started");
        self.overlay_window = Some(OverlayWindow {
            started: Instant::now(),
            duration,
        });
    }

    pub fn overlay_active(&self) -> bool {
        self.overlay_window.is_some()
    }

    fn expire_overlay_window(&mut self) {
        if let Some(window) = self.overlay_window {
            if window.started.elapsed() >= window.duration {
                tracing::debug!("overlay-only window expired");
                self.overlay_window = None;
            }
        }
    }

    /// Evaluate a single frame.
    pub fn process_frame(&mut self, frame: &Frame, quit_requested: bool) -> FrameReport {
        self.expire_overlay_window();

        if quit_requested {
            self.state = CaptureState::Exit;
            return FrameReport {
                verdict: FrameVerdict::Exit,
                annotations: Annotations::default(),
            };
        }

        self.state = CaptureState::Scanning;
        let zone = self.config.safe_zone.to_rect(frame.width(), frame.height());
        let mut annotations = Annotations {
            safe_zone: Some(zone),
            ..Annotations::default()
        };

        let detections = match self.detector.detect(frame) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(frame = frame.sequence, error = %e, "person detection failed");
                return FrameReport {
                    verdict: FrameVerdict::DetectorFailed,
                    annotations,
                };
            }
        };

        let classified = classify(detections, frame, &self.config);
        annotations.far = classified.far.iter().map(|d| d.rect).collect();
        annotations.near = classified.near.iter().map(|c| c.rect).collect();

        self.ledger.sweep_if_empty(classified.near.len());

        let near_count = classified.near.len();
        let verdict = match near_count {
            0 => FrameVerdict::NoCandidate,
            1 => match classified.near.into_iter().next() {
                Some(candidate) => self.evaluate(candidate, &zone, &mut annotations),
                None => FrameVerdict::NoCandidate,
            },
            count => {
                tracing::debug!(frame = frame.sequence, count, "several near persons; blurring frame");
                self.state = CaptureState::MultiCandidateBlur;
                annotations.blur_frame = true;
                FrameVerdict::MultipleCandidates { count }
            }
        };

        FrameReport { verdict, annotations }
    }

    fn evaluate(
        &mut self,
        candidate: NearCandidate,
        zone: &Rect,
        annotations: &mut Annotations,
    ) -> FrameVerdict {
        self.state = CaptureState::SingleCandidateEvaluation;
        let track_id = candidate.detection.track_id;

        if !self.ledger.should_process(track_id) {
            self.state = CaptureState::Scanning;
            return FrameVerdict::AlreadyHandled { track_id };
        }

        let person_sharpness = sharpness(&candidate.crop);
        annotations.person_sharpness = Some(person_sharpness);
        if person_sharpness < self.config.person_blur_threshold {
            return self.reject(RejectReason::PersonBlurry {
                sharpness: person_sharpness,
            });
        }

        let face = match self.faces.locate(&candidate.crop) {
            Ok(Some(face)) => face,
            Ok(None) => return self.reject(RejectReason::NoFace),
            Err(e) => {
                tracing::warn!(error = %e, "face detection failed");
                return self.reject(RejectReason::FaceDetectorFailed);
            }
        };
        let Some(face_crop) = crop_image(&candidate.crop, &face.rect) else {
            return self.reject(RejectReason::NoFace);
        };

        // crop_image truncates the clamped origin, so the crop starts at the floor
        let face_rect = face
            .rect
            .translate(candidate.rect.x1.floor(), candidate.rect.y1.floor());
        annotations.face = Some(face_rect);

        let face_sharpness = sharpness(&face_crop);
        annotations.face_sharpness = Some(face_sharpness);
        if face_sharpness < self.config.face_blur_threshold {
            return self.reject(RejectReason::FaceBlurry {
                sharpness: face_sharpness,
            });
        }

        let center_overlap = overlap_ratio(&face_rect, zone);
        if !is_centered(&face_rect, zone, self.config.center_overlap_threshold) {
            return self.reject(RejectReason::OffCenter {
                overlap: center_overlap,
            });
        }

        if self.overlay_window.is_some() {
            self.state = CaptureState::Scanning;
            return FrameVerdict::OverlayOnly;
        }

        let guest_id = match self.store.save_capture(&candidate.crop) {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(error = %e, "failed to persist capture");
                return self.reject(RejectReason::PersistFailed);
            }
        };

        let identity = self.matcher.identify(&face_crop);
        let status = match &identity {
            Some(m) => TrackStatus::Matched(m.visitor_id.clone()),
            None => TrackStatus::Unknown,
        };
        self.ledger.mark_handled(track_id, status);
        self.state = CaptureState::Accepted;

        tracing::info!(
            guest = %guest_id,
            track = ?track_id,
            visitor = ?identity.as_ref().map(|m| m.name.as_str()),
            person_sharpness,
            face_sharpness,
            center_overlap,
            "capture accepted"
        );

        FrameVerdict::Accepted(Box::new(CaptureEvent {
            guest_id,
            track_id,
            person_crop: candidate.crop,
            face_crop,
            face_rect,
            identity,
            person_sharpness,
            face_sharpness,
            center_overlap,
            timestamp: chrono::Utc::now(),
        }))
    }

    fn reject(&mut self, reason: RejectReason) -> FrameVerdict {
        tracing::debug!(?reason, "candidate rejected");
        self.state = CaptureState::Rejected;
        FrameVerdict::Rejected(reason)
    }

    /// Pull frames until a capture is accepted or `quit` is set.
    ///
    /// `on_frame` sees every processed frame with its report, e.g. to
    /// render a preview. Transient read failures are skipped until
    /// [`MAX_CONSECUTIVE_SOURCE_FAILURES`] occur in a row.
    pub fn run_until_capture<F>(
        &mut self,
        source: &mut dyn FrameSource,
        quit: &AtomicBool,
        mut on_frame: F,
    ) -> Result<RunOutcome, SourceError>
    where
        F: FnMut(&Frame, &FrameReport),
    {
        let mut failures = 0u32;

        loop {
            if quit.load(Ordering::Relaxed) {
                self.state = CaptureState::Exit;
                return Ok(RunOutcome::Exit);
            }

            let frame = match source.next_frame() {
                Ok(frame) => {
                    failures = 0;
                    frame
                }
                Err(SourceError::Transient(msg)) => {
                    failures += 1;
                    tracing::warn!(failures, error = %msg, "frame read failed");
                    if failures >= MAX_CONSECUTIVE_SOURCE_FAILURES {
                        return Err(SourceError::Transient(msg));
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };

            let report = self.process_frame(&frame, quit.load(Ordering::Relaxed));
            on_frame(&frame, &report);

            match report.verdict {
                FrameVerdict::Exit => return Ok(RunOutcome::Exit),
                FrameVerdict::Accepted(event) => return Ok(RunOutcome::Captured(event)),
                _ => {}
            }
        }
    }
}
