//! Short-lived track ids for detectors that do not track on their own.
//!
//! Greedy IoU association against the previous frame's boxes.

use crate::collaborators::PersonDetector;
use crate::detector::DetectorError;
use crate::types::{Detection, Frame, Rect};

const DEFAULT_IOU_THRESHOLD: f32 = 0.3;
const DEFAULT_MAX_MISSED: u32 = 5;

struct Track {
    id: u32,
    rect: Rect,
    missed: u32,
}

/// Assigns track ids that stay stable while a box keeps overlapping itself.
pub struct IouTracker {
    tracks: Vec<Track>,
    next_id: u32,
    iou_threshold: f32,
    max_missed: u32,
}

impl Default for IouTracker {
    fn default() -> Self {
        Self::new(DEFAULT_IOU_THRESHOLD, DEFAULT_MAX_MISSED)
    }
}

impl IouTracker {
    pub fn new(iou_threshold: f32, max_missed: u32) -> Self {
        Self {
            tracks: Vec::new(),
            next_id: 1,
            iou_threshold,
            max_missed,
        }
    }

    /// Fill in `track_id` for every detection that lacks one.
    pub fn assign(&mut self, detections: &mut [Detection]) {
        let mut pairs: Vec<(f32, usize, usize)> = Vec::new();
        for (ti, track) in self.tracks.iter().enumerate() {
            for (di, det) in detections.iter().enumerate() {
                if det.track_id.is_some() {
                    continue;
                }
                let iou = track.rect.iou(&det.rect);
                if iou >= self.iou_threshold {
                    pairs.push((iou, ti, di));
                }
            }
        }
        pairs.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let mut track_used = vec![false; self.tracks.len()];
        let mut det_used = vec![false; detections.len()];

        for (_, ti, di) in pairs {
            if track_used[ti] || det_used[di] {
                continue;
            }
            track_used[ti] = true;
            det_used[di] = true;
            let track = &mut self.tracks[ti];
            track.rect = detections[di].rect;
            track.missed = 0;
            detections[di].track_id = Some(track.id);
        }

        for (track, used) in self.tracks.iter_mut().zip(&track_used) {
            if !used {
                track.missed += 1;
            }
        }
        let max_missed = self.max_missed;
        self.tracks.retain(|t| t.missed <= max_missed);

        for (det, used) in detections.iter_mut().zip(&det_used) {
            if *used || det.track_id.is_some() {
                continue;
            }
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            det.track_id = Some(id);
            self.tracks.push(Track {
                id,
                rect: det.rect,
                missed: 0,
            });
        }
    }
}

/// Wraps a person detector and stamps its detections with track ids.
pub struct TrackedDetector<D> {
    inner: D,
    tracker: IouTracker,
}

impl<D: PersonDetector> TrackedDetector<D> {
    pub fn new(inner: D, tracker: IouTracker) -> Self {
        Self { inner, tracker }
    }
}

impl<D: PersonDetector> PersonDetector for TrackedDetector<D> {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectorError> {
        let mut detections = self.inner.detect(frame)?;
        self.tracker.assign(&mut detections);
        Ok(detections)
    }
}
