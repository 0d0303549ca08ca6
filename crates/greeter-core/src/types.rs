use chrono::{DateTime, Utc};
use image::{imageops, RgbImage};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Axis-aligned rectangle in pixel coordinates, `(x1, y1)` inclusive to `(x2, y2)` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl Rect {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Area shared by both rectangles (0.0 when disjoint).
    pub fn intersection_area(&self, other: &Rect) -> f32 {
        let inter_w = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let inter_h = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        inter_w * inter_h
    }

    /// Intersection-over-Union between two rectangles.
    pub fn iou(&self, other: &Rect) -> f32 {
        let inter = self.intersection_area(other);
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }

    /// Shift by `(dx, dy)`, e.g. from person-crop space into frame space.
    pub fn translate(&self, dx: f32, dy: f32) -> Rect {
        Rect::new(self.x1 + dx, self.y1 + dy, self.x2 + dx, self.y2 + dy)
    }

    /// Clamp to `[0, width] × [0, height]`.
    pub fn clamp_to(&self, width: f32, height: f32) -> Rect {
        Rect::new(
            self.x1.clamp(0.0, width),
            self.y1.clamp(0.0, height),
            self.x2.clamp(0.0, width),
            self.y2.clamp(0.0, height),
        )
    }
}

/// Copy the region under `rect` out of `image`, clamped to the image bounds.
///
/// Returns `None` when the clamped region is empty.
pub fn crop_image(image: &RgbImage, rect: &Rect) -> Option<RgbImage> {
    let r = rect.clamp_to(image.width() as f32, image.height() as f32);
    let x = r.x1 as u32;
    let y = r.y1 as u32;
    let w = (r.x2 as u32).saturating_sub(x);
    let h = (r.y2 as u32).saturating_sub(y);
    if w == 0 || h == 0 {
        return None;
    }
    Some(imageops::crop_imm(image, x, y, w, h).to_image())
}

/// An immutable RGB video frame.
///
/// The pixel buffer is shared, so cloning a frame for display is cheap and
/// never aliases a mutable buffer used by the gating logic.
#[derive(Clone)]
pub struct Frame {
    image: Arc<RgbImage>,
    pub sequence: u64,
    pub timestamp: Instant,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u64) -> Self {
        Self {
            image: Arc::new(image),
            sequence,
            timestamp: Instant::now(),
        }
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn crop(&self, rect: &Rect) -> Option<RgbImage> {
        crop_image(&self.image, rect)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("sequence", &self.sequence)
            .finish()
    }
}

/// One detected person in a frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub rect: Rect,
    pub confidence: f32,
    /// Stable only while the tracker keeps the subject in view.
    pub track_id: Option<u32>,
}

/// A face located inside a person crop. Coordinates are relative to the crop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceBox {
    pub rect: Rect,
    pub confidence: f32,
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    /// Cosine similarity in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            dot / denom
        } else {
            0.0
        }
    }

    /// Cosine distance in [0, 2]. Smaller = more similar.
    pub fn cosine_distance(&self, other: &Embedding) -> f32 {
        1.0 - self.similarity(other)
    }
}

/// Identifier of an enrolled visitor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VisitorId(pub String);

impl fmt::Display for VisitorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a persisted guest capture.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GuestId(pub String);

impl fmt::Display for GuestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An accepted nearest-neighbour identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityMatch {
    pub visitor_id: VisitorId,
    pub name: String,
    pub distance: f32,
}

/// Terminal output of one accepted gating cycle.
#[derive(Debug, Clone)]
pub struct CaptureEvent {
    pub guest_id: GuestId,
    pub track_id: Option<u32>,
    pub person_crop: RgbImage,
    pub face_crop: RgbImage,
    /// Face box in frame coordinates.
    pub face_rect: Rect,
    pub identity: Option<IdentityMatch>,
    pub person_sharpness: f64,
    pub face_sharpness: f64,
    pub center_overlap: f32,
    pub timestamp: DateTime<Utc>,
}
