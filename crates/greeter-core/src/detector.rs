//! Person and face detectors via ONNX Runtime.
//!
//! - [`YoloPersonDetector`]: end-to-end YOLOv10 export, letterboxed 640×640 RGB
//!   input, `[1, N, 6]` output of `(x1, y1, x2, y2, score, class)`.
//! - [`SsdFaceDetector`]: ResNet-10 SSD face model, 300×300 BGR input with
//!   mean subtraction, `[1, 1, N, 7]` output of normalised boxes.

use crate::collaborators::{FaceLocator, PersonDetector};
use crate::types::{Detection, FaceBox, Frame, Rect};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- YOLO constants ---
const YOLO_INPUT_SIZE: u32 = 640;
const YOLO_PAD_VALUE: u8 = 114;
const YOLO_ROW_LEN: usize = 6;
const PERSON_CLASS: f32 = 0.0;

// --- SSD constants ---
const SSD_INPUT_SIZE: u32 = 300;
const SSD_MEAN_BGR: [f32; 3] = [104.0, 177.0, 123.0];
const SSD_ROW_LEN: usize = 7;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("empty input image")]
    EmptyInput,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

fn load_session(model_path: &str, kind: &str) -> Result<Session, DetectorError> {
    if !Path::new(model_path).exists() {
        return Err(DetectorError::ModelNotFound(model_path.to_string()));
    }

    let session = Session::builder()?
        .with_intra_threads(2)?
        .commit_from_file(model_path)?;

    tracing::info!(
        path = model_path,
        inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
        outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
        "loaded {kind} model"
    );

    Ok(session)
}

/// Metadata for coordinate de-mapping after letterbox resize.
#[derive(Debug, Clone, Copy)]
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl LetterboxInfo {
    fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Resize `image` to fit a `size × size` canvas, centred and padded with `pad`.
fn letterbox(image: &RgbImage, size: u32, pad: u8) -> (RgbImage, LetterboxInfo) {
    let (width, height) = image.dimensions();
    let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
    let new_w = ((width as f32 * scale).round() as u32).clamp(1, size);
    let new_h = ((height as f32 * scale).round() as u32).clamp(1, size);
    let pad_x = (size - new_w) / 2;
    let pad_y = (size - new_h) / 2;

    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);
    let mut canvas = RgbImage::from_pixel(size, size, image::Rgb([pad, pad, pad]));
    imageops::replace(&mut canvas, &resized, pad_x as i64, pad_y as i64);

    (
        canvas,
        LetterboxInfo {
            scale,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
        },
    )
}

/// YOLOv10 person detector.
pub struct YoloPersonDetector {
    session: Session,
    confidence_floor: f32,
}

impl YoloPersonDetector {
    pub fn load(model_path: &str, confidence_floor: f32) -> Result<Self, DetectorError> {
        let session = load_session(model_path, "YOLO")?;
        Ok(Self {
            session,
            confidence_floor,
        })
    }

    /// RGB canvas → NCHW float tensor scaled to [0, 1].
    fn preprocess(canvas: &RgbImage) -> Array4<f32> {
        let size = canvas.width() as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, pixel) in canvas.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
            }
        }
        tensor
    }
}

impl PersonDetector for YoloPersonDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectorError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Err(DetectorError::EmptyInput);
        }

        let (canvas, letterbox) = letterbox(frame.image(), YOLO_INPUT_SIZE, YOLO_PAD_VALUE);
        let input = Self::preprocess(&canvas);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, rows) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("yolo output: {e}")))?;

        Ok(decode_yolo(
            rows,
            &letterbox,
            self.confidence_floor,
            frame.width() as f32,
            frame.height() as f32,
        ))
    }
}

/// Decode `(x1, y1, x2, y2, score, class)` rows into frame-space person detections.
fn decode_yolo(
    rows: &[f32],
    letterbox: &LetterboxInfo,
    confidence_floor: f32,
    frame_w: f32,
    frame_h: f32,
) -> Vec<Detection> {
    rows.chunks_exact(YOLO_ROW_LEN)
        .filter(|row| row[5] == PERSON_CLASS && row[4] >= confidence_floor)
        .map(|row| {
            let (x1, y1) = letterbox.to_source(row[0], row[1]);
            let (x2, y2) = letterbox.to_source(row[2], row[3]);
            Detection {
                rect: Rect::new(x1, y1, x2, y2).clamp_to(frame_w, frame_h),
                confidence: row[4],
                track_id: None,
            }
        })
        .collect()
}

/// ResNet-10 SSD face detector.
pub struct SsdFaceDetector {
    session: Session,
    confidence_floor: f32,
}

impl SsdFaceDetector {
    pub fn load(model_path: &str, confidence_floor: f32) -> Result<Self, DetectorError> {
        let session = load_session(model_path, "SSD face")?;
        Ok(Self {
            session,
            confidence_floor,
        })
    }

    /// All faces above `min_confidence`, highest confidence first.
    pub fn detect_all(
        &mut self,
        image: &RgbImage,
        min_confidence: f32,
    ) -> Result<Vec<FaceBox>, DetectorError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(DetectorError::EmptyInput);
        }

        let resized = imageops::resize(image, SSD_INPUT_SIZE, SSD_INPUT_SIZE, FilterType::Triangle);
        let input = Self::preprocess(&resized);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, rows) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("ssd output: {e}")))?;

        Ok(decode_ssd(rows, min_confidence, width as f32, height as f32))
    }

    /// RGB image → NCHW BGR float tensor with per-channel mean subtracted.
    fn preprocess(resized: &RgbImage) -> Array4<f32> {
        let size = resized.width() as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, pixel) in resized.enumerate_pixels() {
            let bgr = [pixel[2], pixel[1], pixel[0]];
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] = bgr[c] as f32 - SSD_MEAN_BGR[c];
            }
        }
        tensor
    }
}

impl FaceLocator for SsdFaceDetector {
    fn locate(&mut self, person: &RgbImage) -> Result<Option<FaceBox>, DetectorError> {
        let floor = self.confidence_floor;
        Ok(self.detect_all(person, floor)?.into_iter().next())
    }
}

/// Decode `(_, _, conf, x1, y1, x2, y2)` rows. Boxes are scaled to the image
/// and clamped; faces with no area after clamping are dropped.
fn decode_ssd(rows: &[f32], min_confidence: f32, width: f32, height: f32) -> Vec<FaceBox> {
    let mut faces: Vec<FaceBox> = rows
        .chunks_exact(SSD_ROW_LEN)
        .filter(|row| row[2] > min_confidence)
        .map(|row| FaceBox {
            rect: Rect::new(row[3] * width, row[4] * height, row[5] * width, row[6] * height)
                .clamp_to(width, height),
            confidence: row[2],
        })
        .filter(|face| face.rect.area() > 0.0)
        .collect();

    faces.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    faces
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_letterbox_landscape() {
        let img = RgbImage::new(1280, 720);
        let (canvas, info) = letterbox(&img, 640, 114);
        assert_eq!(canvas.dimensions(), (640, 640));
        assert!((info.scale - 0.5).abs() < 1e-6);
        assert_eq!(info.pad_x, 0.0);
        assert_eq!(info.pad_y, 140.0);
        // Padding rows keep the pad value.
        assert_eq!(canvas.get_pixel(0, 0)[0], 114);
        assert_eq!(canvas.get_pixel(320, 320)[0], 0);
    }

    #[test]
    fn test_letterbox_coordinate_roundtrip() {
        let img = RgbImage::new(320, 240);
        let (_, info) = letterbox(&img, 640, 114);
        let (x, y) = (100.0f32, 50.0f32);
        let boxed = (x * info.scale + info.pad_x, y * info.scale + info.pad_y);
        let (rx, ry) = info.to_source(boxed.0, boxed.1);
        assert!((rx - x).abs() < 0.1, "x: {rx} vs {x}");
        assert!((ry - y).abs() < 0.1, "y: {ry} vs {y}");
    }

    #[test]
    fn test_decode_yolo_filters_class_and_confidence() {
        let info = LetterboxInfo { scale: 0.5, pad_x: 0.0, pad_y: 140.0 };
        let rows = [
            // person, confident
            10.0, 150.0, 110.0, 400.0, 0.9, 0.0,
            // person, weak
            10.0, 150.0, 110.0, 400.0, 0.2, 0.0,
            // dog
            10.0, 150.0, 110.0, 400.0, 0.95, 16.0,
        ];
        let dets = decode_yolo(&rows, &info, 0.5, 1280.0, 720.0);
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].rect, Rect::new(20.0, 20.0, 220.0, 520.0));
        assert!(dets[0].track_id.is_none());
    }

    #[test]
    fn test_decode_yolo_ignores_trailing_partial_row() {
        let info = LetterboxInfo { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };
        let rows = [0.0, 0.0, 10.0, 10.0, 0.9, 0.0, 1.0, 2.0];
        assert_eq!(decode_yolo(&rows, &info, 0.5, 100.0, 100.0).len(), 1);
    }

    #[test]
    fn test_decode_ssd_sorts_and_clamps() {
        let rows = [
            0.0, 1.0, 0.95, 0.1, 0.1, 0.5, 0.5,
            0.0, 1.0, 0.99, 0.6, 0.6, 1.2, 1.1,
            0.0, 1.0, 0.30, 0.0, 0.0, 0.2, 0.2,
        ];
        let faces = decode_ssd(&rows, 0.9, 100.0, 200.0);
        assert_eq!(faces.len(), 2);
        assert!((faces[0].confidence - 0.99).abs() < 1e-6);
        assert_eq!(faces[0].rect, Rect::new(60.0, 120.0, 100.0, 200.0));
    }

    #[test]
    fn test_decode_ssd_drops_empty_boxes() {
        let rows = [0.0, 1.0, 0.99, 1.5, 1.5, 2.0, 2.0];
        assert!(decode_ssd(&rows, 0.9, 100.0, 100.0).is_empty());
    }

    #[test]
    fn test_ssd_preprocess_subtracts_bgr_mean() {
        let img = RgbImage::from_pixel(2, 2, image::Rgb([10, 20, 30]));
        let t = SsdFaceDetector::preprocess(&img);
        assert_eq!(t.shape(), &[1, 3, 2, 2]);
        assert_eq!(t[[0, 0, 0, 0]], 30.0 - 104.0);
        assert_eq!(t[[0, 1, 0, 0]], 20.0 - 177.0);
        assert_eq!(t[[0, 2, 0, 0]], 10.0 - 123.0);
    }
}
