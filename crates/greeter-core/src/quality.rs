//! Quality gate: near/far size classification and blur measurement.

use crate::config::GateConfig;
use crate::types::{Detection, Frame, Rect};
use image::RgbImage;

/// Size-based proximity class of a detected person.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    Near,
    Far,
}

/// A Near detection together with its person crop.
#[derive(Debug, Clone)]
pub struct NearCandidate {
    pub detection: Detection,
    /// Detection box clamped to the frame; the crop's origin in frame space.
    pub rect: Rect,
    pub crop: RgbImage,
}

/// Result of classifying every detection in a frame.
#[derive(Debug, Default)]
pub struct Classified {
    pub near: Vec<NearCandidate>,
    pub far: Vec<Detection>,
}

/// Classify a single box by its size (clamped to the frame).
pub fn size_class(rect: &Rect, config: &GateConfig) -> SizeClass {
    if rect.width() >= config.near_width && rect.height() >= config.near_height {
        SizeClass::Near
    } else {
        SizeClass::Far
    }
}

/// Split detections into Near candidates (with crops) and Far detections.
///
/// A detection whose clamped box is empty cannot be cropped and is treated as Far.
pub fn classify(detections: Vec<Detection>, frame: &Frame, config: &GateConfig) -> Classified {
    let mut classified = Classified::default();

    for detection in detections {
        let rect = detection
            .rect
            .clamp_to(frame.width() as f32, frame.height() as f32);

        if size_class(&rect, config) == SizeClass::Far {
            classified.far.push(detection);
            continue;
        }

        match frame.crop(&rect) {
            Some(crop) => classified.near.push(NearCandidate {
                detection,
                rect,
                crop,
            }),
            None => classified.far.push(detection),
        }
    }

    classified
}

/// Blur metric: variance of the 3×3 Laplacian response over a grayscale copy.
///
/// Higher = sharper. Borders are handled by reflection (101), matching the
/// usual computer-vision definition of this metric.
pub fn sharpness(crop: &RgbImage) -> f64 {
    let w = crop.width() as usize;
    let h = crop.height() as usize;
    if w == 0 || h == 0 {
        return 0.0;
    }

    // BT.601 luma
    let gray: Vec<f64> = crop
        .pixels()
        .map(|p| 0.299 * p[0] as f64 + 0.587 * p[1] as f64 + 0.114 * p[2] as f64)
        .collect();

    let at = |x: isize, y: isize| -> f64 {
        gray[reflect(y, h) * w + reflect(x, w)]
    };

    let n = (w * h) as f64;
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;

    for y in 0..h as isize {
        for x in 0..w as isize {
            let response =
                at(x - 1, y) + at(x + 1, y) + at(x, y - 1) + at(x, y + 1) - 4.0 * at(x, y);
            sum += response;
            sum_sq += response * response;
        }
    }

    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0)
}

fn reflect(i: isize, len: usize) -> usize {
    let len = len as isize;
    if len == 1 {
        return 0;
    }
    let r = if i < 0 {
        -i
    } else if i >= len {
        2 * len - i - 2
    } else {
        i
    };
    r.clamp(0, len - 1) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn cfg() -> GateConfig {
        GateConfig {
            near_width: 50.0,
            near_height: 100.0,
            ..GateConfig::default()
        }
    }

    fn det(x1: f32, y1: f32, x2: f32, y2: f32) -> Detection {
        Detection {
            rect: Rect::new(x1, y1, x2, y2),
            confidence: 0.9,
            track_id: None,
        }
    }

    #[test]
    fn test_size_class_boundary_is_inclusive() {
        assert_eq!(size_class(&Rect::new(0.0, 0.0, 50.0, 100.0), &cfg()), SizeClass::Near);
        assert_eq!(size_class(&Rect::new(0.0, 0.0, 49.0, 100.0), &cfg()), SizeClass::Far);
        assert_eq!(size_class(&Rect::new(0.0, 0.0, 50.0, 99.0), &cfg()), SizeClass::Far);
    }

    #[test]
    fn test_classify_splits_near_and_far() {
        let frame = Frame::new(RgbImage::new(320, 240), 0);
        let out = classify(
            vec![det(0.0, 0.0, 60.0, 120.0), det(100.0, 0.0, 120.0, 30.0)],
            &frame,
            &cfg(),
        );
        assert_eq!(out.near.len(), 1);
        assert_eq!(out.far.len(), 1);
        assert_eq!(out.near[0].crop.dimensions(), (60, 120));
    }

    #[test]
    fn test_classify_uses_clamped_size() {
        // Box extends past the frame; only 40px of width is visible.
        let frame = Frame::new(RgbImage::new(100, 200), 0);
        let out = classify(vec![det(60.0, 0.0, 160.0, 150.0)], &frame, &cfg());
        assert!(out.near.is_empty());
        assert_eq!(out.far.len(), 1);
    }

    #[test]
    fn test_classify_empty() {
        let frame = Frame::new(RgbImage::new(10, 10), 0);
        let out = classify(vec![], &frame, &cfg());
        assert!(out.near.is_empty() && out.far.is_empty());
    }

    #[test]
    fn test_sharpness_uniform_is_zero() {
        let img = RgbImage::from_pixel(16, 16, Rgb([120, 120, 120]));
        assert!(sharpness(&img) < 1e-9);
    }

    #[test]
    fn test_sharpness_checkerboard_beats_gradient() {
        let checker = RgbImage::from_fn(16, 16, |x, y| {
            if (x + y) % 2 == 0 {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            }
        });
        let gradient = RgbImage::from_fn(16, 16, |x, _| {
            let v = (x * 8) as u8;
            Rgb([v, v, v])
        });
        assert!(sharpness(&checker) > sharpness(&gradient));
        assert!(sharpness(&checker) > 1000.0);
    }

    #[test]
    fn test_sharpness_single_pixel() {
        let img = RgbImage::from_pixel(1, 1, Rgb([255, 0, 0]));
        assert_eq!(sharpness(&img), 0.0);
    }

    #[test]
    fn test_reflect_101() {
        assert_eq!(reflect(-1, 5), 1);
        assert_eq!(reflect(5, 5), 3);
        assert_eq!(reflect(2, 5), 2);
    }
}
