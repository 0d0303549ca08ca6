//! Display copy of a frame with privacy blur and gate annotations.

use crate::types::{crop_image, Frame, Rect};
use image::{imageops, Rgb, RgbImage};

const BLUR_SIGMA: f32 = 8.0;
const OUTLINE_PX: u32 = 2;

const RED: Rgb<u8> = Rgb([255, 0, 0]);
const GREEN: Rgb<u8> = Rgb([0, 255, 0]);
const YELLOW: Rgb<u8> = Rgb([255, 255, 0]);
const CYAN: Rgb<u8> = Rgb([0, 255, 255]);

/// What the gates saw in one frame, for rendering only.
#[derive(Debug, Clone, Default)]
pub struct Annotations {
    pub far: Vec<Rect>,
    pub near: Vec<Rect>,
    /// Set when several Near persons made the frame ambiguous.
    pub blur_frame: bool,
    pub safe_zone: Option<Rect>,
    /// Face box in frame coordinates.
    pub face: Option<Rect>,
    pub person_sharpness: Option<f64>,
    pub face_sharpness: Option<f64>,
}

/// Render a preview image. The source frame is left untouched.
pub fn render_preview(frame: &Frame, annotations: &Annotations) -> RgbImage {
    let mut canvas = frame.image().clone();

    for rect in &annotations.far {
        blur_region(&mut canvas, rect);
        draw_outline(&mut canvas, rect, RED);
    }

    if annotations.blur_frame {
        canvas = imageops::blur(&canvas, BLUR_SIGMA);
    }

    if let Some(zone) = &annotations.safe_zone {
        draw_outline(&mut canvas, zone, YELLOW);
    }
    for rect in &annotations.near {
        draw_outline(&mut canvas, rect, GREEN);
    }
    if let Some(face) = &annotations.face {
        draw_outline(&mut canvas, face, CYAN);
    }

    canvas
}

fn blur_region(canvas: &mut RgbImage, rect: &Rect) {
    let Some(region) = crop_image(canvas, rect) else {
        return;
    };
    let blurred = imageops::blur(&region, BLUR_SIGMA);
    let r = rect.clamp_to(canvas.width() as f32, canvas.height() as f32);
    imageops::replace(canvas, &blurred, r.x1 as i64, r.y1 as i64);
}

fn draw_outline(canvas: &mut RgbImage, rect: &Rect, color: Rgb<u8>) {
    let (w, h) = canvas.dimensions();
    let r = rect.clamp_to(w as f32, h as f32);
    let (x1, y1) = (r.x1 as u32, r.y1 as u32);
    let (x2, y2) = ((r.x2 as u32).min(w), (r.y2 as u32).min(h));
    if x2 <= x1 || y2 <= y1 {
        return;
    }

    for y in y1..y2 {
        for x in x1..x2 {
            let on_edge = x < x1 + OUTLINE_PX
                || x + OUTLINE_PX >= x2
                || y < y1 + OUTLINE_PX
                || y + OUTLINE_PX >= y2;
            if on_edge {
                canvas.put_pixel(x, y, color);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_does_not_touch_source() {
        let frame = Frame::new(RgbImage::from_pixel(50, 50, Rgb([10, 10, 10])), 0);
        let ann = Annotations {
            near: vec![Rect::new(5.0, 5.0, 20.0, 20.0)],
            blur_frame: true,
            ..Annotations::default()
        };
        let preview = render_preview(&frame, &ann);
        assert_eq!(frame.image().get_pixel(5, 5), &Rgb([10, 10, 10]));
        assert_eq!(preview.get_pixel(5, 5), &GREEN);
    }

    #[test]
    fn test_outline_only_on_edges() {
        let frame = Frame::new(RgbImage::new(40, 40), 0);
        let ann = Annotations {
            far: vec![Rect::new(10.0, 10.0, 30.0, 30.0)],
            ..Annotations::default()
        };
        let preview = render_preview(&frame, &ann);
        assert_eq!(preview.get_pixel(10, 10), &RED);
        assert_eq!(preview.get_pixel(29, 20), &RED);
        assert_eq!(preview.get_pixel(20, 20), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_far_region_is_blurred() {
        let img = RgbImage::from_fn(40, 40, |x, _| if x % 2 == 0 { Rgb([255, 255, 255]) } else { Rgb([0, 0, 0]) });
        let frame = Frame::new(img, 0);
        let ann = Annotations {
            far: vec![Rect::new(0.0, 0.0, 40.0, 40.0)],
            ..Annotations::default()
        };
        let preview = render_preview(&frame, &ann);
        let center = preview.get_pixel(20, 20)[0];
        assert!(center > 50 && center < 205, "center pixel {center} not blurred");
    }
}
