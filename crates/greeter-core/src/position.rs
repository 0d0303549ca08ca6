//! Position gate: is the face substantially inside the safe zone?

use crate::types::Rect;

/// Fraction of `face`'s own area that lies inside `zone`, in [0, 1].
///
/// The denominator is the face area, not the union: a face fully inside the
/// zone scores 1.0 whatever the zone's size, while a sliver of face inside a
/// large zone scores low. A face with no area scores 0.
pub fn overlap_ratio(face: &Rect, zone: &Rect) -> f32 {
    let area = face.area();
    if area <= 0.0 {
        return 0.0;
    }
    (face.intersection_area(zone) / area).clamp(0.0, 1.0)
}

/// Centered iff the overlap ratio reaches `threshold`.
pub fn is_centered(face: &Rect, zone: &Rect, threshold: f32) -> bool {
    overlap_ratio(face, zone) >= threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fully_inside_is_one() {
        let face = Rect::new(10.0, 10.0, 20.0, 20.0);
        let zone = Rect::new(0.0, 0.0, 100.0, 100.0);
        assert!((overlap_ratio(&face, &zone) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_disjoint_is_zero() {
        let face = Rect::new(0.0, 0.0, 10.0, 10.0);
        let zone = Rect::new(50.0, 50.0, 60.0, 60.0);
        assert_eq!(overlap_ratio(&face, &zone), 0.0);
    }

    #[test]
    fn test_straddling_left_edge_is_half() {
        let face = Rect::new(0.0, 0.0, 10.0, 10.0);
        let zone = Rect::new(5.0, 0.0, 20.0, 10.0);
        assert!((overlap_ratio(&face, &zone) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_ratio_is_relative_to_face_not_zone() {
        // Zone fully inside a larger face: only a quarter of the face is covered.
        let face = Rect::new(0.0, 0.0, 20.0, 20.0);
        let zone = Rect::new(0.0, 0.0, 10.0, 10.0);
        assert!((overlap_ratio(&face, &zone) - 0.25).abs() < 1e-6);
        assert!((overlap_ratio(&zone, &face) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_degenerate_face_is_zero() {
        let face = Rect::new(5.0, 5.0, 5.0, 9.0);
        let zone = Rect::new(0.0, 0.0, 10.0, 10.0);
        assert_eq!(overlap_ratio(&face, &zone), 0.0);
    }

    #[test]
    fn test_is_centered_threshold_inclusive() {
        let face = Rect::new(0.0, 0.0, 10.0, 10.0);
        let zone = Rect::new(1.0, 0.0, 20.0, 10.0);
        // 90% inside
        assert!(is_centered(&face, &zone, 0.9));
        assert!(!is_centered(&face, &zone, 0.91));
    }
}
