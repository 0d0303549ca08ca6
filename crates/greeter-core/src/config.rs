//! Gate thresholds. All values are venue-specific and supplied by the daemon.

use crate::types::Rect;
use serde::Deserialize;

/// Safe-zone rectangle expressed as fractions of the frame size.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct SafeZone {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl Default for SafeZone {
    fn default() -> Self {
        Self {
            left: 0.2,
            top: 0.05,
            right: 0.8,
            bottom: 0.65,
        }
    }
}

impl SafeZone {
    /// Resolve to a pixel rectangle for a `width × height` frame.
    pub fn to_rect(&self, width: u32, height: u32) -> Rect {
        let w = width as f32;
        let h = height as f32;
        Rect::new(self.left * w, self.top * h, self.right * w, self.bottom * h)
    }
}

/// Thresholds consumed by the quality and position gates.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Minimum person box width (px) to count as Near.
    pub near_width: f32,
    /// Minimum person box height (px) to count as Near.
    pub near_height: f32,
    pub person_blur_threshold: f64,
    pub face_blur_threshold: f64,
    /// Fraction of the face box that must lie inside the safe zone.
    pub center_overlap_threshold: f32,
    pub safe_zone: SafeZone,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            near_width: 200.0,
            near_height: 500.0,
            person_blur_threshold: 30.0,
            face_blur_threshold: 30.0,
            center_overlap_threshold: 0.9,
            safe_zone: SafeZone::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_zone_to_rect() {
        let zone = SafeZone {
            left: 0.25,
            top: 0.0,
            right: 0.75,
            bottom: 0.5,
        };
        assert_eq!(zone.to_rect(400, 200), Rect::new(100.0, 0.0, 300.0, 100.0));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let cfg: GateConfig = toml::from_str("near_width = 320.0\n[safe_zone]\ntop = 0.1\n").unwrap();
        assert_eq!(cfg.near_width, 320.0);
        assert_eq!(cfg.near_height, 500.0);
        assert_eq!(cfg.safe_zone.top, 0.1);
        assert_eq!(cfg.safe_zone.left, 0.2);
    }
}
