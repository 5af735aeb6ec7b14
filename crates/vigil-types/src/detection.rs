use serde::{Deserialize, Serialize};

/// Label given to any face that does not match a known encoding.
pub const UNKNOWN_NAME: &str = "Unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: u32,
    pub y: u32,
}

impl Point {
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    pub fn scaled(self, factor: f32) -> Self {
        Self {
            x: scale_coord(self.x, factor),
            y: scale_coord(self.y, factor),
        }
    }
}

/// Axis-aligned box in pixel coordinates, edges inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl BoundingBox {
    pub const fn new(left: u32, top: u32, right: u32, bottom: u32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left) + 1
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top) + 1
    }

    /// Maps a box computed on a resized image back onto the original one.
    pub fn scaled(&self, factor: f32) -> Self {
        Self {
            left: scale_coord(self.left, factor),
            top: scale_coord(self.top, factor),
            right: scale_coord(self.right, factor),
            bottom: scale_coord(self.bottom, factor),
        }
    }
}

fn scale_coord(value: u32, factor: f32) -> u32 {
    (value as f32 * factor).round().max(0.0) as u32
}

/// A foreground area that survived the motion-noise floor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionRegion {
    /// Foreground pixel count.
    pub area: u32,
    pub bounds: BoundingBox,
    /// Traced outer boundary, clockwise.
    pub outline: Vec<Point>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceMatch {
    pub bounds: BoundingBox,
    pub name: String,
    pub is_unknown: bool,
}

impl FaceMatch {
    pub fn known(bounds: BoundingBox, name: impl Into<String>) -> Self {
        Self {
            bounds,
            name: name.into(),
            is_unknown: false,
        }
    }

    pub fn unknown(bounds: BoundingBox) -> Self {
        Self {
            bounds,
            name: UNKNOWN_NAME.to_string(),
            is_unknown: true,
        }
    }
}

/// Output of one detection cycle. Geometry is expressed in the downscaled
/// detection space.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub motion_regions: Vec<MotionRegion>,
    pub faces: Vec<FaceMatch>,
}

impl DetectionResult {
    pub fn motion_detected(&self) -> bool {
        !self.motion_regions.is_empty()
    }

    pub fn has_unknown(&self) -> bool {
        self.faces.iter().any(|face| face.is_unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rescale_box_to_full_resolution() {
        let small = BoundingBox::new(10, 5, 20, 15);
        let full = small.scaled(4.0);
        assert_eq!(full, BoundingBox::new(40, 20, 80, 60));
        assert_eq!(small.width(), 11);
    }

    #[test]
    fn unknown_faces_flag_result() {
        let mut result = DetectionResult::default();
        result
            .faces
            .push(FaceMatch::known(BoundingBox::new(0, 0, 1, 1), "alice"));
        assert!(!result.has_unknown());
        result.faces.push(FaceMatch::unknown(BoundingBox::new(2, 2, 3, 3)));
        assert!(result.has_unknown());
        assert_eq!(result.faces[1].name, UNKNOWN_NAME);
    }
}
