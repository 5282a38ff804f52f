use serde::{Deserialize, Serialize};

/// Pixel bounds of a detected face within its source frame.
///
/// `right` and `bottom` are exclusive, so `right - left` is the width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub left: u32,
}

impl FaceRegion {
    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }

    /// Bounding-box area in pixels.
    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.area() == 0
    }

    /// Region covering an entire `width` x `height` frame.
    pub fn full_frame(width: u32, height: u32) -> Self {
        Self {
            top: 0,
            right: width,
            bottom: height,
            left: 0,
        }
    }

    /// Clamp the region to the bounds of a `width` x `height` frame.
    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        let left = self.left.min(width);
        let top = self.top.min(height);
        Self {
            top,
            right: self.right.clamp(left, width),
            bottom: self.bottom.clamp(top, height),
            left,
        }
    }
}

/// Face encoding vector (512-dimensional for ArcFace).
///
/// Compared by cosine distance `1 - cos(a, b)`: 0.0 for the same direction,
/// 2.0 for opposite ones. Lower means more similar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Encoding(Vec<f32>);

impl Encoding {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// A usable encoding is non-empty, finite and not the zero vector.
    pub fn is_valid(&self) -> bool {
        self.0.iter().all(|v| v.is_finite()) && self.norm() > 0.0
    }

    /// Cosine distance to `other`.
    ///
    /// Returns `None` when either side is invalid or the dimensions differ.
    pub fn distance(&self, other: &Encoding) -> Option<f32> {
        if !self.is_valid() || !other.is_valid() || self.len() != other.len() {
            return None;
        }
        let dot: f32 = self.0.iter().zip(other.0.iter()).map(|(a, b)| a * b).sum();
        let cos = (dot / (self.norm() * other.norm())).clamp(-1.0, 1.0);
        Some(1.0 - cos)
    }

    fn norm(&self) -> f32 {
        self.0.iter().map(|v| v * v).sum::<f32>().sqrt()
    }
}

impl From<Vec<f32>> for Encoding {
    fn from(values: Vec<f32>) -> Self {
        Self(values)
    }
}

/// A trusted identity: unique name plus its reference encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityRecord {
    pub name: String,
    pub encoding: Encoding,
}

/// Best gallery match for a query encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityMatch {
    pub name: String,
    pub distance: f32,
}
