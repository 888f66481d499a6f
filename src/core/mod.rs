pub mod detector;
pub mod quality;
pub mod recognizer;
pub mod tracker;

use serde::{Deserialize, Serialize};

pub use detector::{Detection, PersonBackend, PersonDetector, YoloPersonDetector};
pub use recognizer::{Encoding, FaceBackend, FaceBox, FaceRecognizer, OnnxFaceEngine, ENCODING_LEN};
pub use tracker::{Track, TrackStatus, Tracker};

/// Axis-aligned box in frame pixel space, corner form.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
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

    pub fn aspect_ratio(&self) -> f32 {
        let w = self.width();
        if w > 0.0 {
            self.height() / w
        } else {
            0.0
        }
    }

    pub fn iou(&self, other: &BBox) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);

        let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - intersection;

        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }

    /// Shift by an origin, mapping crop-local coordinates into frame space.
    pub fn offset(&self, dx: f32, dy: f32) -> BBox {
        BBox::new(self.x1 + dx, self.y1 + dy, self.x2 + dx, self.y2 + dy)
    }

    pub fn scale(&self, factor: f32) -> BBox {
        BBox::new(
            self.x1 * factor,
            self.y1 * factor,
            self.x2 * factor,
            self.y2 * factor,
        )
    }

    pub fn clamp_to(&self, width: u32, height: u32) -> BBox {
        BBox::new(
            self.x1.clamp(0.0, width as f32),
            self.y1.clamp(0.0, height as f32),
            self.x2.clamp(0.0, width as f32),
            self.y2.clamp(0.0, height as f32),
        )
    }
}
