//! Outbound wire format
//!
//! Every processed message produces exactly one outbound text message: either
//! a JSON array of detection records or a single-field error object.

use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Sent when the handshake is not a JSON array of strings.
pub const HANDSHAKE_SCHEMA_ERROR: &str = "Expected a JSON list of strings for params";

/// Sent when a frame does not decode into an image.
pub const IMAGE_DECODING_FAILED: &str = "Image decoding failed";

/// Axis-aligned box in source-image pixels, encoded as `[x1, y1, x2, y2]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Build from a YOLO-style center/size box.
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0)
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    pub fn is_finite(&self) -> bool {
        self.x1.is_finite() && self.y1.is_finite() && self.x2.is_finite() && self.y2.is_finite()
    }

    /// Finite and non-degenerate (`x1 < x2`, `y1 < y2`).
    pub fn is_valid(&self) -> bool {
        self.is_finite() && self.x1 < self.x2 && self.y1 < self.y2
    }

    /// Clamp into a `width` x `height` image.
    pub fn clamp(&self, width: u32, height: u32) -> Self {
        let (w, h) = (width as f32, height as f32);
        Self::new(
            self.x1.clamp(0.0, w),
            self.y1.clamp(0.0, h),
            self.x2.clamp(0.0, w),
            self.y2.clamp(0.0, h),
        )
    }

    /// Intersection over union. Returns 0.0 for invalid boxes.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        if !self.is_valid() || !other.is_valid() {
            return 0.0;
        }

        let inter_x1 = self.x1.max(other.x1);
        let inter_y1 = self.y1.max(other.y1);
        let inter_x2 = self.x2.min(other.x2);
        let inter_y2 = self.y2.min(other.y2);

        if inter_x2 <= inter_x1 || inter_y2 <= inter_y1 {
            return 0.0;
        }

        let inter_area = (inter_x2 - inter_x1) * (inter_y2 - inter_y1);
        let union_area = self.area() + other.area() - inter_area;
        if union_area <= 0.0 || !union_area.is_finite() {
            return 0.0;
        }

        (inter_area / union_area).clamp(0.0, 1.0)
    }
}

impl From<[f32; 4]> for BoundingBox {
    fn from(v: [f32; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BoundingBox> for [f32; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

/// One detected object in one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    #[serde(rename = "class")]
    pub class_name: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
    /// Inference wall-clock time in seconds, shared by every record of a frame.
    pub time: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self { error: message.into() }
    }
}

/// A frame's single outbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Detections(Vec<DetectionRecord>),
    Error(ErrorResponse),
}

impl Response {
    pub fn handshake_rejected() -> Self {
        Response::Error(ErrorResponse::new(HANDSHAKE_SCHEMA_ERROR))
    }

    pub fn decode_failed() -> Self {
        Response::Error(ErrorResponse::new(IMAGE_DECODING_FAILED))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error(_))
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
