//! Detector capability

use crate::decoder::DecodedImage;
use sightline_core::config::InferenceParams;
use sightline_core::{BoundingBox, ClassVocabulary, Result};
use std::cmp::Ordering;

/// One raw detection. `class_index` points into the session's vocabulary.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub class_index: usize,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// Object detector shared by every session.
///
/// A single instance is built at startup and handed to all sessions, so
/// implementations keep no per-session state: the vocabulary a session
/// configured is passed back on every `infer` call. Both methods are
/// blocking and are run off the async runtime by the caller.
pub trait Detector: Send + Sync {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Prepare for a session's vocabulary. Called once per session, before
    /// any `infer` for that session.
    fn configure(&self, vocabulary: &ClassVocabulary) -> Result<()>;

    /// Detect objects in one frame. Boxes are absolute pixel coordinates of
    /// the source image; order is the order reported to the client.
    fn infer(
        &self,
        vocabulary: &ClassVocabulary,
        image: &DecodedImage,
        params: &InferenceParams,
    ) -> Result<Vec<Detection>>;
}

/// Class-aware non-maximum suppression.
///
/// Returns the surviving detections sorted by descending confidence.
/// Detections with non-finite confidence or invalid boxes are dropped.
pub fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.retain(|d| d.confidence.is_finite() && d.bbox.is_valid());
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
    });

    let mut keep: Vec<Detection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        let suppressed = keep.iter().any(|kept| {
            kept.class_index == candidate.class_index && kept.bbox.iou(&candidate.bbox) > iou_threshold
        });
        if !suppressed {
            keep.push(candidate);
        }
    }
    keep
}
