/// YOLO detector using ONNX Runtime via `ort`.
///
/// Handles letterbox preprocessing, inference, and class-aware NMS. The model
/// has a fixed class table; a session's vocabulary selects which of those
/// classes are scored and reported.
use std::path::Path;

use ndarray::Array4;
use ort::session::Session;
use parking_lot::Mutex;
use sightline_core::config::InferenceParams;
use sightline_core::{BoundingBox, ClassVocabulary, Error, Result};
use tracing::{debug, info, warn};

use super::classes::map_vocabulary;
use crate::decoder::DecodedImage;
use crate::detector::{nms, Detection, Detector};

/// Upper bound on detections reported for one frame.
const MAX_DETECTIONS: usize = 300;

/// Letterbox padding value (114/255 gray, YOLO convention).
const LETTERBOX_FILL: f32 = 114.0 / 255.0;

pub struct OnnxYoloDetector {
    // `Session::run` needs exclusive access, so concurrent sessions queue here
    session: Mutex<Session>,
    class_names: Vec<String>,
    /// Square input size baked into the model, if it is not dynamic
    fixed_input: Option<u32>,
}

impl OnnxYoloDetector {
    /// Load a YOLO ONNX model whose outputs follow `class_names` order.
    pub fn new(model_path: &Path, class_names: Vec<String>) -> Result<Self> {
        let mut builder = Session::builder().map_err(model_err)?;
        let session = builder.commit_from_file(model_path).map_err(|e| {
            Error::Model(format!("Failed to load YOLO model {}: {}", model_path.display(), e))
        })?;

        // NCHW: [1, 3, H, W]; dynamic axes read as non-positive
        let fixed_input = session.inputs().first().and_then(|input| {
            if let ort::value::ValueType::Tensor { ref shape, .. } = input.dtype() {
                if shape.len() >= 4 && shape[2] > 0 {
                    Some(shape[2] as u32)
                } else {
                    None
                }
            } else {
                None
            }
        });

        info!(
            "YOLO model loaded from {:?} ({} classes, input {:?})",
            model_path,
            class_names.len(),
            fixed_input
        );

        Ok(Self {
            session: Mutex::new(session),
            class_names,
            fixed_input,
        })
    }

    fn input_size(&self, params: &InferenceParams) -> u32 {
        match self.fixed_input {
            Some(size) if size != params.imgsz => {
                debug!("model input is fixed at {}, ignoring imgsz {}", size, params.imgsz);
                size
            }
            Some(size) => size,
            None => params.imgsz,
        }
    }
}

impl Detector for OnnxYoloDetector {
    fn name(&self) -> &'static str {
        "onnx-yolo"
    }

    fn configure(&self, vocabulary: &ClassVocabulary) -> Result<()> {
        let mapping = map_vocabulary(&self.class_names, vocabulary.iter());
        let unknown: Vec<&str> = vocabulary
            .iter()
            .zip(&mapping)
            .filter(|(_, m)| m.is_none())
            .map(|(label, _)| label)
            .collect();
        if !unknown.is_empty() {
            warn!("Model has no class for {:?}; they will never be reported", unknown);
        }
        Ok(())
    }

    fn infer(
        &self,
        vocabulary: &ClassVocabulary,
        image: &DecodedImage,
        params: &InferenceParams,
    ) -> Result<Vec<Detection>> {
        let mapping = map_vocabulary(&self.class_names, vocabulary.iter());
        if mapping.iter().all(Option::is_none) {
            return Ok(vec![]);
        }

        let input_size = self.input_size(params);
        let Letterboxed { tensor, geometry } = letterbox(image, input_size);
        let input = ort::value::Tensor::from_array(tensor).map_err(inference_err)?;

        let (shape, data) = {
            let mut session = self.session.lock();
            let outputs = session.run(ort::inputs![input]).map_err(inference_err)?;
            if outputs.len() == 0 {
                return Err(Error::Inference("YOLO model produced no outputs".to_string()));
            }
            let tensor = outputs[0].try_extract_array::<f32>().map_err(inference_err)?;
            let shape = tensor.shape().to_vec();
            let data: Vec<f32> = tensor.iter().copied().collect();
            (shape, data)
        };

        let detections = decode_output(
            &shape,
            &data,
            &mapping,
            self.class_names.len(),
            &geometry,
            params,
            (image.width(), image.height()),
        )?;

        if params.verbose {
            info!(
                "{}x{} frame at {}: {} detections",
                image.width(),
                image.height(),
                input_size,
                detections.len()
            );
        }

        Ok(detections)
    }
}

/// Turn a raw YOLO output tensor into detections in source pixels.
///
/// `mapping[i]` is the model class for vocabulary entry `i`. Accepts
/// `[1, features, anchors]` (v8 and later) and `[1, anchors, features]`,
/// with or without an objectness column before the class scores.
fn decode_output(
    shape: &[usize],
    data: &[f32],
    mapping: &[Option<usize>],
    num_classes: usize,
    geometry: &Letterbox,
    params: &InferenceParams,
    (width, height): (u32, u32),
) -> Result<Vec<Detection>> {
    if shape.len() != 3 {
        return Err(Error::Inference(format!("Unexpected YOLO output shape: {:?}", shape)));
    }
    // anchors always outnumber features in real exports
    let transposed = shape[1] < shape[2];
    let (num_anchors, num_feats) = if transposed {
        (shape[2], shape[1])
    } else {
        (shape[1], shape[2])
    };
    if data.len() < num_anchors * num_feats {
        return Err(Error::Inference(format!(
            "YOLO output has {} values for shape {:?}",
            data.len(),
            shape
        )));
    }

    let class_offset = if num_feats == 4 + num_classes {
        4
    } else if num_feats == 5 + num_classes {
        5
    } else {
        return Err(Error::Inference(format!(
            "YOLO output has {} features, expected {} classes",
            num_feats, num_classes
        )));
    };

    let feature = |anchor: usize, f: usize| -> f32 {
        if transposed {
            data[f * num_anchors + anchor]
        } else {
            data[anchor * num_feats + f]
        }
    };

    let mut raw = Vec::new();
    for anchor in 0..num_anchors {
        let objectness = if class_offset == 5 { feature(anchor, 4) } else { 1.0 };

        let best = mapping
            .iter()
            .enumerate()
            .filter_map(|(vocab_idx, model_idx)| {
                model_idx
                    .filter(|m| *m < num_classes)
                    .map(|m| (vocab_idx, feature(anchor, class_offset + m) * objectness))
            })
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        let Some((class_index, confidence)) = best else { continue };
        if !confidence.is_finite() || confidence < params.conf {
            continue;
        }

        let bbox = geometry
            .unmap(BoundingBox::from_center(
                feature(anchor, 0),
                feature(anchor, 1),
                feature(anchor, 2),
                feature(anchor, 3),
            ))
            .clamp(width, height);
        if !bbox.is_valid() {
            continue;
        }

        raw.push(Detection {
            class_index,
            confidence: confidence.min(1.0),
            bbox,
        });
    }

    let mut detections = nms(raw, params.iou);
    detections.truncate(MAX_DETECTIONS);
    Ok(detections)
}

fn model_err(e: ort::Error) -> Error {
    Error::Model(e.to_string())
}

fn inference_err(e: ort::Error) -> Error {
    Error::Inference(e.to_string())
}

// ---------------------------------------------------------------------------
// Preprocessing
// ---------------------------------------------------------------------------

/// Scale and padding applied by `letterbox`.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    /// Map a box from letterbox space back to source pixels.
    fn unmap(&self, bbox: BoundingBox) -> BoundingBox {
        BoundingBox::new(
            (bbox.x1 - self.pad_x) / self.scale,
            (bbox.y1 - self.pad_y) / self.scale,
            (bbox.x2 - self.pad_x) / self.scale,
            (bbox.y2 - self.pad_y) / self.scale,
        )
    }
}

struct Letterboxed {
    tensor: Array4<f32>,
    geometry: Letterbox,
}

/// Letterbox-resize into a `target` x `target` NCHW float tensor.
fn letterbox(image: &DecodedImage, target: u32) -> Letterboxed {
    let src = image.as_rgb();
    let (src_w, src_h) = (src.width(), src.height());

    let scale = (target as f32 / src_w as f32).min(target as f32 / src_h as f32);
    let new_w = ((src_w as f32 * scale).round() as u32).clamp(1, target);
    let new_h = ((src_h as f32 * scale).round() as u32).clamp(1, target);
    let pad_x = (target - new_w) / 2;
    let pad_y = (target - new_h) / 2;

    let mut tensor = Array4::<f32>::from_elem((1, 3, target as usize, target as usize), LETTERBOX_FILL);

    // Nearest-neighbor resize into the padded region
    for y in 0..new_h {
        let src_y = ((y as f32 / scale) as u32).min(src_h - 1);
        for x in 0..new_w {
            let src_x = ((x as f32 / scale) as u32).min(src_w - 1);
            let pixel = src.get_pixel(src_x, src_y);
            let (ty, tx) = ((pad_y + y) as usize, (pad_x + x) as usize);
            for c in 0..3 {
                tensor[[0, c, ty, tx]] = pixel[c] as f32 / 255.0;
            }
        }
    }

    Letterboxed {
        tensor,
        geometry: Letterbox {
            scale,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
        },
    }
}
