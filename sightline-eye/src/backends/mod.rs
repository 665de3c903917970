//! Detector backends

pub mod classes;
pub mod stub;

#[cfg(feature = "onnx")]
pub mod onnx;

pub use stub::StubDetector;

#[cfg(feature = "onnx")]
pub use onnx::OnnxYoloDetector;

use crate::detector::Detector;
use sightline_core::config::{DetectorBackend, DetectorConfig};
use sightline_core::Result;
use std::sync::Arc;
use tracing::{info, warn};

/// Build the configured detector. Called once at startup.
pub fn build_detector(config: &DetectorConfig) -> Result<Arc<dyn Detector>> {
    let detector: Arc<dyn Detector> = match config.backend {
        DetectorBackend::Stub => Arc::new(StubDetector::new()),
        DetectorBackend::Onnx => build_onnx(config)?,
    };
    if let Some(note) = backend_warning(config.backend) {
        warn!("{}", note);
    }
    info!("Detector backend ready: {}", detector.name());
    Ok(detector)
}

/// Operator-facing caveat for backends that do not run a model.
fn backend_warning(backend: DetectorBackend) -> Option<&'static str> {
    match backend {
        DetectorBackend::Stub => Some(
            "Stub detector selected: no model is loaded and every frame reports no detections",
        ),
        DetectorBackend::Onnx => None,
    }
}

#[cfg(feature = "onnx")]
fn build_onnx(config: &DetectorConfig) -> Result<Arc<dyn Detector>> {
    let model_path = config.model_path.as_deref().ok_or_else(|| {
        sightline_core::Error::Configuration("detector.model_path is required for the onnx backend".to_string())
    })?;
    let class_names = config
        .class_names
        .clone()
        .unwrap_or_else(|| classes::COCO_CLASSES.iter().map(|c| c.to_string()).collect());
    Ok(Arc::new(OnnxYoloDetector::new(model_path, class_names)?))
}

#[cfg(not(feature = "onnx"))]
fn build_onnx(_config: &DetectorConfig) -> Result<Arc<dyn Detector>> {
    Err(sightline_core::Error::Configuration(
        "the onnx backend is not compiled in; rebuild with `--features onnx`".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_stub() {
        let detector = build_detector(&DetectorConfig::default()).unwrap();
        assert_eq!(detector.name(), "stub");
    }

    #[test]
    fn test_only_stub_backend_warns() {
        assert!(backend_warning(DetectorBackend::Stub)
            .unwrap()
            .contains("no detections"));
        assert!(backend_warning(DetectorBackend::Onnx).is_none());
    }

    #[cfg(not(feature = "onnx"))]
    #[test]
    fn test_onnx_without_feature_is_a_config_error() {
        let config = DetectorConfig {
            backend: DetectorBackend::Onnx,
            model_path: Some("model.onnx".into()),
            class_names: None,
        };
        let err = build_detector(&config).err().unwrap();
        assert!(matches!(err, sightline_core::Error::Configuration(_)));
    }
}
