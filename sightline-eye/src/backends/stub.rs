use crate::decoder::DecodedImage;
use crate::detector::{Detection, Detector};
use sightline_core::config::InferenceParams;
use sightline_core::{ClassVocabulary, Result};
use tracing::debug;

/// Model-free backend. Accepts any vocabulary and never reports objects.
#[derive(Debug, Default)]
pub struct StubDetector;

impl StubDetector {
    pub fn new() -> Self {
        Self
    }
}

impl Detector for StubDetector {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn configure(&self, vocabulary: &ClassVocabulary) -> Result<()> {
        debug!("stub detector configured with {} classes", vocabulary.len());
        Ok(())
    }

    fn infer(
        &self,
        _vocabulary: &ClassVocabulary,
        image: &DecodedImage,
        _params: &InferenceParams,
    ) -> Result<Vec<Detection>> {
        debug!("stub detector skipping {}x{} frame", image.width(), image.height());
        Ok(vec![])
    }
}
