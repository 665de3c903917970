// Server configuration for Sightline

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Default listening address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8765";

/// What a session does after its first successful detection response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameMode {
    /// Close the session after the first successfully decoded frame
    #[default]
    SingleShot,
    /// Keep serving frames until the peer closes
    Persistent,
}

/// Detector backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorBackend {
    /// No model, never reports detections
    #[default]
    Stub,
    /// ONNX Runtime YOLO model (requires the `onnx` feature)
    Onnx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Fixed per-frame inference parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceParams {
    /// Target inference resolution (long edge)
    pub imgsz: u32,
    /// Confidence threshold
    pub conf: f32,
    /// IoU threshold for overlap suppression
    pub iou: f32,
    /// Backend diagnostics
    pub verbose: bool,
}

impl Default for InferenceParams {
    fn default() -> Self {
        Self {
            imgsz: 640,
            conf: 0.5,
            iou: 0.8,
            verbose: false,
        }
    }
}

impl InferenceParams {
    pub fn validate(&self) -> Result<()> {
        if self.imgsz == 0 || self.imgsz % 32 != 0 {
            return Err(Error::Configuration(format!(
                "imgsz must be a positive multiple of 32, got {}",
                self.imgsz
            )));
        }
        if self.imgsz > 4096 {
            return Err(Error::Configuration("imgsz too large (max 4096)".to_string()));
        }
        if !(0.0..=1.0).contains(&self.conf) {
            return Err(Error::Configuration("conf must be within [0, 1]".to_string()));
        }
        if !(0.0..=1.0).contains(&self.iou) {
            return Err(Error::Configuration("iou must be within [0, 1]".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Largest accepted decoded image, in pixels
    pub max_pixels: u64,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            max_pixels: 100_000_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub backend: DetectorBackend,
    pub model_path: Option<PathBuf>,
    /// Class names of the model outputs, in output order. Defaults to COCO.
    pub class_names: Option<Vec<String>>,
}

/// Top-level server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub frame_mode: FrameMode,
    pub inference: InferenceParams,
    /// Concurrent blocking decode/inference jobs across all sessions
    pub inference_workers: usize,
    /// Inbound messages buffered per session
    pub channel_capacity: usize,
    /// Largest accepted WebSocket message
    pub max_message_bytes: usize,
    pub decoder: DecoderConfig,
    pub detector: DetectorConfig,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            frame_mode: FrameMode::SingleShot,
            inference: InferenceParams::default(),
            inference_workers: num_cpus::get().max(1),
            channel_capacity: 16,
            max_message_bytes: 16 * 1024 * 1024,
            decoder: DecoderConfig::default(),
            detector: DetectorConfig::default(),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.bind_address.parse().map_err(|e| {
            Error::Configuration(format!("invalid bind_address '{}': {}", self.bind_address, e))
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.socket_addr()?;
        self.inference.validate()?;

        if self.inference_workers == 0 {
            return Err(Error::Configuration("inference_workers must be > 0".to_string()));
        }
        if self.channel_capacity == 0 {
            return Err(Error::Configuration("channel_capacity must be > 0".to_string()));
        }
        if self.max_message_bytes == 0 {
            return Err(Error::Configuration("max_message_bytes must be > 0".to_string()));
        }
        if self.decoder.max_pixels == 0 {
            return Err(Error::Configuration("decoder.max_pixels must be > 0".to_string()));
        }
        if self.detector.backend == DetectorBackend::Onnx && self.detector.model_path.is_none() {
            return Err(Error::Configuration(
                "detector.model_path is required for the onnx backend".to_string(),
            ));
        }
        if let Some(names) = &self.detector.class_names {
            if names.is_empty() {
                return Err(Error::Configuration("detector.class_names must not be empty".to_string()));
            }
        }

        Ok(())
    }
}
