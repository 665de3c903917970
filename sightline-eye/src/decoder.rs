//! Raw frame bytes to RGB image

use image::io::Reader as ImageReader;
use image::RgbImage;
use sightline_core::config::DecoderConfig;
use std::io::Cursor;
use thiserror::Error;

/// Decoded frame, always 8-bit RGB.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    rgb: RgbImage,
}

impl DecodedImage {
    pub fn new(rgb: RgbImage) -> Self {
        Self { rgb }
    }

    pub fn width(&self) -> u32 {
        self.rgb.width()
    }

    pub fn height(&self) -> u32 {
        self.rgb.height()
    }

    pub fn as_rgb(&self) -> &RgbImage {
        &self.rgb
    }
}

/// Why a frame produced no image. This is an expected outcome, not a fault.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeFailure {
    #[error("empty frame")]
    Empty,

    #[error("unrecognized image format")]
    UnknownFormat,

    #[error("malformed image data: {0}")]
    Malformed(String),

    #[error("image has zero width or height")]
    ZeroSized,

    #[error("image too large: {width}x{height}")]
    TooLarge { width: u32, height: u32 },
}

/// Decoder adapter interface.
///
/// Implementations must never panic on malformed input.
pub trait FrameDecoder: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<DecodedImage, DecodeFailure>;
}

/// Decoder backed by the `image` crate, with content sniffing.
#[derive(Debug, Clone)]
pub struct ImageDecoder {
    max_pixels: u64,
}

impl ImageDecoder {
    pub fn new(max_pixels: u64) -> Self {
        Self { max_pixels }
    }

    pub fn from_config(config: &DecoderConfig) -> Self {
        Self::new(config.max_pixels)
    }

    fn reader(bytes: &[u8]) -> Result<ImageReader<Cursor<&[u8]>>, DecodeFailure> {
        let reader = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| DecodeFailure::Malformed(e.to_string()))?;
        if reader.format().is_none() {
            return Err(DecodeFailure::UnknownFormat);
        }
        Ok(reader)
    }
}

impl Default for ImageDecoder {
    fn default() -> Self {
        Self::from_config(&DecoderConfig::default())
    }
}

impl FrameDecoder for ImageDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<DecodedImage, DecodeFailure> {
        if bytes.is_empty() {
            return Err(DecodeFailure::Empty);
        }

        // Check dimensions from the header before allocating pixels
        let (width, height) = Self::reader(bytes)?
            .into_dimensions()
            .map_err(|e| DecodeFailure::Malformed(e.to_string()))?;
        if width == 0 || height == 0 {
            return Err(DecodeFailure::ZeroSized);
        }
        if (width as u64) * (height as u64) > self.max_pixels {
            return Err(DecodeFailure::TooLarge { width, height });
        }

        let image = Self::reader(bytes)?
            .decode()
            .map_err(|e| DecodeFailure::Malformed(e.to_string()))?;

        Ok(DecodedImage::new(image.to_rgb8()))
    }
}
