//! sightline-eye: vision capabilities behind the Sightline session protocol
//!
//! Provides the frame decoder (raw bytes to RGB image) and the detector
//! capability the server drives for every decoded frame, along with the
//! available detector backends.

pub mod backends;
pub mod decoder;
pub mod detector;

pub use backends::build_detector;
pub use decoder::{DecodeFailure, DecodedImage, FrameDecoder, ImageDecoder};
pub use detector::{Detection, Detector};
