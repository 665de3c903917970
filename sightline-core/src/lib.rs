//! sightline-core: protocol types shared by the Sightline detection server
//!
//! Holds the wire model (class vocabularies, detection records, error
//! responses), the server configuration and the workspace error type.

pub mod config;
pub mod error;
pub mod protocol;
pub mod vocabulary;

pub use config::{FrameMode, InferenceParams, ServerConfig};
pub use error::{Error, Result};
pub use protocol::{BoundingBox, DetectionRecord, ErrorResponse, Response};
pub use vocabulary::ClassVocabulary;
