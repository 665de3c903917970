//! Layered configuration loading
//!
//! Precedence, lowest first: built-in defaults, the optional config file,
//! `SIGHTLINE__*` environment variables, command-line overrides.

use config::{Config, Environment, File};
use sightline_core::config::{DetectorBackend, FrameMode, ServerConfig};
use sightline_core::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable prefix; nested keys use `__`, e.g.
/// `SIGHTLINE__INFERENCE__CONF=0.3`.
pub const ENV_PREFIX: &str = "SIGHTLINE";

/// Values given on the command line. `None` leaves the lower layers alone.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bind_address: Option<String>,
    pub frame_mode: Option<FrameMode>,
    pub backend: Option<DetectorBackend>,
    pub model_path: Option<PathBuf>,
    pub log_level: Option<String>,
}

impl CliOverrides {
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(bind) = &self.bind_address {
            config.bind_address = bind.clone();
        }
        if let Some(mode) = self.frame_mode {
            config.frame_mode = mode;
        }
        if let Some(backend) = self.backend {
            config.detector.backend = backend;
        }
        if let Some(model) = &self.model_path {
            config.detector.model_path = Some(model.clone());
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
    }
}

/// Load and validate the server configuration.
pub fn load(path: Option<&Path>, overrides: &CliOverrides) -> Result<ServerConfig> {
    load_with_prefix(path, overrides, ENV_PREFIX)
}

fn load_with_prefix(path: Option<&Path>, overrides: &CliOverrides, prefix: &str) -> Result<ServerConfig> {
    let mut builder = Config::builder();
    if let Some(path) = path {
        debug!("Loading configuration from {}", path.display());
        builder = builder.add_source(File::from(path.to_path_buf()).required(true));
    }
    builder = builder.add_source(
        Environment::with_prefix(prefix)
            .separator("__")
            .try_parsing(true),
    );

    let mut config: ServerConfig = builder
        .build()
        .and_then(|c| c.try_deserialize())
        .map_err(|e| Error::Configuration(e.to_string()))?;

    overrides.apply(&mut config);
    config.validate()?;
    Ok(config)
}
