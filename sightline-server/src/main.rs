// Sightline - streaming object detection over WebSocket

use anyhow::Context;
use clap::{Parser, ValueEnum};
use sightline_core::config::{DetectorBackend, FrameMode, LogFormat, ServerConfig};
use sightline_eye::{build_detector, ImageDecoder};
use sightline_server::acceptor::Acceptor;
use sightline_server::config_loader::{self, CliOverrides};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sightline")]
#[command(about = "Open-vocabulary object detection over WebSocket", version)]
struct Cli {
    /// Configuration file (TOML, JSON or YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listening address, e.g. 0.0.0.0:8765
    #[arg(short, long)]
    bind: Option<String>,

    /// Session behavior after the first detection response
    #[arg(long, value_enum)]
    frame_mode: Option<FrameModeArg>,

    /// Detector backend
    #[arg(long, value_enum)]
    backend: Option<BackendArg>,

    /// ONNX model path (onnx backend)
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FrameModeArg {
    SingleShot,
    Persistent,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    Stub,
    Onnx,
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            bind_address: self.bind.clone(),
            frame_mode: self.frame_mode.map(|m| match m {
                FrameModeArg::SingleShot => FrameMode::SingleShot,
                FrameModeArg::Persistent => FrameMode::Persistent,
            }),
            backend: self.backend.map(|b| match b {
                BackendArg::Stub => DetectorBackend::Stub,
                BackendArg::Onnx => DetectorBackend::Onnx,
            }),
            model_path: self.model.clone(),
            log_level: self.log_level.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = config_loader::load(cli.config.as_deref(), &cli.overrides())
        .context("Failed to load configuration")?;

    init_tracing(&config);

    info!("Starting Sightline {}", env!("CARGO_PKG_VERSION"));

    let decoder = Arc::new(ImageDecoder::from_config(&config.decoder));
    let detector = build_detector(&config.detector).context("Failed to initialize detector")?;

    let acceptor = match Acceptor::bind(&config, detector, decoder).await {
        Ok(acceptor) => acceptor,
        Err(e) => {
            error!("Cannot start listener: {}", e);
            std::process::exit(1);
        }
    };

    acceptor
        .serve_with_shutdown(wait_for_shutdown())
        .await
        .context("Server failed")?;

    info!("Sightline stopped");
    Ok(())
}

fn init_tracing(config: &ServerConfig) {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false);

    match config.log_format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Wait for shutdown signal
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
