//! Listening socket and router

use crate::session::SessionContext;
use crate::websocket::{websocket_handler, WebSocketState};
use crate::worker_pool::InferencePool;
use axum::{routing::get, Router};
use sightline_core::{Error, Result, ServerConfig};
use sightline_eye::{Detector, FrameDecoder};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Upper bound on waiting for open sessions after shutdown is requested.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// A bound listener ready to serve detection sessions.
///
/// Every accepted connection gets its own session; the only thing sessions
/// share is the detector, decoder and worker pool.
pub struct Acceptor {
    listener: TcpListener,
    state: Arc<WebSocketState>,
    local_addr: SocketAddr,
}

impl Acceptor {
    /// Bind the configured address. Binding port 0 picks a free port.
    pub async fn bind(
        config: &ServerConfig,
        detector: Arc<dyn Detector>,
        decoder: Arc<dyn FrameDecoder>,
    ) -> Result<Self> {
        let addr = config.socket_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Configuration(format!("Failed to bind {}: {}", addr, e)))?;
        let local_addr = listener.local_addr()?;

        let pool = InferencePool::new(config.inference_workers);
        let context = SessionContext::new(detector, decoder, pool)
            .with_params(config.inference.clone())
            .with_frame_mode(config.frame_mode);
        let state = Arc::new(WebSocketState::new(
            Arc::new(context),
            config.channel_capacity,
            config.max_message_bytes,
        ));

        Ok(Self {
            listener,
            state,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    /// Serve until the process ends.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Serve until `signal` resolves, then stop accepting and wait for open
    /// sessions to finish.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.router();
        info!(
            "Listening on ws://{} ({} inference workers, {} mode)",
            self.local_addr,
            self.state.context.pool.max_workers(),
            match self.state.context.frame_mode {
                sightline_core::FrameMode::SingleShot => "single-shot",
                sightline_core::FrameMode::Persistent => "persistent",
            }
        );

        axum::serve(self.listener, app)
            .with_graceful_shutdown(signal)
            .await?;

        // upgraded sockets are not tracked by axum; wait for their sessions
        let open = self.state.active_connections();
        if open > 0 {
            info!("Listener stopped, waiting for {} open sessions", open);
            if tokio::time::timeout(DRAIN_TIMEOUT, self.state.wait_idle()).await.is_err() {
                warn!(
                    "{} sessions still open after {:?}, shutting down anyway",
                    self.state.active_connections(),
                    DRAIN_TIMEOUT
                );
            }
        }

        info!("Listener stopped");
        Ok(())
    }
}

/// Route WebSocket upgrades on `/` to the session handler.
pub fn router(state: Arc<WebSocketState>) -> Router {
    Router::new()
        .route("/", get(websocket_handler))
        .with_state(state)
}
