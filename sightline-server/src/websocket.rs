// WebSocket handler bridging axum sockets to detection sessions

use crate::session::{self, CloseCode, Inbound, Outbound, PeerLink, Session, SessionContext};
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// How long to wait for the peer's close reply after we close.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// WebSocket state
pub struct WebSocketState {
    pub context: Arc<SessionContext>,
    pub channel_capacity: usize,
    pub max_message_bytes: usize,
    active: AtomicUsize,
    idle: Notify,
}

impl WebSocketState {
    pub fn new(context: Arc<SessionContext>, channel_capacity: usize, max_message_bytes: usize) -> Self {
        Self {
            context,
            channel_capacity,
            max_message_bytes,
            active: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    /// Connections upgraded or being upgraded and not yet finished.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Resolves once no connection is active.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // register before checking so a release in between is not missed
            notified.as_mut().enable();
            if self.active_connections() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Counts one connection from upgrade until its session ends.
struct ActiveConnection {
    state: Arc<WebSocketState>,
}

impl ActiveConnection {
    fn new(state: Arc<WebSocketState>) -> Self {
        state.active.fetch_add(1, Ordering::SeqCst);
        Self { state }
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        if self.state.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.state.idle.notify_waiters();
        }
    }
}

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<WebSocketState>>,
) -> Response {
    let limit = state.max_message_bytes;
    // counted before the upgrade task exists so shutdown cannot miss it
    let guard = ActiveConnection::new(state.clone());
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| handle_socket(socket, state, guard))
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<WebSocketState>, guard: ActiveConnection) {
    let connection_id = Uuid::new_v4().to_string();
    let span = info_span!("session", id = %connection_id);
    serve_connection(socket, state, connection_id).instrument(span).await;
    drop(guard);
}

async fn serve_connection(socket: WebSocket, state: Arc<WebSocketState>, connection_id: String) {
    info!("WebSocket connection established ({} active)", state.active_connections());

    let (io, link) = session::channel(state.channel_capacity);
    let PeerLink {
        inbound,
        mut outbound,
        disconnect,
    } = link;

    // Split socket into sender and receiver using futures_util
    let (mut sender, mut receiver) = socket.split();

    // Deliver session output to the client
    let send_task = tokio::spawn(
        async move {
            while let Some(item) = outbound.recv().await {
                match item {
                    Outbound::Message(text) => {
                        if let Err(e) = sender.send(Message::Text(text)).await {
                            warn!("Failed to send WebSocket message: {}", e);
                            break;
                        }
                    }
                    Outbound::Close(code) => {
                        let frame = CloseFrame {
                            code: code.as_u16(),
                            reason: Cow::Borrowed(close_reason(code)),
                        };
                        if let Err(e) = sender.send(Message::Close(Some(frame))).await {
                            debug!("Failed to send close frame: {}", e);
                        }
                        break;
                    }
                }
            }
        }
        .in_current_span(),
    );

    // Forward client messages to the session
    let mut recv_task = tokio::spawn(
        async move {
            while let Some(msg) = receiver.next().await {
                let message = match msg {
                    Ok(Message::Text(text)) => Inbound::Text(text),
                    Ok(Message::Binary(bytes)) => Inbound::Binary(bytes),
                    Ok(Message::Close(_)) => {
                        debug!("WebSocket connection closed by client");
                        break;
                    }
                    // axum answers pings itself
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                    Err(e) => {
                        debug!("WebSocket error: {}", e);
                        break;
                    }
                };
                if inbound.send(message).await.is_err() {
                    // session already finished
                    break;
                }
            }
            let _ = disconnect.send(true);
        }
        .in_current_span(),
    );

    let outcome = Session::new(connection_id, state.context.clone()).run(io).await;

    // The session dropped its channels, so the writer drains and exits
    if let Err(e) = send_task.await {
        warn!("WebSocket send task failed: {}", e);
    }
    if tokio::time::timeout(CLOSE_GRACE, &mut recv_task).await.is_err() {
        recv_task.abort();
    }

    info!("WebSocket connection closed: {:?}", outcome);
}

fn close_reason(code: CloseCode) -> &'static str {
    match code {
        CloseCode::Normal => "",
        CloseCode::InternalError => "detector failure",
    }
}
