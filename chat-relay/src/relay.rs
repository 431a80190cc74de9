use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{
        ConnectInfo, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{net::TcpListener, select, sync::mpsc, time::timeout};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::{
    broadcast::BroadcastEngine,
    config::RelayConfig,
    envelope::{self, Envelope, SYSTEM_SENDER, Tag},
    error::SendFailure,
    registry::{Connection, ConnectionId, ConnectionRegistry},
};

/// Originator id used for relay announcements; real connections start at 1.
const RELAY_ORIGINATOR: ConnectionId = 0;

pub struct Relay {
    listener: TcpListener,
    state: Arc<RelayState>,
}

struct RelayState {
    engine: BroadcastEngine,
    config: RelayConfig,
}

impl Relay {
    pub fn new(listener: TcpListener, config: RelayConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let engine = BroadcastEngine::new(registry, config.policy, config.wire_format);
        Self {
            listener,
            state: Arc::new(RelayState { engine, config }),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(self.state.engine.registry())
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Relay { listener, state } = self;
        let engine = state.engine.clone();
        let app = router(state);

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown.await;
            handle_shutdown(&engine).await;
        })
        .await
        .context("relay server failed")
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/", get(upgrade))
        .route("/ws", get(upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_shutdown(engine: &BroadcastEngine) {
    info!("relay shutting down");
    let notice = Envelope::new(SYSTEM_SENDER, "relay shutting down", Tag::Plain);
    engine.broadcast(RELAY_ORIGINATOR, &notice, true).await;
    let closed = engine.registry().close_all().await;
    debug!(closed, "closed remaining connections");
}

async fn upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<Arc<RelayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, peer, state))
}

#[derive(Debug)]
enum CloseReason {
    ClientClosed(Option<u16>),
    StreamEnded,
    ReadError(String),
    WriteFailed(SendFailure),
    Dropped,
}

async fn handle_socket(socket: WebSocket, peer: SocketAddr, state: Arc<RelayState>) {
    let registry = Arc::clone(state.engine.registry());
    let (outbound_tx, outbound_rx) = mpsc::channel(state.config.outbound_buffer.max(1));
    let connection = Arc::new(Connection::new(registry.next_id(), Some(peer), outbound_tx));
    let conn_id = connection.id();

    registry.register(Arc::clone(&connection)).await;
    let online = registry.len().await;
    info!(conn_id, %peer, online, "client connected");

    let (sink, mut stream) = socket.split();
    let send_timeout = state.config.send_timeout;
    let mut writer = tokio::spawn(forward_outbound(sink, outbound_rx, send_timeout));
    let mut writer_done = false;

    let reason = select! {
        reason = read_inbound(&mut stream, conn_id, &state.engine) => reason,
        result = &mut writer => {
            writer_done = true;
            match result {
                Ok(Err(failure)) => CloseReason::WriteFailed(failure),
                Ok(Ok(())) => CloseReason::Dropped,
                Err(err) => CloseReason::WriteFailed(SendFailure::Transport(err.to_string())),
            }
        }
        _ = connection.closed() => CloseReason::Dropped,
    };

    cleanup_connection(&registry, connection, peer, reason).await;
    drop(stream);

    // The writer drains whatever is still queued, then drops the socket.
    if !writer_done && timeout(send_timeout, &mut writer).await.is_err() {
        writer.abort();
    }
}

async fn forward_outbound(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Arc<str>>,
    send_timeout: Duration,
) -> Result<(), SendFailure> {
    while let Some(frame) = outbound.recv().await {
        match timeout(send_timeout, sink.send(Message::Text(frame.to_string()))).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(SendFailure::Transport(err.to_string())),
            Err(_) => return Err(SendFailure::Timeout),
        }
    }
    Ok(())
}

async fn read_inbound(
    stream: &mut SplitStream<WebSocket>,
    conn_id: ConnectionId,
    engine: &BroadcastEngine,
) -> CloseReason {
    let mut close_code = None;
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => relay_text(&text, conn_id, engine).await,
            Ok(Message::Binary(bytes)) => {
                debug!(conn_id, len = bytes.len(), "ignoring binary frame");
            }
            // Keep reading so the close reply gets flushed before the stream ends.
            Ok(Message::Close(frame)) => {
                close_code = Some(frame.map(|frame| frame.code));
            }
            Ok(_) => {}
            Err(err) => return CloseReason::ReadError(err.to_string()),
        }
    }
    match close_code {
        Some(code) => CloseReason::ClientClosed(code),
        None => CloseReason::StreamEnded,
    }
}

async fn relay_text(text: &str, conn_id: ConnectionId, engine: &BroadcastEngine) {
    let envelope = envelope::decode(text);
    if envelope.body.trim().is_empty() {
        debug!(conn_id, sender = %envelope.sender, "dropping empty message");
        return;
    }

    if envelope.is_annotated() {
        info!(conn_id, sender = %envelope.sender, "relaying prompt");
    } else {
        debug!(conn_id, sender = %envelope.sender, "relaying chat message");
    }
    engine.broadcast_from(conn_id, &envelope).await;
}

async fn cleanup_connection(
    registry: &ConnectionRegistry,
    connection: Arc<Connection>,
    peer: SocketAddr,
    reason: CloseReason,
) {
    let conn_id = connection.id();
    connection.close();
    drop(connection);
    registry.unregister(conn_id).await;

    match reason {
        CloseReason::ReadError(error) => {
            warn!(conn_id, %peer, %error, "client connection closed with error");
        }
        CloseReason::WriteFailed(failure) => {
            warn!(conn_id, %peer, error = %failure, "dropping unresponsive client");
        }
        reason => info!(conn_id, %peer, ?reason, "client disconnected"),
    }
}
