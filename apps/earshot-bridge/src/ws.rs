//! Websocket endpoint for voice clients.
//!
//! A connection is anonymous until the in-game auth command claims its code;
//! until then it receives nothing but the handshake reply. The handler owns
//! the socket, a per-connection writer task drains the registry channel, and
//! teardown always funnels through [`SessionRegistry::disconnect`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use metrics::counter;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use earshot_proto::{ClientMessage, NetConfig, ServerMessage};

use crate::host::GameDirectory;
use crate::registry::SessionRegistry;

pub struct WsState {
    pub registry: SessionRegistry,
    pub directory: Arc<dyn GameDirectory>,
    pub net_config: NetConfig,
    pub handshake_timeout: Duration,
    /// Fallbacks for the handshake payload when the directory is unreachable.
    pub server_name: String,
    pub host_name: String,
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("timed out waiting for hello")]
    TimedOut,
    #[error("socket closed before hello")]
    SocketClosed,
    #[error("invalid hello payload: {0}")]
    InvalidPayload(String),
    #[error("websocket error during handshake: {0}")]
    Protocol(String),
    #[error("unexpected frame type during handshake")]
    UnexpectedFrame,
}

impl HandshakeError {
    fn metric_label(&self) -> &'static str {
        match self {
            HandshakeError::TimedOut => "timeout",
            HandshakeError::SocketClosed => "socket_closed",
            HandshakeError::InvalidPayload(_) => "invalid_payload",
            HandshakeError::Protocol(_) => "protocol_error",
            HandshakeError::UnexpectedFrame => "unexpected_frame",
        }
    }
}

pub async fn ws_handler(
    State(state): State<Arc<WsState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<WsState>) {
    if let Err(err) = run_connection(socket, state).await {
        debug!(error = %err, "voice connection ended with error");
    }
}

async fn run_connection(socket: WebSocket, state: Arc<WsState>) -> anyhow::Result<()> {
    let (ws_tx, mut ws_rx) = socket.split();

    let hello = match perform_handshake(state.handshake_timeout, &mut ws_rx).await {
        Ok(hello) => {
            counter!("earshot_handshakes_total", 1);
            hello
        }
        Err(err) => {
            counter!(
                "earshot_handshake_failures_total",
                1,
                "reason" => err.metric_label()
            );
            return Err(err.into());
        }
    };
    let ClientMessage::Hi { peer_media_id } = hello;

    let (server_name, host_name) = match state.directory.status().await {
        Ok(status) => (status.server_name, status.host_name),
        Err(err) => {
            warn!(error = %err, "server status unavailable, using configured names");
            (state.server_name.clone(), state.host_name.clone())
        }
    };

    let registration = state.registry.connect(peer_media_id).await;
    let connection_id = registration.id;

    let reply = ServerMessage::Hi {
        code: registration.code,
        server_name,
        host_name,
        config: state.net_config.clone(),
    };

    // The session exists from here on; every exit path, including a reply
    // send that hits an already-dead socket, must reach disconnect.
    let result = serve_session(ws_tx, ws_rx, reply, registration.receiver, connection_id).await;
    state.registry.disconnect(connection_id).await;
    info!(connection_id = %connection_id, "voice connection closed");
    result
}

async fn serve_session(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut ws_rx: SplitStream<WebSocket>,
    reply: ServerMessage,
    mut rx: mpsc::UnboundedReceiver<ServerMessage>,
    connection_id: Uuid,
) -> anyhow::Result<()> {
    ws_tx
        .send(Message::Text(serde_json::to_string(&reply)?))
        .await
        .context("client dropped before the handshake reply")?;
    info!(connection_id = %connection_id, "voice client completed handshake");

    // The writer drains the registry channel; once the session is removed
    // the channel closes and the writer closes the socket behind it.
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let Ok(json) = serde_json::to_string(&message) else {
                continue;
            };
            if ws_tx.send(Message::Text(json)).await.is_err() {
                return;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Close(_)) => break,
            Ok(Message::Text(text)) => {
                debug!(connection_id = %connection_id, frame = %text, "ignoring unexpected client frame");
            }
            Ok(_) => continue,
            Err(err) => {
                debug!(connection_id = %connection_id, error = %err, "websocket read failed");
                break;
            }
        }
    }

    writer.abort();
    Ok(())
}

async fn perform_handshake(
    handshake_timeout: Duration,
    ws_rx: &mut SplitStream<WebSocket>,
) -> Result<ClientMessage, HandshakeError> {
    let frame = timeout(handshake_timeout, ws_rx.next())
        .await
        .map_err(|_| HandshakeError::TimedOut)?
        .ok_or(HandshakeError::SocketClosed)?
        .map_err(|err| HandshakeError::Protocol(err.to_string()))?;

    match frame {
        Message::Text(text) => serde_json::from_str::<ClientMessage>(&text)
            .map_err(|err| HandshakeError::InvalidPayload(err.to_string())),
        Message::Binary(bytes) => serde_json::from_slice::<ClientMessage>(&bytes)
            .map_err(|err| HandshakeError::InvalidPayload(err.to_string())),
        Message::Close(_) => Err(HandshakeError::SocketClosed),
        _ => Err(HandshakeError::UnexpectedFrame),
    }
}
