//! JSON-RPC host adapter.
//!
//! The bridge is spawned by the game-server wrapper with stdio wired to the
//! wrapper's plugin channel: one JSON-RPC 2.0 object per line in each
//! direction. The bridge issues `console.exec`, `players.list` and
//! `server.status` requests plus `chat.broadcast` / `chat.whisper`
//! notifications; the wrapper issues `init` and `stop` requests plus
//! `event.auth`, `event.leave` and `event.chat` notifications. Because the
//! wrapper owns stdout-as-transport, all logging in this process goes to
//! stderr (see `telemetry`).

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use metrics::counter;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, warn};

use super::{
    Console, GameChat, GameDirectory, HostError, HostEvent, PlayerIdentity, PlayerRecord,
    ServerStatus,
};

type PendingMap = HashMap<u64, oneshot::Sender<Result<Value, HostError>>>;

/// Request half of the host channel. Cheap to clone via `Arc`; implements
/// the capability traits consumed by the rest of the bridge.
pub struct RpcHost {
    outbound: mpsc::UnboundedSender<String>,
    pending: Arc<parking_lot::Mutex<PendingMap>>,
    next_id: AtomicU64,
    request_timeout: Duration,
}

/// A live host channel: the request handle, the push-event stream, and the
/// pump tasks keeping both running. The pumps end on their own when the
/// wrapper closes its side of the pipe.
pub struct HostChannel {
    pub host: Arc<RpcHost>,
    pub events: mpsc::UnboundedReceiver<HostEvent>,
    _reader: JoinHandle<()>,
    _writer: JoinHandle<()>,
}

impl HostChannel {
    /// Wires the adapter to this process's stdio.
    pub fn spawn_stdio(request_timeout: Duration) -> Self {
        Self::spawn(tokio::io::stdin(), tokio::io::stdout(), request_timeout)
    }

    pub fn spawn<R, W>(reader: R, writer: W, request_timeout: Duration) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let pending: Arc<parking_lot::Mutex<PendingMap>> = Arc::default();

        let writer = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(line) = out_rx.recv().await {
                if writer.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if writer.write_all(b"\n").await.is_err() {
                    break;
                }
                if writer.flush().await.is_err() {
                    break;
                }
            }
        });

        let host = Arc::new(RpcHost {
            outbound: out_tx.clone(),
            pending: Arc::clone(&pending),
            next_id: AtomicU64::new(1),
            request_timeout,
        });

        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        dispatch_line(&line, &pending, &out_tx, &event_tx);
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(error = %err, "host channel read failed");
                        break;
                    }
                }
            }
            // The wrapper went away: fail in-flight requests immediately and
            // let the bridge begin shutdown.
            pending.lock().clear();
            let _ = event_tx.send(HostEvent::Stop);
        });

        Self {
            host,
            events: event_rx,
            _reader: reader,
            _writer: writer,
        }
    }
}

fn dispatch_line(
    line: &str,
    pending: &parking_lot::Mutex<PendingMap>,
    outbound: &mpsc::UnboundedSender<String>,
    events: &mpsc::UnboundedSender<HostEvent>,
) {
    let frame: Value = match serde_json::from_str(line) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(error = %err, "dropping unparseable host frame");
            return;
        }
    };

    match frame.get("method").and_then(Value::as_str) {
        Some(method) => dispatch_inbound(method, &frame, outbound, events),
        None => complete_request(&frame, pending),
    }
}

fn dispatch_inbound(
    method: &str,
    frame: &Value,
    outbound: &mpsc::UnboundedSender<String>,
    events: &mpsc::UnboundedSender<HostEvent>,
) {
    let id = frame.get("id").cloned();
    let params = frame.get("params").cloned().unwrap_or(Value::Null);

    match method {
        "init" => {
            // The wrapper registers the announced chat commands and routes
            // them back as event.auth notifications.
            respond(
                outbound,
                id,
                Ok(json!({
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                    "commands": ["auth"],
                })),
            );
        }
        "stop" => {
            respond(outbound, id, Ok(json!({})));
            let _ = events.send(HostEvent::Stop);
        }
        "event.auth" => match serde_json::from_value::<AuthParams>(params) {
            Ok(auth) => {
                let _ = events.send(HostEvent::AuthCommand {
                    player: PlayerIdentity {
                        name: auth.name,
                        controller: auth.controller,
                    },
                    code: auth.code,
                });
            }
            Err(err) => warn!(error = %err, "malformed event.auth params"),
        },
        "event.leave" => match serde_json::from_value::<LeaveParams>(params) {
            Ok(leave) => {
                let _ = events.send(HostEvent::PlayerLeft(PlayerIdentity {
                    name: leave.name,
                    controller: leave.controller,
                }));
            }
            Err(err) => warn!(error = %err, "malformed event.leave params"),
        },
        "event.chat" => match serde_json::from_value::<ChatParams>(params) {
            Ok(chat) => {
                let _ = events.send(HostEvent::Chat {
                    name: chat.name,
                    message: chat.message,
                });
            }
            Err(err) => warn!(error = %err, "malformed event.chat params"),
        },
        other => {
            if id.is_some() {
                respond(outbound, id, Err((-32601, format!("unknown method {other}"))));
            } else {
                debug!(method = other, "ignoring unknown host notification");
            }
        }
    }
}

fn respond(
    outbound: &mpsc::UnboundedSender<String>,
    id: Option<Value>,
    outcome: Result<Value, (i64, String)>,
) {
    // Notifications carry no id and get no reply.
    let Some(id) = id else { return };
    let frame = match outcome {
        Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
        Err((code, message)) => {
            json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
        }
    };
    let _ = outbound.send(frame.to_string());
}

fn complete_request(frame: &Value, pending: &parking_lot::Mutex<PendingMap>) {
    let Some(id) = frame.get("id").and_then(Value::as_u64) else {
        warn!("dropping host response without a usable id");
        return;
    };
    let Some(slot) = pending.lock().remove(&id) else {
        debug!(id, "response for unknown or expired request id");
        return;
    };
    let outcome = if let Some(error) = frame.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unspecified error")
            .to_string();
        Err(HostError::Rejected { message })
    } else {
        Ok(frame.get("result").cloned().unwrap_or(Value::Null))
    };
    let _ = slot.send(outcome);
}

impl RpcHost {
    async fn call(&self, method: &'static str, params: Value) -> Result<Value, HostError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        counter!("earshot_host_requests_total", 1, "method" => method);
        let frame = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        if self.outbound.send(frame.to_string()).is_err() {
            self.pending.lock().remove(&id);
            return Err(HostError::ChannelClosed);
        }

        let outcome = match timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(HostError::ChannelClosed),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(HostError::Timeout)
            }
        };
        if let Err(err) = &outcome {
            counter!(
                "earshot_host_request_failures_total",
                1,
                "method" => method,
                "reason" => err.metric_label()
            );
        }
        outcome
    }

    fn notify(&self, method: &'static str, params: Value) {
        let frame = json!({"jsonrpc": "2.0", "method": method, "params": params});
        if self.outbound.send(frame.to_string()).is_err() {
            debug!(method, "dropping notification, host channel closed");
        }
    }
}

#[derive(Debug, Deserialize)]
struct AuthParams {
    name: String,
    controller: String,
    code: String,
}

#[derive(Debug, Deserialize)]
struct LeaveParams {
    name: String,
    controller: String,
}

#[derive(Debug, Deserialize)]
struct ChatParams {
    name: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ExecResult {
    lines: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PlayersResult {
    players: Vec<PlayerRecord>,
}

#[async_trait]
impl Console for RpcHost {
    async fn exec(&self, command: &str) -> Result<Vec<String>, HostError> {
        let result = self.call("console.exec", json!({"command": command})).await?;
        let decoded: ExecResult =
            serde_json::from_value(result).map_err(|err| HostError::Payload(err.to_string()))?;
        Ok(decoded.lines)
    }
}

#[async_trait]
impl GameDirectory for RpcHost {
    async fn players(&self) -> Result<Vec<PlayerRecord>, HostError> {
        let result = self.call("players.list", json!({})).await?;
        let decoded: PlayersResult =
            serde_json::from_value(result).map_err(|err| HostError::Payload(err.to_string()))?;
        Ok(decoded.players)
    }

    async fn status(&self) -> Result<ServerStatus, HostError> {
        let result = self.call("server.status", json!({})).await?;
        serde_json::from_value(result).map_err(|err| HostError::Payload(err.to_string()))
    }
}

impl GameChat for RpcHost {
    fn announce(&self, message: &str) {
        self.notify("chat.broadcast", json!({"message": message}));
    }

    fn whisper(&self, target: &str, message: &str) {
        self.notify("chat.whisper", json!({"target": target, "message": message}));
    }
}
