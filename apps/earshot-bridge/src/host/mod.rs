//! Capabilities provided by the game-server wrapper that spawns the bridge.
//!
//! Everything the bridge knows about the game flows through the traits here:
//! console queries, the player directory, outbound chat, and the push events
//! in [`HostEvent`]. Production wiring lives in [`rpc`]; tests substitute
//! in-memory implementations.

pub mod rpc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable handle to a connected player. Display names can repeat across
/// reconnects; controller refs cannot, so every join in the bridge keys on
/// `controller`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlayerIdentity {
    pub name: String,
    pub controller: String,
}

/// One row of the host's player directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerRecord {
    pub name: String,
    pub controller: String,
    /// Player state actor. Minigame member lists reference these, not
    /// controllers, so the directory carries both.
    pub state: String,
}

impl PlayerRecord {
    pub fn identity(&self) -> PlayerIdentity {
        PlayerIdentity {
            name: self.name.clone(),
            controller: self.controller.clone(),
        }
    }
}

/// Game-server status surfaced to clients in the handshake payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub server_name: String,
    pub host_name: String,
}

/// Push events delivered by the host wrapper.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    /// A player disconnected from the game server.
    PlayerLeft(PlayerIdentity),
    /// A player ran the in-game auth command.
    AuthCommand { player: PlayerIdentity, code: String },
    /// A line of game chat.
    Chat { name: String, message: String },
    /// The wrapper is shutting the bridge down.
    Stop,
}

/// Errors surfaced by host request capabilities.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("host request timed out")]
    Timeout,
    #[error("host channel closed")]
    ChannelClosed,
    #[error("host rejected request: {message}")]
    Rejected { message: String },
    #[error("malformed host payload: {0}")]
    Payload(String),
}

impl HostError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            HostError::Timeout => "timeout",
            HostError::ChannelClosed => "channel_closed",
            HostError::Rejected { .. } => "rejected",
            HostError::Payload(_) => "malformed_payload",
        }
    }
}

/// Runs a console command and returns the log lines it produced.
#[async_trait]
pub trait Console: Send + Sync {
    async fn exec(&self, command: &str) -> Result<Vec<String>, HostError>;
}

/// Read access to the game server's player directory and status.
#[async_trait]
pub trait GameDirectory: Send + Sync {
    async fn players(&self) -> Result<Vec<PlayerRecord>, HostError>;
    async fn status(&self) -> Result<ServerStatus, HostError>;
}

/// Outbound game chat. Fire-and-forget: delivery failures are logged by the
/// implementation and never retried.
pub trait GameChat: Send + Sync {
    fn announce(&self, message: &str);
    fn whisper(&self, target: &str, message: &str);
}
