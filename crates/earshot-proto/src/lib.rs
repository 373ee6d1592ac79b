//! Message types exchanged between the earshot bridge and browser voice
//! clients over the realtime channel. Field and event names are fixed by the
//! deployed client generation; renames here are wire-breaking.

mod color;

pub use color::{TeamColor, TEAM_PALETTE};

use serde::{Deserialize, Serialize};

/// Messages sent from a voice client to the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Opens the session: announces the client's media endpoint so other
    /// peers can dial it once the player authenticates.
    Hi {
        #[serde(rename = "peerMediaId")]
        peer_media_id: String,
    },
}

/// Messages sent from the bridge to voice clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake reply: the one-time auth code plus everything the client
    /// needs to configure itself before any telemetry flows.
    Hi {
        code: String,
        #[serde(rename = "serverName")]
        server_name: String,
        #[serde(rename = "hostName")]
        host_name: String,
        config: NetConfig,
    },
    /// The in-game auth command matched this session's code.
    Authenticated { user: String },
    /// Instructs the client to drop all peers and start over.
    Bye,
    #[serde(rename = "peer join")]
    PeerJoin {
        name: String,
        #[serde(rename = "peerMediaId")]
        peer_media_id: String,
    },
    #[serde(rename = "peer leave")]
    PeerLeave {
        name: String,
        #[serde(rename = "peerMediaId")]
        peer_media_id: String,
    },
    /// Game chat relayed for on-screen display or TTS readout.
    Chat { name: String, message: String },
    /// Per-tick reconciled telemetry, one entry per visible player.
    Transforms { entries: Vec<SnapshotEntry> },
}

/// Client-facing configuration snapshot, sent once at handshake and fixed
/// for the lifetime of the bridge process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetConfig {
    /// Audible radius in world units (tenths of a stud).
    pub max_voice_distance: f32,
    pub falloff_factor: f32,
    pub use_proximity: bool,
    pub use_panning: bool,
    /// Dead players keep speaking spatially when set.
    pub dead_voice: bool,
    /// Dead players hear each other at full volume when set.
    pub dead_non_proximity: bool,
    pub map_scale: f32,
    #[serde(rename = "useTTS")]
    pub use_tts: bool,
    pub show_chat: bool,
    #[serde(rename = "chatTTS")]
    pub chat_tts: bool,
    pub others_on_minimap: bool,
    pub teammates_on_minimap: bool,
}

/// One player's reconciled state inside a `transforms` broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEntry {
    pub name: String,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub yaw: f32,
    /// Media endpoint of the session bound to this player; null while the
    /// player has no authenticated voice session.
    pub peer_media_id: Option<String>,
    pub is_dead: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minigame: Option<MinigameOverlay>,
}

/// Team context attached to a snapshot entry when the player is in a
/// non-global minigame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MinigameOverlay {
    pub in_session: bool,
    pub team: String,
    pub team_color: TeamColor,
}
