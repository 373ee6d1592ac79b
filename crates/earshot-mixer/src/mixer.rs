//! Session-side mixing engine: consumes server messages, tracks peers, and
//! drives per-peer stereo gains from transform snapshots.

use std::sync::Arc;
use std::time::Duration;

use earshot_proto::{NetConfig, ServerMessage, SnapshotEntry};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::gain::stereo_gain;
use crate::peers::{GainControl, MediaConnector, PeerTable};

/// Grace period between a peer join and the outgoing call, so the remote
/// client can finish wiring its media stack.
pub const DEFAULT_DIAL_DELAY: Duration = Duration::from_millis(500);

#[derive(Default)]
struct MixerState {
    config: Option<NetConfig>,
    auth_code: Option<String>,
    local_name: Option<String>,
}

/// Client-side voice mixer for one bridge session.
///
/// The embedding application feeds it every [`ServerMessage`] the session
/// receives, either one by one through [`Mixer::handle`] or in bulk through
/// [`Mixer::run`], and implements [`MediaConnector`] plus [`GainControl`]
/// over its media transport. Everything else, from peer lifecycle to the
/// spatial gain updates, happens in here.
pub struct Mixer {
    connector: Arc<dyn MediaConnector>,
    peers: PeerTable,
    state: Mutex<MixerState>,
    own_peer_media_id: String,
    dial_delay: Duration,
}

impl Mixer {
    pub fn new(connector: Arc<dyn MediaConnector>, own_peer_media_id: String) -> Self {
        Mixer::with_dial_delay(connector, own_peer_media_id, DEFAULT_DIAL_DELAY)
    }

    pub fn with_dial_delay(
        connector: Arc<dyn MediaConnector>,
        own_peer_media_id: String,
        dial_delay: Duration,
    ) -> Self {
        Mixer {
            connector,
            peers: PeerTable::new(),
            state: Mutex::new(MixerState::default()),
            own_peer_media_id,
            dial_delay,
        }
    }

    /// One-time code the player whispers in game chat to claim this session.
    pub fn auth_code(&self) -> Option<String> {
        self.state.lock().auth_code.clone()
    }

    pub fn config(&self) -> Option<NetConfig> {
        self.state.lock().config.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.lock().local_name.is_some()
    }

    pub fn local_name(&self) -> Option<String> {
        self.state.lock().local_name.clone()
    }

    pub fn connected_peers(&self) -> usize {
        self.peers.len()
    }

    /// Registers the media stream of a peer that called us before we dialed.
    pub fn attach_peer(&self, peer_media_id: String, control: Arc<dyn GainControl>) {
        self.peers.attach(peer_media_id, control);
    }

    /// Applies one server message to the mixer.
    pub fn handle(&self, message: ServerMessage) {
        match message {
            ServerMessage::Hi { code, server_name, config, .. } => {
                info!(server = %server_name, "session opened, awaiting in-game authentication");
                let mut state = self.state.lock();
                state.auth_code = Some(code);
                state.config = Some(config);
            }
            ServerMessage::Authenticated { user } => {
                info!(user = %user, "session authenticated");
                self.state.lock().local_name = Some(user);
            }
            ServerMessage::Bye => {
                info!("server closed the session");
                self.peers.reset();
                *self.state.lock() = MixerState::default();
            }
            ServerMessage::PeerJoin { name, peer_media_id } => {
                if !self.is_authenticated() || peer_media_id == self.own_peer_media_id {
                    return;
                }
                info!(peer = %name, "peer joined, dialing");
                self.peers.begin_dial(
                    Arc::clone(&self.connector),
                    peer_media_id,
                    name,
                    self.dial_delay,
                );
            }
            ServerMessage::PeerLeave { name, peer_media_id } => {
                info!(peer = %name, "peer left");
                self.peers.drop_peer(&peer_media_id);
            }
            ServerMessage::Chat { name, message } => {
                // Chat rendering belongs to the embedder; the mixer only logs it.
                debug!(from = %name, message = %message, "chat relayed");
            }
            ServerMessage::Transforms { entries } => {
                self.apply_snapshot(&entries);
            }
        }
    }

    /// Drains the session message channel until it closes. Bursts of queued
    /// transform snapshots are coalesced: only the newest one in a batch is
    /// applied, while every lifecycle message is still handled in order.
    pub async fn run(self: Arc<Self>, mut messages: mpsc::UnboundedReceiver<ServerMessage>) {
        while let Some(first) = messages.recv().await {
            let mut pending_snapshot = None;
            self.triage(first, &mut pending_snapshot);
            while let Ok(more) = messages.try_recv() {
                self.triage(more, &mut pending_snapshot);
            }
            if let Some(entries) = pending_snapshot.take() {
                self.apply_snapshot(&entries);
            }
        }
    }

    fn triage(&self, message: ServerMessage, pending: &mut Option<Vec<SnapshotEntry>>) {
        match message {
            ServerMessage::Transforms { entries } => *pending = Some(entries),
            other => self.handle(other),
        }
    }

    fn apply_snapshot(&self, entries: &[SnapshotEntry]) {
        let (config, local_name) = {
            let state = self.state.lock();
            match (state.config.clone(), state.local_name.clone()) {
                (Some(config), Some(name)) => (config, name),
                _ => return,
            }
        };
        let Some(listener) = entries.iter().find(|entry| entry.name == local_name) else {
            // The bridge has no position for us this tick; keep last gains.
            debug!("snapshot carries no transform for the local player");
            return;
        };

        for speaker in entries {
            if speaker.name == local_name {
                continue;
            }
            let Some(peer_media_id) = speaker.peer_media_id.as_deref() else {
                continue;
            };
            if peer_media_id == self.own_peer_media_id {
                continue;
            }
            self.peers.set_gain(peer_media_id, stereo_gain(listener, speaker, &config));
        }
    }
}
