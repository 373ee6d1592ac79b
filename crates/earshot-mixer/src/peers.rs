//! Media peer lifecycle: outgoing dials, answered calls, and gain routing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::gain::StereoGain;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("peer {0} is unreachable")]
    Unreachable(String),
    #[error("media transport error: {0}")]
    Transport(String),
}

/// Gain fader on an established media stream.
pub trait GainControl: Send + Sync {
    fn set_stereo(&self, left: f32, right: f32);
}

/// Opens media streams to remote peers. Implemented by the embedding
/// application over whatever media transport it uses.
#[async_trait]
pub trait MediaConnector: Send + Sync {
    async fn dial(&self, peer_media_id: &str) -> Result<Arc<dyn GainControl>, MediaError>;
}

struct PeerEntry {
    name: Option<String>,
    control: Option<Arc<dyn GainControl>>,
    dial: Option<JoinHandle<()>>,
}

/// Tracks every remote peer the mixer knows about, keyed by media id.
pub(crate) struct PeerTable {
    peers: Arc<DashMap<String, PeerEntry>>,
}

impl PeerTable {
    pub(crate) fn new() -> Self {
        PeerTable { peers: Arc::new(DashMap::new()) }
    }

    /// Registers a freshly joined peer and dials it after `delay`. The delay
    /// gives the remote client time to finish its own handshake before the
    /// call lands.
    pub(crate) fn begin_dial(
        &self,
        connector: Arc<dyn MediaConnector>,
        peer_media_id: String,
        name: String,
        delay: Duration,
    ) {
        let placeholder = PeerEntry { name: Some(name), control: None, dial: None };
        if let Some(stale) = self.peers.insert(peer_media_id.clone(), placeholder) {
            if let Some(dial) = stale.dial {
                dial.abort();
            }
        }

        let peers = Arc::clone(&self.peers);
        let id = peer_media_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !peers.contains_key(&id) {
                return;
            }
            match connector.dial(&id).await {
                Ok(control) => {
                    if let Some(mut entry) = peers.get_mut(&id) {
                        entry.control = Some(control);
                    } else {
                        debug!(peer = %id, "peer left while its dial was in flight");
                    }
                }
                Err(err) => {
                    warn!(peer = %id, error = %err, "dial failed, dropping peer");
                    peers.remove(&id);
                }
            }
        });

        match self.peers.get_mut(&peer_media_id) {
            Some(mut entry) => entry.dial = Some(handle),
            // The peer left again between the insert and here.
            None => handle.abort(),
        }
    }

    /// Attaches the media stream of a peer that called us first.
    pub(crate) fn attach(&self, peer_media_id: String, control: Arc<dyn GainControl>) {
        match self.peers.entry(peer_media_id) {
            Entry::Occupied(mut occupied) => {
                occupied.get_mut().control = Some(control);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(PeerEntry { name: None, control: Some(control), dial: None });
            }
        }
    }

    pub(crate) fn drop_peer(&self, peer_media_id: &str) {
        if let Some((_, entry)) = self.peers.remove(peer_media_id) {
            if let Some(dial) = entry.dial {
                dial.abort();
            }
            debug!(peer = entry.name.as_deref().unwrap_or("unnamed"), "peer released");
        }
    }

    pub(crate) fn set_gain(&self, peer_media_id: &str, gain: StereoGain) {
        if let Some(entry) = self.peers.get(peer_media_id) {
            if let Some(control) = entry.control.as_ref() {
                control.set_stereo(gain.left, gain.right);
            }
        }
    }

    pub(crate) fn reset(&self) {
        let ids: Vec<String> = self.peers.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            self.drop_peer(&id);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.peers.len()
    }
}
