//! Session registry.
//!
//! Owns every live voice connection: the anonymous sessions waiting on an
//! auth code, the authenticated ones receiving telemetry, and the fan-out
//! channels feeding their websocket writers. All mutation happens under one
//! async lock so a connection is never touched by two handlers at once.

use std::collections::HashMap;
use std::sync::Arc;

use metrics::{counter, gauge};
use rand::Rng;
use slab::Slab;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

use earshot_proto::{ServerMessage, SnapshotEntry};

use crate::host::{GameChat, PlayerIdentity};
use crate::reconcile::LastKnownCache;

const CODE_LENGTH: usize = 6;
/// Zero is excluded: it reads like the letter O in the game font.
const CODE_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ123456789";

const AUTH_SUCCESS_WHISPER: &str =
    "<color=\"ff0\">Authentication successful. Please refocus your browser window to finish.</>";
const AUTH_REJECTED_WHISPER: &str = "<color=\"f00\">Invalid authentication code.</>";

struct PeerSession {
    id: Uuid,
    code: String,
    user: Option<PlayerIdentity>,
    peer_media_id: String,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

#[derive(Default)]
struct SessionTable {
    slab: Slab<PeerSession>,
    index: HashMap<Uuid, usize>,
}

impl SessionTable {
    fn insert(&mut self, session: PeerSession) -> usize {
        let id = session.id;
        let key = self.slab.insert(session);
        self.index.insert(id, key);
        key
    }

    fn remove(&mut self, key: usize) -> PeerSession {
        let session = self.slab.remove(key);
        self.index.remove(&session.id);
        session
    }

    fn broadcast(&self, message: &ServerMessage, except: Option<usize>) {
        for (key, session) in self.slab.iter() {
            if Some(key) == except {
                continue;
            }
            let _ = session.tx.send(message.clone());
        }
    }

    fn authenticated(&self) -> usize {
        self.slab.iter().filter(|(_, s)| s.user.is_some()).count()
    }

    fn update_gauges(&self) {
        gauge!("earshot_active_sessions", self.slab.len() as f64);
        gauge!(
            "earshot_authenticated_sessions",
            self.authenticated() as f64
        );
    }
}

/// Handed to the websocket handler on connect.
pub struct Registration {
    pub id: Uuid,
    pub code: String,
    pub receiver: mpsc::UnboundedReceiver<ServerMessage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    pub connections: usize,
    pub authenticated: usize,
}

#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    table: Mutex<SessionTable>,
    chat: Arc<dyn GameChat>,
    cache: LastKnownCache,
}

impl SessionRegistry {
    pub fn new(chat: Arc<dyn GameChat>, cache: LastKnownCache) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                table: Mutex::new(SessionTable::default()),
                chat,
                cache,
            }),
        }
    }

    /// Registers a fresh connection and issues its one-time auth code.
    pub async fn connect(&self, peer_media_id: String) -> Registration {
        let (tx, receiver) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        let code = generate_code();

        let mut table = self.inner.table.lock().await;
        table.insert(PeerSession {
            id,
            code: code.clone(),
            user: None,
            peer_media_id,
            tx,
        });
        table.update_gauges();
        drop(table);

        counter!("earshot_connections_total", 1);
        debug!(connection_id = %id, "voice client connected");
        Registration { id, code, receiver }
    }

    /// Resolves an in-game `auth` command. The first session holding the
    /// code and no identity wins it; everything else is rejected, including
    /// replays of an already-claimed code.
    pub async fn authenticate(&self, player: &PlayerIdentity, code: &str) -> bool {
        let mut table = self.inner.table.lock().await;

        let mut matched = None;
        for (key, session) in table.slab.iter() {
            if session.user.is_none() && session.code == code {
                matched = Some(key);
                break;
            }
        }
        let Some(key) = matched else {
            drop(table);
            counter!("earshot_auth_total", 1, "result" => "rejected");
            info!(user = %player.name, "auth code rejected");
            self.inner.chat.whisper(&player.name, AUTH_REJECTED_WHISPER);
            return false;
        };

        // A fresh login supersedes any session still bound to this player.
        let mut stale = Vec::new();
        for (other, session) in table.slab.iter() {
            if other == key {
                continue;
            }
            if session
                .user
                .as_ref()
                .is_some_and(|user| user.name == player.name)
            {
                stale.push(other);
            }
        }
        for other in stale {
            let session = table.remove(other);
            let _ = session.tx.send(ServerMessage::Bye);
            debug!(user = %player.name, connection_id = %session.id, "evicting superseded session");
            table.broadcast(
                &ServerMessage::PeerLeave {
                    name: player.name.clone(),
                    peer_media_id: session.peer_media_id,
                },
                None,
            );
        }

        let session = &mut table.slab[key];
        session.user = Some(player.clone());
        let peer_media_id = session.peer_media_id.clone();
        let _ = session.tx.send(ServerMessage::Authenticated {
            user: player.name.clone(),
        });
        table.broadcast(
            &ServerMessage::PeerJoin {
                name: player.name.clone(),
                peer_media_id,
            },
            Some(key),
        );
        table.update_gauges();
        drop(table);

        counter!("earshot_auth_total", 1, "result" => "success");
        info!(user = %player.name, "voice session authenticated");
        self.inner.chat.whisper(&player.name, AUTH_SUCCESS_WHISPER);
        self.inner
            .chat
            .announce(&format!("<color=\"ff0\"><b>{}</></> joined the voice chat.", player.name));
        true
    }

    /// Tears down a closed connection. Sessions that never authenticated
    /// disappear without a trace; authenticated ones say goodbye.
    pub async fn disconnect(&self, id: Uuid) {
        let mut table = self.inner.table.lock().await;
        let Some(key) = table.index.get(&id).copied() else {
            return;
        };
        let session = table.remove(key);
        table.update_gauges();

        let Some(user) = session.user else {
            drop(table);
            debug!(connection_id = %id, "unauthenticated client disconnected");
            return;
        };
        table.broadcast(
            &ServerMessage::PeerLeave {
                name: user.name.clone(),
                peer_media_id: session.peer_media_id,
            },
            None,
        );
        drop(table);

        info!(user = %user.name, connection_id = %id, "voice client disconnected");
        self.inner
            .chat
            .announce(&format!("<color=\"ff0\"><b>{}</></> left the voice chat.", user.name));
    }

    /// Handles the game-side leave event: closes every session bound to the
    /// departed player and drops their cached position.
    pub async fn player_left(&self, player: &PlayerIdentity) {
        self.inner.cache.forget(&player.name);

        let mut table = self.inner.table.lock().await;
        let mut keys = Vec::new();
        for (key, session) in table.slab.iter() {
            if session
                .user
                .as_ref()
                .is_some_and(|user| user.name == player.name)
            {
                keys.push(key);
            }
        }
        if keys.is_empty() {
            return;
        }
        for key in keys {
            let session = table.remove(key);
            let _ = session.tx.send(ServerMessage::Bye);
            table.broadcast(
                &ServerMessage::PeerLeave {
                    name: player.name.clone(),
                    peer_media_id: session.peer_media_id,
                },
                None,
            );
        }
        table.update_gauges();
        drop(table);

        info!(user = %player.name, "player left the game, voice session closed");
        self.inner
            .chat
            .announce(&format!("<color=\"ff0\"><b>{}</></> left the voice chat.", player.name));
    }

    /// Sends one tick's snapshot to every authenticated session. Returns how
    /// many sessions it reached.
    pub async fn broadcast_transforms(&self, entries: Vec<SnapshotEntry>) -> usize {
        let table = self.inner.table.lock().await;
        let message = ServerMessage::Transforms { entries };
        let mut delivered = 0;
        for (_, session) in table.slab.iter() {
            if session.user.is_none() {
                continue;
            }
            if session.tx.send(message.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Relays a line of game chat to every connection.
    pub async fn broadcast_chat(&self, name: String, message: String) {
        let table = self.inner.table.lock().await;
        table.broadcast(&ServerMessage::Chat { name, message }, None);
    }

    /// Media endpoints of all authenticated sessions, keyed by player name.
    pub async fn peer_media_ids(&self) -> HashMap<String, String> {
        let table = self.inner.table.lock().await;
        table
            .slab
            .iter()
            .filter_map(|(_, session)| {
                session
                    .user
                    .as_ref()
                    .map(|user| (user.name.clone(), session.peer_media_id.clone()))
            })
            .collect()
    }

    pub async fn stats(&self) -> RegistryStats {
        let table = self.inner.table.lock().await;
        RegistryStats {
            connections: table.slab.len(),
            authenticated: table.authenticated(),
        }
    }

    /// Tells every client to reset and drops all sessions. Called once at
    /// process shutdown.
    pub async fn shutdown(&self) {
        let mut table = self.inner.table.lock().await;
        table.broadcast(&ServerMessage::Bye, None);
        table.slab.clear();
        table.index.clear();
        table.update_gauges();
        info!("session registry drained");
    }
}

fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LENGTH)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct MockChat {
        announcements: parking_lot::Mutex<Vec<String>>,
        whispers: parking_lot::Mutex<Vec<(String, String)>>,
    }

    impl GameChat for MockChat {
        fn announce(&self, message: &str) {
            self.announcements.lock().push(message.to_string());
        }

        fn whisper(&self, target: &str, message: &str) {
            self.whispers
                .lock()
                .push((target.to_string(), message.to_string()));
        }
    }

    fn identity(name: &str) -> PlayerIdentity {
        PlayerIdentity {
            name: name.to_string(),
            controller: format!("pc_{name}"),
        }
    }

    fn setup() -> (SessionRegistry, Arc<MockChat>, LastKnownCache) {
        let chat = Arc::new(MockChat::default());
        let cache = LastKnownCache::default();
        let registry = SessionRegistry::new(chat.clone(), cache.clone());
        (registry, chat, cache)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    #[test]
    fn codes_have_expected_length_and_alphabet() {
        for _ in 0..50 {
            let code = generate_code();
            assert_eq!(code.len(), CODE_LENGTH);
            assert!(code.bytes().all(|b| CODE_ALPHABET.contains(&b)));
            assert!(!code.contains('0'));
        }
    }

    #[tokio::test]
    async fn auth_binds_session_and_notifies_peers() {
        let (registry, chat, _) = setup();
        let mut first = registry.connect("media-1".into()).await;
        let mut second = registry.connect("media-2".into()).await;

        let ok = registry.authenticate(&identity("alice"), &first.code).await;
        assert!(ok);

        let to_first = drain(&mut first.receiver);
        assert_eq!(
            to_first,
            vec![ServerMessage::Authenticated {
                user: "alice".into()
            }]
        );

        let to_second = drain(&mut second.receiver);
        assert_eq!(
            to_second,
            vec![ServerMessage::PeerJoin {
                name: "alice".into(),
                peer_media_id: "media-1".into()
            }]
        );

        assert_eq!(
            chat.whispers.lock().as_slice(),
            &[("alice".to_string(), AUTH_SUCCESS_WHISPER.to_string())]
        );
        assert_eq!(
            chat.announcements.lock().as_slice(),
            &["<color=\"ff0\"><b>alice</></> joined the voice chat.".to_string()]
        );
    }

    #[tokio::test]
    async fn wrong_code_is_rejected_with_whisper() {
        let (registry, chat, _) = setup();
        let mut session = registry.connect("media-1".into()).await;

        let ok = registry.authenticate(&identity("alice"), "nope42").await;
        assert!(!ok);
        assert!(drain(&mut session.receiver).is_empty());
        assert_eq!(
            chat.whispers.lock().as_slice(),
            &[("alice".to_string(), AUTH_REJECTED_WHISPER.to_string())]
        );
        assert!(chat.announcements.lock().is_empty());
    }

    #[tokio::test]
    async fn claimed_code_cannot_be_replayed() {
        let (registry, _, _) = setup();
        let session = registry.connect("media-1".into()).await;

        assert!(registry.authenticate(&identity("alice"), &session.code).await);
        assert!(!registry.authenticate(&identity("mallory"), &session.code).await);
    }

    #[tokio::test]
    async fn unauthenticated_disconnect_is_silent() {
        let (registry, chat, _) = setup();
        let mut observer = registry.connect("media-1".into()).await;
        registry.authenticate(&identity("alice"), &observer.code).await;
        drain(&mut observer.receiver);

        let anon = registry.connect("media-2".into()).await;
        registry.disconnect(anon.id).await;

        assert!(drain(&mut observer.receiver).is_empty());
        assert!(chat.announcements.lock().iter().all(|m| !m.contains("left")));
        assert_eq!(registry.stats().await.connections, 1);
    }

    #[tokio::test]
    async fn authenticated_disconnect_broadcasts_leave() {
        let (registry, chat, _) = setup();
        let leaver = registry.connect("media-1".into()).await;
        registry.authenticate(&identity("alice"), &leaver.code).await;
        let mut observer = registry.connect("media-2".into()).await;

        registry.disconnect(leaver.id).await;

        assert_eq!(
            drain(&mut observer.receiver),
            vec![ServerMessage::PeerLeave {
                name: "alice".into(),
                peer_media_id: "media-1".into()
            }]
        );
        assert!(chat
            .announcements
            .lock()
            .iter()
            .any(|m| m.contains("left the voice chat")));
    }

    #[tokio::test]
    async fn game_leave_closes_sessions_and_forgets_position() {
        let (registry, chat, cache) = setup();
        cache.observe("alice", [1.0, 2.0, 3.0], "pawn_1");

        let mut leaver = registry.connect("media-1".into()).await;
        registry.authenticate(&identity("alice"), &leaver.code).await;
        drain(&mut leaver.receiver);
        let mut observer = registry.connect("media-2".into()).await;

        registry.player_left(&identity("alice")).await;

        assert_eq!(drain(&mut leaver.receiver), vec![ServerMessage::Bye]);
        assert_eq!(
            drain(&mut observer.receiver),
            vec![ServerMessage::PeerLeave {
                name: "alice".into(),
                peer_media_id: "media-1".into()
            }]
        );
        assert!(cache.recall("alice").is_none());
        assert!(chat
            .announcements
            .lock()
            .iter()
            .any(|m| m.contains("left the voice chat")));
        assert_eq!(registry.stats().await.connections, 1);
    }

    #[tokio::test]
    async fn game_leave_without_session_stays_quiet() {
        let (registry, chat, _) = setup();
        registry.player_left(&identity("ghost")).await;
        assert!(chat.announcements.lock().is_empty());
    }

    #[tokio::test]
    async fn transforms_reach_only_authenticated_sessions() {
        let (registry, _, _) = setup();
        let mut authed = registry.connect("media-1".into()).await;
        registry.authenticate(&identity("alice"), &authed.code).await;
        drain(&mut authed.receiver);
        let mut anon = registry.connect("media-2".into()).await;

        let delivered = registry.broadcast_transforms(Vec::new()).await;

        assert_eq!(delivered, 1);
        assert_eq!(
            drain(&mut authed.receiver),
            vec![ServerMessage::Transforms { entries: vec![] }]
        );
        assert!(drain(&mut anon.receiver).is_empty());
    }

    #[tokio::test]
    async fn chat_reaches_every_session() {
        let (registry, _, _) = setup();
        let mut authed = registry.connect("media-1".into()).await;
        registry.authenticate(&identity("alice"), &authed.code).await;
        drain(&mut authed.receiver);
        let mut anon = registry.connect("media-2".into()).await;

        registry.broadcast_chat("bob".into(), "hello".into()).await;

        let expected = ServerMessage::Chat {
            name: "bob".into(),
            message: "hello".into(),
        };
        assert_eq!(drain(&mut authed.receiver), vec![expected.clone()]);
        assert_eq!(drain(&mut anon.receiver), vec![expected]);
    }

    #[tokio::test]
    async fn reauth_evicts_previous_session_for_same_player() {
        let (registry, _, _) = setup();
        let mut old = registry.connect("media-old".into()).await;
        registry.authenticate(&identity("alice"), &old.code).await;
        drain(&mut old.receiver);

        let new = registry.connect("media-new".into()).await;
        assert!(registry.authenticate(&identity("alice"), &new.code).await);

        let to_old = drain(&mut old.receiver);
        assert_eq!(to_old.first(), Some(&ServerMessage::Bye));

        let ids = registry.peer_media_ids().await;
        assert_eq!(ids.get("alice").map(String::as_str), Some("media-new"));
        assert_eq!(registry.stats().await.connections, 1);
    }

    #[tokio::test]
    async fn shutdown_says_bye_to_everyone() {
        let (registry, _, _) = setup();
        let mut authed = registry.connect("media-1".into()).await;
        registry.authenticate(&identity("alice"), &authed.code).await;
        drain(&mut authed.receiver);
        let mut anon = registry.connect("media-2".into()).await;

        registry.shutdown().await;

        assert_eq!(drain(&mut authed.receiver), vec![ServerMessage::Bye]);
        assert_eq!(drain(&mut anon.receiver), vec![ServerMessage::Bye]);
        let stats = registry.stats().await;
        assert_eq!(stats.connections, 0);
        assert_eq!(stats.authenticated, 0);
    }
}
