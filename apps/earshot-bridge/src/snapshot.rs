//! The telemetry tick.
//!
//! On a fixed interval the ticker runs every console query concurrently,
//! reconciles the results into transforms, resolves minigames, and fans the
//! snapshot out through the session registry. A failed query abandons the
//! whole tick: the cache is left untouched and the next firing starts clean.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace};

use earshot_proto::SnapshotEntry;

use crate::host::{Console, GameDirectory, HostError};
use crate::minigame::MinigameSet;
use crate::reconcile::{reconcile_transforms, LastKnownCache, Transform};
use crate::registry::SessionRegistry;
use crate::scrape;

pub struct Ticker {
    pub console: Arc<dyn Console>,
    pub directory: Arc<dyn GameDirectory>,
    pub registry: SessionRegistry,
    pub cache: LastKnownCache,
    pub poll_interval: Duration,
}

#[derive(Debug)]
struct TickOutcome {
    players: usize,
    delivered: usize,
    /// Names of the active minigames, `None` when minigame data did not
    /// decode this tick.
    minigames: Option<Vec<String>>,
}

impl Ticker {
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = interval(self.poll_interval);
            // A slow tick skips firings instead of queueing them; overlapping
            // ticks would race on the cache.
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut active_minigames: Vec<String> = Vec::new();
            loop {
                timer.tick().await;
                match self.tick().await {
                    Ok(outcome) => {
                        counter!("earshot_ticks_total", 1, "result" => "ok");
                        gauge!("earshot_players_tracked", outcome.players as f64);
                        trace!(
                            players = outcome.players,
                            delivered = outcome.delivered,
                            "tick complete"
                        );
                        if let Some(names) = outcome.minigames {
                            if names != active_minigames {
                                info!(minigames = ?names, "active minigames changed");
                                active_minigames = names;
                            }
                        }
                    }
                    Err(err) => {
                        counter!("earshot_ticks_total", 1, "result" => "error");
                        counter!(
                            "earshot_tick_failures_total",
                            1,
                            "reason" => err.metric_label()
                        );
                        debug!(error = %err, "telemetry tick abandoned");
                    }
                }
            }
        })
    }

    async fn tick(&self) -> Result<TickOutcome, HostError> {
        let console = self.console.as_ref();
        let (players, bindings, deaths, positions, rotations, minigame_records) = tokio::try_join!(
            self.directory.players(),
            scrape::pawn_bindings(console),
            scrape::death_flags(console),
            scrape::pawn_positions(console),
            scrape::pawn_rotations(console),
            scrape::minigame_records(console),
        )?;

        // Only a fully successful query round touches the cache.
        self.cache.sweep(players.iter().map(|p| p.name.as_str()));

        let transforms = reconcile_transforms(
            &players,
            &bindings,
            &deaths,
            &positions,
            &rotations,
            &self.cache,
        );
        let minigames = minigame_records.map(|records| MinigameSet::resolve(&players, &records));
        let peer_ids = self.registry.peer_media_ids().await;
        let entries = build_entries(&transforms, minigames.as_ref(), &peer_ids);

        let players = entries.len();
        let delivered = self.registry.broadcast_transforms(entries).await;

        Ok(TickOutcome {
            players,
            delivered,
            minigames: minigames.map(|set| {
                set.minigames()
                    .iter()
                    .map(|minigame| minigame.name.clone())
                    .collect()
            }),
        })
    }
}

/// Turns reconciled transforms into wire entries. Transforms without a
/// position never made it through fallback and are dropped here.
fn build_entries(
    transforms: &[Transform],
    minigames: Option<&MinigameSet>,
    peer_ids: &HashMap<String, String>,
) -> Vec<SnapshotEntry> {
    transforms
        .iter()
        .filter_map(|transform| {
            let pos = transform.pos?;
            Some(SnapshotEntry {
                name: transform.player.name.clone(),
                x: pos[0],
                y: pos[1],
                z: pos[2],
                yaw: transform.yaw,
                peer_media_id: peer_ids.get(&transform.player.name).cloned(),
                is_dead: transform.is_dead,
                minigame: minigames.and_then(|set| set.overlay_for(&transform.player)),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use earshot_proto::ServerMessage;

    use crate::host::{PlayerIdentity, PlayerRecord, ServerStatus};

    fn transform(name: &str, pos: Option<[f32; 3]>) -> Transform {
        Transform {
            player: PlayerIdentity {
                name: name.to_string(),
                controller: format!("pc_{name}"),
            },
            pawn: pos.map(|_| format!("pawn_{name}")),
            pos,
            yaw: 10.0,
            is_dead: false,
        }
    }

    #[test]
    fn entries_drop_positionless_transforms() {
        let entries = build_entries(
            &[transform("alice", Some([1.0, 2.0, 3.0])), transform("bob", None)],
            None,
            &HashMap::new(),
        );
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "alice");
        assert_eq!((entries[0].x, entries[0].y, entries[0].z), (1.0, 2.0, 3.0));
    }

    #[test]
    fn entries_attach_peer_media_id_when_session_exists() {
        let mut peer_ids = HashMap::new();
        peer_ids.insert("alice".to_string(), "media-1".to_string());
        let entries = build_entries(
            &[transform("alice", Some([0.0; 3])), transform("bob", Some([0.0; 3]))],
            None,
            &peer_ids,
        );
        assert_eq!(entries[0].peer_media_id.as_deref(), Some("media-1"));
        assert_eq!(entries[1].peer_media_id, None);
    }

    struct ScriptedConsole {
        responses: HashMap<String, Vec<String>>,
        fail: bool,
    }

    impl ScriptedConsole {
        fn new() -> Self {
            Self {
                responses: HashMap::new(),
                fail: false,
            }
        }

        fn script(mut self, command: &str, lines: &[&str]) -> Self {
            self.responses
                .insert(command.to_string(), lines.iter().map(|s| s.to_string()).collect());
            self
        }
    }

    #[async_trait]
    impl Console for ScriptedConsole {
        async fn exec(&self, command: &str) -> Result<Vec<String>, HostError> {
            if self.fail {
                return Err(HostError::Timeout);
            }
            Ok(self.responses.get(command).cloned().unwrap_or_default())
        }
    }

    struct FixedDirectory {
        players: Vec<PlayerRecord>,
    }

    #[async_trait]
    impl GameDirectory for FixedDirectory {
        async fn players(&self) -> Result<Vec<PlayerRecord>, HostError> {
            Ok(self.players.clone())
        }

        async fn status(&self) -> Result<ServerStatus, HostError> {
            Ok(ServerStatus {
                server_name: "test server".into(),
                host_name: "host".into(),
            })
        }
    }

    struct SilentChat;

    impl crate::host::GameChat for SilentChat {
        fn announce(&self, _message: &str) {}
        fn whisper(&self, _target: &str, _message: &str) {}
    }

    fn roster() -> Vec<PlayerRecord> {
        vec![PlayerRecord {
            name: "alice".into(),
            controller: "BP_PlayerController_C_2147482602".into(),
            state: "BP_PlayerState_C_2147482500".into(),
        }]
    }

    #[tokio::test]
    async fn tick_broadcasts_reconciled_snapshot_to_authenticated_session() {
        let console = ScriptedConsole::new()
            .script(
                scrape::PAWN_QUERY,
                &["0) BP_PlayerController_C /x:PersistentLevel.BP_PlayerController_C_2147482602.Pawn = BP_FigureV2_C'/x:PersistentLevel.BP_FigureV2_C_2147482414'"],
            )
            .script(
                scrape::POSITION_QUERY,
                &["0) CapsuleComponent /x:PersistentLevel.BP_FigureV2_C_2147482414.CollisionCylinder.RelativeLocation = (X=100.0,Y=200.0,Z=30.0)"],
            )
            .script(
                scrape::ROTATION_QUERY,
                &["0) CapsuleComponent /x:PersistentLevel.BP_FigureV2_C_2147482414.CollisionCylinder.RelativeRotation = (Pitch=0.0,Yaw=45.0,Roll=0.0)"],
            )
            .script(
                scrape::DEATH_QUERY,
                &["0) BP_FigureV2_C /x:PersistentLevel.BP_FigureV2_C_2147482414.bIsDead = False"],
            );

        let cache = LastKnownCache::default();
        cache.observe("ghost", [9.0, 9.0, 9.0], "pawn_ghost");
        let registry = SessionRegistry::new(Arc::new(SilentChat), cache.clone());
        let mut session = registry.connect("media-1".into()).await;
        registry
            .authenticate(
                &PlayerIdentity {
                    name: "alice".into(),
                    controller: "BP_PlayerController_C_2147482602".into(),
                },
                &session.code,
            )
            .await;
        while session.receiver.try_recv().is_ok() {}

        let ticker = Ticker {
            console: Arc::new(console),
            directory: Arc::new(FixedDirectory { players: roster() }),
            registry,
            cache: cache.clone(),
            poll_interval: Duration::from_millis(250),
        };

        let outcome = ticker.tick().await.expect("tick succeeds");
        assert_eq!(outcome.players, 1);
        assert_eq!(outcome.delivered, 1);
        assert_eq!(outcome.minigames, Some(Vec::new()));

        let message = session.receiver.try_recv().expect("snapshot delivered");
        let ServerMessage::Transforms { entries } = message else {
            panic!("expected transforms, got {message:?}");
        };
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "alice");
        assert_eq!((entries[0].x, entries[0].y, entries[0].z), (100.0, 200.0, 30.0));
        assert_eq!(entries[0].yaw, 45.0);
        assert!(!entries[0].is_dead);
        assert_eq!(entries[0].peer_media_id.as_deref(), Some("media-1"));
        assert!(cache.recall("alice").is_some());
        // "ghost" left the roster long ago; the successful tick swept it.
        assert!(cache.recall("ghost").is_none());
    }

    #[tokio::test]
    async fn malformed_minigame_data_drops_all_overlays_for_the_tick() {
        let console = ScriptedConsole::new()
            .script(
                scrape::RULESET_NAME_QUERY,
                &["0) BP_Ruleset_C /x:PersistentLevel.BP_Ruleset_C_100.RulesetName = Deathmatch"],
            )
            .script(
                scrape::TEAM_COLOR_QUERY,
                &["0) BP_Team_C /x:PersistentLevel.BP_Team_C_300.TeamColor = (B=banana,G=0,R=0,A=255)"],
            );

        let cache = LastKnownCache::default();
        let ticker = Ticker {
            console: Arc::new(console),
            directory: Arc::new(FixedDirectory { players: roster() }),
            registry: SessionRegistry::new(Arc::new(SilentChat), cache.clone()),
            cache,
            poll_interval: Duration::from_millis(250),
        };

        let outcome = ticker.tick().await.expect("tick still succeeds");
        assert_eq!(outcome.minigames, None);
    }

    #[tokio::test]
    async fn failed_query_abandons_tick_without_touching_cache() {
        let mut console = ScriptedConsole::new();
        console.fail = true;

        let cache = LastKnownCache::default();
        cache.observe("ghost", [1.0, 1.0, 1.0], "pawn_ghost");

        let ticker = Ticker {
            console: Arc::new(console),
            directory: Arc::new(FixedDirectory { players: roster() }),
            registry: SessionRegistry::new(Arc::new(SilentChat), cache.clone()),
            cache: cache.clone(),
            poll_interval: Duration::from_millis(250),
        };

        ticker.tick().await.expect_err("tick must fail");
        // "ghost" is not in the roster; a successful tick would have swept it.
        assert!(cache.recall("ghost").is_some());
    }
}
