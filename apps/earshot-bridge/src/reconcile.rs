//! Per-tick transform reconciliation.
//!
//! Four console dumps and the player directory arrive as independent record
//! lists; this module joins them into one [`Transform`] per connected player.
//! Join keys are explicit: directory rows join bindings by controller ref,
//! bindings join positions/rotations/death flags by pawn id. Where a join
//! comes up empty the reconciler falls back to the last observed position
//! instead of dropping the player.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::host::{PlayerIdentity, PlayerRecord};
use crate::scrape::{DeathFlag, PawnBinding, PawnPosition, PawnRotation};

/// One player's reconciled state for a single tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Transform {
    pub player: PlayerIdentity,
    pub pawn: Option<String>,
    pub pos: Option<[f32; 3]>,
    pub yaw: f32,
    pub is_dead: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LastKnown {
    pub pos: [f32; 3],
    pub pawn: String,
}

/// Last observed position per player name, replayed on ticks where the
/// player's pawn is unobservable (loading in, spectating, mid-respawn).
#[derive(Clone, Default)]
pub struct LastKnownCache {
    inner: Arc<Mutex<HashMap<String, LastKnown>>>,
}

impl LastKnownCache {
    pub fn observe(&self, name: &str, pos: [f32; 3], pawn: &str) {
        self.inner.lock().insert(
            name.to_string(),
            LastKnown {
                pos,
                pawn: pawn.to_string(),
            },
        );
    }

    pub fn recall(&self, name: &str) -> Option<LastKnown> {
        self.inner.lock().get(name).cloned()
    }

    pub fn forget(&self, name: &str) {
        self.inner.lock().remove(name);
    }

    /// Drops entries for players no longer connected, so a missed leave
    /// event cannot strand a position forever.
    pub fn sweep<'a>(&self, connected: impl IntoIterator<Item = &'a str>) {
        let keep: HashSet<&str> = connected.into_iter().collect();
        self.inner.lock().retain(|name, _| keep.contains(name.as_str()));
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Joins one tick's records into transforms.
///
/// Every connected player yields a transform unless their position is
/// unobservable this tick and the cache holds nothing for them. Fallback
/// transforms always read as dead; life state is only trusted when it was
/// observed alongside a live position.
pub fn reconcile_transforms(
    connected: &[PlayerRecord],
    bindings: &[PawnBinding],
    deaths: &[DeathFlag],
    positions: &[PawnPosition],
    rotations: &[PawnRotation],
    cache: &LastKnownCache,
) -> Vec<Transform> {
    let mut transforms = Vec::with_capacity(connected.len());

    for record in connected {
        let binding = bindings
            .iter()
            .find(|binding| binding.controller == record.controller);

        // First match wins when a stale actor still shares a pawn id.
        let observed = binding.and_then(|binding| {
            let position = positions.iter().find(|p| p.pawn == binding.pawn)?;
            let is_dead = deaths
                .iter()
                .find(|d| d.pawn == binding.pawn)
                .map(|d| d.dead)
                .unwrap_or(true);
            Some((binding.pawn.clone(), position.pos, is_dead))
        });

        let (pawn, pos, is_dead) = match observed {
            Some((pawn, pos, is_dead)) => {
                cache.observe(&record.name, pos, &pawn);
                (pawn, pos, is_dead)
            }
            None => match cache.recall(&record.name) {
                Some(last) => (last.pawn, last.pos, true),
                None => continue,
            },
        };

        let yaw = rotations
            .iter()
            .find(|r| r.pawn == pawn)
            .map(|r| r.yaw)
            .unwrap_or(0.0);

        transforms.push(Transform {
            player: record.identity(),
            pawn: Some(pawn),
            pos: Some(pos),
            yaw,
            is_dead,
        });
    }

    transforms
}
