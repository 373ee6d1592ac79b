//! Minigame and team resolution.
//!
//! Joins the raw ruleset/team records from one tick into a tree of active
//! minigames, then answers "which minigame and team is this player on" for
//! snapshot overlays. Member lists reference player-state actors; those are
//! translated back to identities through the player directory, and all
//! membership checks compare controller refs because display names repeat.

use earshot_proto::{MinigameOverlay, TeamColor};

use crate::host::{PlayerIdentity, PlayerRecord};
use crate::scrape::{MemberGroup, MinigameRecords};

/// Name of the implicit ruleset every player belongs to. Never surfaced.
pub const GLOBAL_RULESET: &str = "GLOBAL";

#[derive(Debug, Clone, PartialEq)]
pub struct Minigame {
    pub name: String,
    pub in_session: bool,
    pub members: Vec<PlayerIdentity>,
    pub teams: Vec<Team>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Team {
    pub name: String,
    pub color: TeamColor,
    pub members: Vec<PlayerIdentity>,
}

/// Every non-global minigame resolved for one tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MinigameSet {
    minigames: Vec<Minigame>,
}

impl MinigameSet {
    pub fn resolve(connected: &[PlayerRecord], records: &MinigameRecords) -> Self {
        let minigames = records
            .names
            .iter()
            .filter(|named| named.name != GLOBAL_RULESET)
            .map(|named| {
                let in_session = records
                    .sessions
                    .iter()
                    .find(|s| s.ruleset == named.ruleset)
                    .map(|s| s.in_session)
                    .unwrap_or(false);

                let members = resolve_members(
                    connected,
                    records.members.iter().find(|g| g.owner == named.ruleset),
                );

                let teams = records
                    .teams
                    .iter()
                    .filter(|g| g.owner == named.ruleset)
                    .flat_map(|g| g.refs.iter())
                    .map(|team_id| Team {
                        name: records
                            .team_names
                            .iter()
                            .find(|t| t.team == *team_id)
                            .map(|t| t.name.clone())
                            .unwrap_or_else(|| team_id.clone()),
                        color: records
                            .team_colors
                            .iter()
                            .find(|t| t.team == *team_id)
                            .map(|t| t.color)
                            .unwrap_or(TeamColor::WHITE),
                        members: resolve_members(
                            connected,
                            records.team_members.iter().find(|g| g.owner == *team_id),
                        ),
                    })
                    .collect();

                Minigame {
                    name: named.name.clone(),
                    in_session,
                    members,
                    teams,
                }
            })
            .collect();

        Self { minigames }
    }

    pub fn minigames(&self) -> &[Minigame] {
        &self.minigames
    }

    /// Overlay for one snapshot entry. Present only when the player is a
    /// member of a non-global minigame and on one of its teams.
    pub fn overlay_for(&self, player: &PlayerIdentity) -> Option<MinigameOverlay> {
        let minigame = self.minigames.iter().find(|minigame| {
            minigame
                .members
                .iter()
                .any(|member| member.controller == player.controller)
        })?;
        let team = minigame.teams.iter().find(|team| {
            team.members
                .iter()
                .any(|member| member.controller == player.controller)
        })?;
        Some(MinigameOverlay {
            in_session: minigame.in_session,
            team: team.name.clone(),
            team_color: team.color,
        })
    }
}

/// Member lists carry player-state refs. A ref that resolves to no connected
/// player belongs to someone who already left and is skipped.
fn resolve_members(connected: &[PlayerRecord], group: Option<&MemberGroup>) -> Vec<PlayerIdentity> {
    let Some(group) = group else {
        return Vec::new();
    };
    group
        .refs
        .iter()
        .filter_map(|state| connected.iter().find(|p| p.state == *state))
        .map(PlayerRecord::identity)
        .collect()
}
