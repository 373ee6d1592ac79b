//! Console line scraping.
//!
//! The game exposes actor state through `GetAll` console commands that print
//! one property per log line. This module owns that line grammar: the query
//! strings, the anchored patterns, and the decoders that turn raw lines into
//! typed records. Transform queries decode leniently (a line that does not
//! match or does not parse is dropped); minigame queries decode strictly (one
//! bad value discards all minigame data for the tick).

use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;
use tracing::debug;

use earshot_proto::TeamColor;

use crate::host::{Console, HostError};

pub const PAWN_QUERY: &str = "GetAll BP_PlayerController_C Pawn";
pub const POSITION_QUERY: &str = "GetAll SceneComponent RelativeLocation Name=CollisionCylinder";
pub const ROTATION_QUERY: &str = "GetAll SceneComponent RelativeRotation Name=CollisionCylinder";
pub const DEATH_QUERY: &str = "GetAll BP_FigureV2_C bIsDead";

pub const RULESET_NAME_QUERY: &str = "GetAll BP_Ruleset_C RulesetName";
pub const RULESET_SESSION_QUERY: &str = "GetAll BP_Ruleset_C bInSession";
pub const RULESET_MEMBERS_QUERY: &str = "GetAll BP_Ruleset_C MemberStates";
pub const RULESET_TEAMS_QUERY: &str = "GetAll BP_Ruleset_C Teams";
pub const TEAM_NAME_QUERY: &str = "GetAll BP_Team_C TeamName";
pub const TEAM_COLOR_QUERY: &str = "GetAll BP_Team_C TeamColor";
pub const TEAM_MEMBERS_QUERY: &str = "GetAll BP_Team_C MemberStates";

/// Controller-to-pawn binding from the controller dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PawnBinding {
    pub controller: String,
    pub pawn: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PawnPosition {
    pub pawn: String,
    pub pos: [f32; 3],
}

#[derive(Debug, Clone, PartialEq)]
pub struct PawnRotation {
    pub pawn: String,
    pub yaw: f32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeathFlag {
    pub pawn: String,
    pub dead: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RulesetName {
    pub ruleset: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RulesetSession {
    pub ruleset: String,
    pub in_session: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeamName {
    pub team: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeamColorRecord {
    pub team: String,
    pub color: TeamColor,
}

/// One actor's array property: the owning actor plus the refs it printed on
/// the indented lines below its header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberGroup {
    pub owner: String,
    pub refs: Vec<String>,
}

/// Raw minigame state for one tick, still unjoined.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MinigameRecords {
    pub names: Vec<RulesetName>,
    pub sessions: Vec<RulesetSession>,
    pub members: Vec<MemberGroup>,
    pub teams: Vec<MemberGroup>,
    pub team_names: Vec<TeamName>,
    pub team_colors: Vec<TeamColorRecord>,
    pub team_members: Vec<MemberGroup>,
}

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("unparseable {field} in line: {line}")]
    Field { field: &'static str, line: String },
}

struct Patterns {
    pawn: Regex,
    position: Regex,
    rotation: Regex,
    death: Regex,
    ruleset_name: Regex,
    ruleset_session: Regex,
    ruleset_members: Regex,
    ruleset_teams: Regex,
    team_name: Regex,
    team_color: Regex,
    team_members: Regex,
    state_item: Regex,
    team_item: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        pawn: Regex::new(
            r"^\d+\) BP_PlayerController_C .+?PersistentLevel\.(?P<controller>BP_PlayerController_C_\d+)\.Pawn = BP_FigureV2_C'.+?:PersistentLevel\.(?P<pawn>BP_FigureV2_C_\d+)'$",
        )
        .expect("pawn pattern"),
        position: Regex::new(
            r"^\d+\) CapsuleComponent .+?PersistentLevel\.(?P<pawn>BP_FigureV2_C_\d+)\.CollisionCylinder\.RelativeLocation = \(X=(?P<x>[\d.-]+),Y=(?P<y>[\d.-]+),Z=(?P<z>[\d.-]+)\)$",
        )
        .expect("position pattern"),
        rotation: Regex::new(
            r"^\d+\) CapsuleComponent .+?PersistentLevel\.(?P<pawn>BP_FigureV2_C_\d+)\.CollisionCylinder\.RelativeRotation = \(Pitch=(?P<pitch>[\d.-]+),Yaw=(?P<yaw>[\d.-]+),Roll=(?P<roll>[\d.-]+)\)$",
        )
        .expect("rotation pattern"),
        death: Regex::new(
            r"^\d+\) BP_FigureV2_C .+?PersistentLevel\.(?P<pawn>BP_FigureV2_C_\d+)\.bIsDead = (?P<dead>True|False)$",
        )
        .expect("death pattern"),
        ruleset_name: Regex::new(
            r"^\d+\) BP_Ruleset_C .+?PersistentLevel\.(?P<ruleset>BP_Ruleset_C_\d+)\.RulesetName = (?P<name>.*)$",
        )
        .expect("ruleset name pattern"),
        ruleset_session: Regex::new(
            r"^\d+\) BP_Ruleset_C .+?PersistentLevel\.(?P<ruleset>BP_Ruleset_C_\d+)\.bInSession = (?P<flag>True|False)$",
        )
        .expect("ruleset session pattern"),
        ruleset_members: Regex::new(
            r"^\d+\) BP_Ruleset_C .+?PersistentLevel\.(?P<ruleset>BP_Ruleset_C_\d+)\.MemberStates =$",
        )
        .expect("ruleset members pattern"),
        ruleset_teams: Regex::new(
            r"^\d+\) BP_Ruleset_C .+?PersistentLevel\.(?P<ruleset>BP_Ruleset_C_\d+)\.Teams =$",
        )
        .expect("ruleset teams pattern"),
        team_name: Regex::new(
            r"^\d+\) BP_Team_C .+?PersistentLevel\.(?P<team>BP_Team_C_\d+)\.TeamName = (?P<name>.*)$",
        )
        .expect("team name pattern"),
        team_color: Regex::new(
            r"^\d+\) BP_Team_C .+?PersistentLevel\.(?P<team>BP_Team_C_\d+)\.TeamColor = (?P<value>.+)$",
        )
        .expect("team color pattern"),
        team_members: Regex::new(
            r"^\d+\) BP_Team_C .+?PersistentLevel\.(?P<team>BP_Team_C_\d+)\.MemberStates =$",
        )
        .expect("team members pattern"),
        state_item: Regex::new(
            r"^\t\d+: BP_PlayerState_C'.+?:PersistentLevel\.(?P<state>BP_PlayerState_C_\d+)'$",
        )
        .expect("state item pattern"),
        team_item: Regex::new(
            r"^\t\d+: BP_Team_C'.+?:PersistentLevel\.(?P<team>BP_Team_C_\d+)'$",
        )
        .expect("team item pattern"),
    })
}

pub fn decode_pawn_bindings(lines: &[String]) -> Vec<PawnBinding> {
    lines
        .iter()
        .filter_map(|line| {
            let caps = patterns().pawn.captures(line)?;
            Some(PawnBinding {
                controller: caps["controller"].to_string(),
                pawn: caps["pawn"].to_string(),
            })
        })
        .collect()
}

pub fn decode_pawn_positions(lines: &[String]) -> Vec<PawnPosition> {
    lines
        .iter()
        .filter_map(|line| {
            let caps = patterns().position.captures(line)?;
            let x: f32 = caps["x"].parse().ok()?;
            let y: f32 = caps["y"].parse().ok()?;
            let z: f32 = caps["z"].parse().ok()?;
            Some(PawnPosition {
                pawn: caps["pawn"].to_string(),
                pos: [x, y, z],
            })
        })
        .collect()
}

pub fn decode_pawn_rotations(lines: &[String]) -> Vec<PawnRotation> {
    lines
        .iter()
        .filter_map(|line| {
            let caps = patterns().rotation.captures(line)?;
            let yaw: f32 = caps["yaw"].parse().ok()?;
            Some(PawnRotation {
                pawn: caps["pawn"].to_string(),
                yaw,
            })
        })
        .collect()
}

pub fn decode_death_flags(lines: &[String]) -> Vec<DeathFlag> {
    lines
        .iter()
        .filter_map(|line| {
            let caps = patterns().death.captures(line)?;
            Some(DeathFlag {
                pawn: caps["pawn"].to_string(),
                dead: &caps["dead"] == "True",
            })
        })
        .collect()
}

pub fn decode_ruleset_names(lines: &[String]) -> Vec<RulesetName> {
    lines
        .iter()
        .filter_map(|line| {
            let caps = patterns().ruleset_name.captures(line)?;
            Some(RulesetName {
                ruleset: caps["ruleset"].to_string(),
                name: caps["name"].to_string(),
            })
        })
        .collect()
}

pub fn decode_ruleset_sessions(lines: &[String]) -> Vec<RulesetSession> {
    lines
        .iter()
        .filter_map(|line| {
            let caps = patterns().ruleset_session.captures(line)?;
            Some(RulesetSession {
                ruleset: caps["ruleset"].to_string(),
                in_session: &caps["flag"] == "True",
            })
        })
        .collect()
}

pub fn decode_team_names(lines: &[String]) -> Vec<TeamName> {
    lines
        .iter()
        .filter_map(|line| {
            let caps = patterns().team_name.captures(line)?;
            Some(TeamName {
                team: caps["team"].to_string(),
                name: caps["name"].to_string(),
            })
        })
        .collect()
}

/// Strict by contract: a team color line whose value fails to parse poisons
/// the whole result.
pub fn decode_team_colors(lines: &[String]) -> Result<Vec<TeamColorRecord>, ScrapeError> {
    let mut colors = Vec::new();
    for line in lines {
        let Some(caps) = patterns().team_color.captures(line) else {
            continue;
        };
        let color = parse_team_color(&caps["value"]).ok_or_else(|| ScrapeError::Field {
            field: "TeamColor",
            line: line.clone(),
        })?;
        colors.push(TeamColorRecord {
            team: caps["team"].to_string(),
            color,
        });
    }
    Ok(colors)
}

/// Current servers print team colors as an explicit BGRA tuple; rulesets
/// saved by older versions stored a palette index instead.
fn parse_team_color(value: &str) -> Option<TeamColor> {
    if let Some(tuple) = value.strip_prefix('(').and_then(|v| v.strip_suffix(')')) {
        let (mut b, mut g, mut r, mut a) = (None, None, None, None);
        for part in tuple.split(',') {
            let (key, raw) = part.split_once('=')?;
            let channel: u8 = raw.trim().parse().ok()?;
            match key.trim() {
                "B" => b = Some(channel),
                "G" => g = Some(channel),
                "R" => r = Some(channel),
                "A" => a = Some(channel),
                _ => return None,
            }
        }
        return Some(TeamColor::rgba(r?, g?, b?, a?));
    }
    let index: usize = value.parse().ok()?;
    Some(TeamColor::from_palette(index))
}

pub fn decode_ruleset_members(lines: &[String]) -> Vec<MemberGroup> {
    decode_groups(lines, |p| (&p.ruleset_members, "ruleset", &p.state_item, "state"))
}

pub fn decode_ruleset_teams(lines: &[String]) -> Vec<MemberGroup> {
    decode_groups(lines, |p| (&p.ruleset_teams, "ruleset", &p.team_item, "team"))
}

pub fn decode_team_members(lines: &[String]) -> Vec<MemberGroup> {
    decode_groups(lines, |p| (&p.team_members, "team", &p.state_item, "state"))
}

/// Array properties print as an actor header followed by tab-indented item
/// lines. Any line that is neither closes the open group, so stray console
/// output between dumps cannot leak items across actors.
fn decode_groups(
    lines: &[String],
    select: fn(&'static Patterns) -> (&'static Regex, &'static str, &'static Regex, &'static str),
) -> Vec<MemberGroup> {
    let (header, owner_group, item, ref_group) = select(patterns());
    let mut groups: Vec<MemberGroup> = Vec::new();
    let mut open = false;
    for line in lines {
        if let Some(caps) = header.captures(line) {
            groups.push(MemberGroup {
                owner: caps[owner_group].to_string(),
                refs: Vec::new(),
            });
            open = true;
        } else if let Some(caps) = item.captures(line) {
            if open {
                if let Some(group) = groups.last_mut() {
                    group.refs.push(caps[ref_group].to_string());
                }
            }
        } else {
            open = false;
        }
    }
    groups
}

pub async fn pawn_bindings(console: &dyn Console) -> Result<Vec<PawnBinding>, HostError> {
    Ok(decode_pawn_bindings(&console.exec(PAWN_QUERY).await?))
}

pub async fn pawn_positions(console: &dyn Console) -> Result<Vec<PawnPosition>, HostError> {
    Ok(decode_pawn_positions(&console.exec(POSITION_QUERY).await?))
}

pub async fn pawn_rotations(console: &dyn Console) -> Result<Vec<PawnRotation>, HostError> {
    Ok(decode_pawn_rotations(&console.exec(ROTATION_QUERY).await?))
}

pub async fn death_flags(console: &dyn Console) -> Result<Vec<DeathFlag>, HostError> {
    Ok(decode_death_flags(&console.exec(DEATH_QUERY).await?))
}

/// Runs the seven minigame queries concurrently. `Ok(None)` means the data
/// did not decode cleanly and this tick carries no minigame overlay; a query
/// failure is a real error and fails the tick like any other.
pub async fn minigame_records(console: &dyn Console) -> Result<Option<MinigameRecords>, HostError> {
    let (names, sessions, members, teams, team_names, team_colors, team_members) = tokio::try_join!(
        console.exec(RULESET_NAME_QUERY),
        console.exec(RULESET_SESSION_QUERY),
        console.exec(RULESET_MEMBERS_QUERY),
        console.exec(RULESET_TEAMS_QUERY),
        console.exec(TEAM_NAME_QUERY),
        console.exec(TEAM_COLOR_QUERY),
        console.exec(TEAM_MEMBERS_QUERY),
    )?;

    let team_colors = match decode_team_colors(&team_colors) {
        Ok(colors) => colors,
        Err(err) => {
            debug!(error = %err, "discarding minigame data for this tick");
            return Ok(None);
        }
    };

    Ok(Some(MinigameRecords {
        names: decode_ruleset_names(&names),
        sessions: decode_ruleset_sessions(&sessions),
        members: decode_ruleset_members(&members),
        teams: decode_ruleset_teams(&teams),
        team_names: decode_team_names(&team_names),
        team_colors,
        team_members: decode_team_members(&team_members),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn pawn_bindings_decode() {
        let input = lines(&[
            "0) BP_PlayerController_C /Game/Maps/Plate/Plate.Plate:PersistentLevel.BP_PlayerController_C_2147482602.Pawn = BP_FigureV2_C'/Game/Maps/Plate/Plate.Plate:PersistentLevel.BP_FigureV2_C_2147482414'",
            "1) BP_PlayerController_C /Game/Maps/Plate/Plate.Plate:PersistentLevel.BP_PlayerController_C_2147482433.Pawn = BP_FigureV2_C'/Game/Maps/Plate/Plate.Plate:PersistentLevel.BP_FigureV2_C_2147482281'",
            "Found 2 Objects",
        ]);
        let bindings = decode_pawn_bindings(&input);
        assert_eq!(
            bindings,
            vec![
                PawnBinding {
                    controller: "BP_PlayerController_C_2147482602".into(),
                    pawn: "BP_FigureV2_C_2147482414".into(),
                },
                PawnBinding {
                    controller: "BP_PlayerController_C_2147482433".into(),
                    pawn: "BP_FigureV2_C_2147482281".into(),
                },
            ]
        );
    }

    #[test]
    fn unpossessed_controller_produces_no_binding() {
        let input = lines(&[
            "0) BP_PlayerController_C /Game/Maps/Plate/Plate.Plate:PersistentLevel.BP_PlayerController_C_2147482602.Pawn = None",
        ]);
        assert!(decode_pawn_bindings(&input).is_empty());
    }

    #[test]
    fn positions_decode_with_negative_coordinates() {
        let input = lines(&[
            "0) CapsuleComponent /Game/Maps/Plate/Plate.Plate:PersistentLevel.BP_FigureV2_C_2147482414.CollisionCylinder.RelativeLocation = (X=12.500,Y=-380.250,Z=30.000)",
        ]);
        let positions = decode_pawn_positions(&input);
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].pawn, "BP_FigureV2_C_2147482414");
        assert_eq!(positions[0].pos, [12.5, -380.25, 30.0]);
    }

    #[test]
    fn malformed_coordinate_drops_only_that_line() {
        let input = lines(&[
            "0) CapsuleComponent /x:PersistentLevel.BP_FigureV2_C_1.CollisionCylinder.RelativeLocation = (X=--5,Y=0.0,Z=0.0)",
            "1) CapsuleComponent /x:PersistentLevel.BP_FigureV2_C_2.CollisionCylinder.RelativeLocation = (X=1.0,Y=2.0,Z=3.0)",
        ]);
        let positions = decode_pawn_positions(&input);
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].pawn, "BP_FigureV2_C_2");
    }

    #[test]
    fn rotation_keeps_yaw_only() {
        let input = lines(&[
            "0) CapsuleComponent /x:PersistentLevel.BP_FigureV2_C_1.CollisionCylinder.RelativeRotation = (Pitch=0.000000,Yaw=-92.500000,Roll=0.000000)",
        ]);
        let rotations = decode_pawn_rotations(&input);
        assert_eq!(rotations.len(), 1);
        assert_eq!(rotations[0].yaw, -92.5);
    }

    #[test]
    fn death_flags_decode() {
        let input = lines(&[
            "0) BP_FigureV2_C /x:PersistentLevel.BP_FigureV2_C_1.bIsDead = True",
            "1) BP_FigureV2_C /x:PersistentLevel.BP_FigureV2_C_2.bIsDead = False",
        ]);
        let flags = decode_death_flags(&input);
        assert_eq!(flags.len(), 2);
        assert!(flags[0].dead);
        assert!(!flags[1].dead);
    }

    #[test]
    fn grouped_members_close_on_foreign_line() {
        let input = lines(&[
            "0) BP_Ruleset_C /x:PersistentLevel.BP_Ruleset_C_100.MemberStates =",
            "\t0: BP_PlayerState_C'/x:PersistentLevel.BP_PlayerState_C_500'",
            "\t1: BP_PlayerState_C'/x:PersistentLevel.BP_PlayerState_C_501'",
            "Found 1 Objects",
            "\t2: BP_PlayerState_C'/x:PersistentLevel.BP_PlayerState_C_502'",
            "1) BP_Ruleset_C /x:PersistentLevel.BP_Ruleset_C_101.MemberStates =",
        ]);
        let groups = decode_ruleset_members(&input);
        assert_eq!(groups.len(), 2);
        assert_eq!(
            groups[0].refs,
            vec!["BP_PlayerState_C_500".to_string(), "BP_PlayerState_C_501".to_string()]
        );
        assert!(groups[1].refs.is_empty());
    }

    #[test]
    fn ruleset_teams_collect_team_refs() {
        let input = lines(&[
            "0) BP_Ruleset_C /x:PersistentLevel.BP_Ruleset_C_100.Teams =",
            "\t0: BP_Team_C'/x:PersistentLevel.BP_Team_C_300'",
            "\t1: BP_Team_C'/x:PersistentLevel.BP_Team_C_301'",
        ]);
        let groups = decode_ruleset_teams(&input);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].owner, "BP_Ruleset_C_100");
        assert_eq!(
            groups[0].refs,
            vec!["BP_Team_C_300".to_string(), "BP_Team_C_301".to_string()]
        );
    }

    #[test]
    fn team_colors_decode_tuple_and_palette_index() {
        let input = lines(&[
            "0) BP_Team_C /x:PersistentLevel.BP_Team_C_300.TeamColor = (B=12,G=34,R=255,A=255)",
            "1) BP_Team_C /x:PersistentLevel.BP_Team_C_301.TeamColor = 3",
        ]);
        let colors = decode_team_colors(&input).expect("both forms decode");
        assert_eq!(colors[0].color, TeamColor::rgba(255, 34, 12, 255));
        assert_eq!(colors[1].color, TeamColor::from_palette(3));
    }

    #[test]
    fn malformed_team_color_is_a_hard_error() {
        let input = lines(&[
            "0) BP_Team_C /x:PersistentLevel.BP_Team_C_300.TeamColor = (B=banana,G=0,R=0,A=255)",
        ]);
        let err = decode_team_colors(&input).expect_err("value must not parse");
        assert!(matches!(err, ScrapeError::Field { field: "TeamColor", .. }));
    }

    #[test]
    fn out_of_range_palette_index_falls_back_to_white() {
        assert_eq!(parse_team_color("99"), Some(TeamColor::WHITE));
    }
}
