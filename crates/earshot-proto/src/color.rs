use serde::{Deserialize, Serialize};

/// RGBA team color as carried on the wire (`[r, g, b, a]`, 0-255).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[u8; 4]", into = "[u8; 4]")]
pub struct TeamColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl TeamColor {
    pub const WHITE: TeamColor = TeamColor::rgba(255, 255, 255, 255);

    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    /// Resolves a legacy palette index. Out-of-range indices normalize to
    /// opaque white rather than failing the record.
    pub fn from_palette(index: usize) -> Self {
        TEAM_PALETTE.get(index).copied().unwrap_or(Self::WHITE)
    }
}

impl From<[u8; 4]> for TeamColor {
    fn from([r, g, b, a]: [u8; 4]) -> Self {
        Self { r, g, b, a }
    }
}

impl From<TeamColor> for [u8; 4] {
    fn from(color: TeamColor) -> Self {
        [color.r, color.g, color.b, color.a]
    }
}

/// Default team colors. Older rulesets store a palette index instead of an
/// explicit color value.
pub const TEAM_PALETTE: [TeamColor; 8] = [
    TeamColor::rgba(255, 255, 255, 255),
    TeamColor::rgba(47, 79, 255, 255),
    TeamColor::rgba(255, 42, 33, 255),
    TeamColor::rgba(16, 160, 66, 255),
    TeamColor::rgba(255, 205, 0, 255),
    TeamColor::rgba(255, 122, 24, 255),
    TeamColor::rgba(141, 56, 201, 255),
    TeamColor::rgba(47, 216, 255, 255),
];
