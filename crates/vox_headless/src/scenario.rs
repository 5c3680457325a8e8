//! RON scenario definitions.
//!
//! A scenario describes the initial world plus a script of commands
//! submitted at fixed ticks. Scenarios are the headless equivalent of a
//! played match: same spawn, same commands, same tick - same hash.

use serde::{Deserialize, Serialize};

use vox_core::command::{Command, CommandKind};
use vox_core::coord::Coordinate;
use vox_core::unit::Capabilities;
use vox_core::world::{PlayerId, VoxelId};

use crate::HeadlessError;

/// Controller variant for a scenario unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UnitVariant {
    /// Standard actor (move, split, grow, convert).
    #[default]
    Actor,
    /// Bomb (move, explode).
    Bomb,
    /// Spawner emplacement (split, grow; immobile).
    Spawner,
}

impl UnitVariant {
    /// The capability table for this variant.
    #[must_use]
    pub const fn capabilities(self) -> Capabilities {
        match self {
            Self::Actor => Capabilities::actor(),
            Self::Bomb => Capabilities::bomb(),
            Self::Spawner => Capabilities::spawner(),
        }
    }
}

/// One unit in the initial world.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitSpec {
    /// Owning player.
    pub player: PlayerId,
    /// Spawn row.
    pub row: i32,
    /// Spawn column.
    pub col: i32,
    /// Spawn weight level.
    #[serde(default)]
    pub weight: u8,
    /// Initial health.
    pub health: u32,
    /// Controller variant.
    #[serde(default)]
    pub variant: UnitVariant,
}

/// One passive asset in the initial world.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetSpec {
    /// Spawn row.
    pub row: i32,
    /// Spawn column.
    pub col: i32,
    /// Initial health.
    pub health: u32,
}

/// A scripted action, resolved against the spawn-order unit list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScriptAction {
    /// Walk a path of (row, col) cells at the unit's weight.
    MovePath(Vec<(i32, i32)>),
    /// Two-way split.
    Split,
    /// Four-way split.
    Split4,
    /// Grow a weight level.
    Grow,
    /// Shrink a weight level.
    Diminish,
    /// Explode in place.
    Explode,
    /// Set health.
    SetHealth(u32),
    /// Abort the active command.
    Cancel,
    /// No-op.
    Nop,
}

impl ScriptAction {
    /// Build the concrete command for `unit` spawned at `weight`.
    #[must_use]
    pub fn to_command(&self, unit: VoxelId, altitude: i32, weight: u8) -> Command {
        let kind = match self {
            Self::MovePath(cells) => CommandKind::Move {
                path: cells
                    .iter()
                    .map(|&(row, col)| Coordinate::new(row, col, altitude, weight))
                    .collect(),
            },
            Self::Split => CommandKind::Split,
            Self::Split4 => CommandKind::Split4,
            Self::Grow => CommandKind::Grow,
            Self::Diminish => CommandKind::Diminish,
            Self::Explode => CommandKind::Explode,
            Self::SetHealth(health) => CommandKind::SetHealth { health: *health },
            Self::Cancel => CommandKind::Cancel,
            Self::Nop => CommandKind::Nop,
        };
        Command::new(unit, kind)
    }
}

/// One scripted submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptEntry {
    /// Tick at which to submit.
    pub tick: u64,
    /// Index into the scenario's `units` list (spawn order).
    pub unit: usize,
    /// What to do.
    pub action: ScriptAction,
}

/// A complete scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// Scenario name, recorded in replays.
    pub name: String,
    /// Grid rows at weight 0.
    pub rows: u32,
    /// Grid columns at weight 0.
    pub cols: u32,
    /// Number of player slots.
    pub players: u8,
    /// Initial units, in spawn order.
    pub units: Vec<UnitSpec>,
    /// Initial passive assets.
    #[serde(default)]
    pub assets: Vec<AssetSpec>,
    /// Scripted submissions.
    #[serde(default)]
    pub script: Vec<ScriptEntry>,
}

impl Scenario {
    /// Parse a scenario from RON text.
    pub fn from_ron(path: &str, text: &str) -> Result<Self, HeadlessError> {
        ron::from_str(text).map_err(|e| HeadlessError::ScenarioParse {
            path: path.to_string(),
            message: e.to_string(),
        })
    }

    /// Load a scenario from a file.
    pub fn load(path: &std::path::Path) -> Result<Self, HeadlessError> {
        let text = std::fs::read_to_string(path).map_err(|e| HeadlessError::ScenarioRead {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_ron(&path.display().to_string(), &text)
    }

    /// The built-in two-player smoke scenario used when no file is given.
    #[must_use]
    pub fn builtin_skirmish() -> Self {
        Self {
            name: "builtin_skirmish".to_string(),
            rows: 32,
            cols: 32,
            players: 2,
            units: vec![
                UnitSpec {
                    player: 0,
                    row: 4,
                    col: 4,
                    weight: 0,
                    health: 100,
                    variant: UnitVariant::Actor,
                },
                UnitSpec {
                    player: 1,
                    row: 24,
                    col: 24,
                    weight: 0,
                    health: 80,
                    variant: UnitVariant::Actor,
                },
            ],
            assets: vec![AssetSpec {
                row: 4,
                col: 8,
                health: 5,
            }],
            script: vec![
                ScriptEntry {
                    tick: 0,
                    unit: 0,
                    action: ScriptAction::MovePath(vec![
                        (4, 4),
                        (4, 5),
                        (4, 6),
                        (4, 7),
                        (4, 8),
                    ]),
                },
                ScriptEntry {
                    tick: 1,
                    unit: 1,
                    action: ScriptAction::Split,
                },
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_scenario_is_well_formed() {
        let scenario = Scenario::builtin_skirmish();
        assert_eq!(scenario.players, 2);
        assert!(scenario.units.iter().all(|u| u.player < scenario.players));
        for entry in &scenario.script {
            assert!(entry.unit < scenario.units.len());
        }
    }

    #[test]
    fn test_scenario_ron_roundtrip() {
        let scenario = Scenario::builtin_skirmish();
        let text = ron::to_string(&scenario).unwrap();
        let parsed = Scenario::from_ron("inline", &text).unwrap();
        assert_eq!(parsed.name, scenario.name);
        assert_eq!(parsed.units.len(), scenario.units.len());
        assert_eq!(parsed.script.len(), scenario.script.len());
    }

    #[test]
    fn test_scenario_parse_error_reports_path() {
        let error = Scenario::from_ron("bad.ron", "(not valid").unwrap_err();
        assert!(error.to_string().contains("bad.ron"));
    }
}
