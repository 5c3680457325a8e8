//! Commands and per-tick command bundles.
//!
//! A [`Command`] is a value object describing one unit action. Commands
//! are immutable after submission except for the terminal [`CommandStatus`]
//! the executor stamps on them. A [`CommandsBundle`] is the per-tick
//! envelope carrying every player's commands; it is both the network wire
//! format and the unit of replay storage.

use serde::{Deserialize, Serialize};

use crate::coord::Coordinate;
use crate::task::{TaskId, TaskState};
use crate::unit::UnitState;
use crate::world::{PlayerId, VoxelId};

/// Logical simulation clock. One tick = one fixed step.
pub type Tick = u64;

/// Ticks per second for the simulation.
pub const TICK_RATE: u32 = 20;

/// Duration of one tick in milliseconds.
pub const TICK_DURATION_MS: u32 = 1000 / TICK_RATE;

/// The action a command describes, with its kind-specific payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    /// Walk a path of unit-step-connected coordinates.
    Move {
        /// The path to follow. Must contain the unit's current cell, or
        /// the controller issues a path search to reach its first cell.
        path: Vec<Coordinate>,
    },
    /// Turn one quarter turn counter-clockwise.
    RotateLeft,
    /// Turn one quarter turn clockwise.
    RotateRight,
    /// Split into two same-weight siblings on adjacent cells.
    Split,
    /// Split into four children one weight level finer.
    Split4,
    /// Expand to the next coarser weight level.
    Grow,
    /// Shrink to the next finer weight level.
    Diminish,
    /// Take ownership of a target voxel.
    Convert {
        /// The voxel to convert.
        target: VoxelId,
    },
    /// Set the unit's health directly.
    SetHealth {
        /// New health value. Zero destroys the unit.
        health: u32,
    },
    /// Destroy self, damaging every adjacent voxel.
    Explode,
    /// A semantic state transition, replicated so every observer sees
    /// identical transitions.
    StateChanged {
        /// The state entered.
        state: UnitState,
    },
    /// An ordered list of commands applied atomically within the tick.
    Composite {
        /// Commands in application order.
        commands: Vec<Command>,
    },
    /// The owning player leaves the match; the voxel becomes a passive
    /// asset. Accepted in any state.
    LeaveRoom,
    /// Abort the active command and return to idle. Accepted in any state.
    Cancel,
    /// No operation.
    Nop,
}

/// Terminal outcome stamped on an executed command.
///
/// `Pending` means the executor has not resolved the command yet. All
/// other variants are terminal. `HighPing` is non-fatal: the command was
/// applied late and the caller should suppress animation but still apply
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CommandStatus {
    /// Not yet resolved.
    #[default]
    Pending,
    /// Completed normally.
    Success,
    /// Command issued while the unit was not idle, or flow-control misuse.
    InvalidOperation,
    /// Malformed payload.
    InvalidArguments,
    /// Path splice or target lookup failed.
    NotFound,
    /// The target unit no longer exists.
    NoUnit,
    /// Executed late; apply state, skip presentation.
    HighPing,
}

impl CommandStatus {
    /// Whether this status is a failure (not success, not pending, and
    /// not the non-fatal lateness marker).
    #[must_use]
    pub const fn is_failure(self) -> bool {
        matches!(
            self,
            Self::InvalidOperation | Self::InvalidArguments | Self::NotFound | Self::NoUnit
        )
    }
}

/// One unit action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// The unit this command targets.
    pub unit: VoxelId,
    /// What to do.
    pub kind: CommandKind,
    /// Duration in ticks. For movement this is ticks per step; for
    /// fixed-duration actions it is the total busy time.
    pub duration: u32,
    /// Terminal status, set by the executor.
    pub status: CommandStatus,
}

impl Command {
    /// Create a command with zero duration and pending status.
    #[must_use]
    pub const fn new(unit: VoxelId, kind: CommandKind) -> Self {
        Self {
            unit,
            kind,
            duration: 0,
            status: CommandStatus::Pending,
        }
    }

    /// Builder-style duration assignment.
    #[must_use]
    pub const fn with_duration(mut self, duration: u32) -> Self {
        self.duration = duration;
        self
    }

    /// Whether this command is accepted regardless of unit state.
    #[must_use]
    pub const fn is_control(&self) -> bool {
        matches!(self.kind, CommandKind::Cancel | CommandKind::LeaveRoom)
    }
}

/// One player's ordered command array within a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlayerCommands {
    /// The issuing player.
    pub player: PlayerId,
    /// Commands in submission order.
    pub commands: Vec<Command>,
}

/// A task lifecycle transition carried alongside the tick's commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStateChange {
    /// The task that transitioned.
    pub task: TaskId,
    /// The state it entered.
    pub state: TaskState,
}

/// Per-tick envelope: every player's commands for one tick.
///
/// Bundles must arrive tick-ordered and gap-free per player stream for
/// deterministic replay.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommandsBundle {
    /// The tick these commands execute on.
    pub tick: Tick,
    /// Per-player command arrays, ordered by player index.
    pub player_commands: Vec<PlayerCommands>,
    /// Task lifecycle transitions that happened this tick.
    pub task_changes: Vec<TaskStateChange>,
    /// Set on the final bundle of a match.
    pub game_completed: bool,
}

impl CommandsBundle {
    /// Create an empty bundle for a tick.
    #[must_use]
    pub fn new(tick: Tick) -> Self {
        Self {
            tick,
            ..Self::default()
        }
    }

    /// Total command count across all players.
    #[must_use]
    pub fn len(&self) -> usize {
        self.player_commands.iter().map(|p| p.commands.len()).sum()
    }

    /// Whether the bundle carries no commands at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0 && self.task_changes.is_empty()
    }

    /// Stamp every command in the bundle with a status. Used by the
    /// scheduler to mark late execution.
    pub fn stamp_status(&mut self, status: CommandStatus) {
        for player in &mut self.player_commands {
            for command in &mut player.commands {
                command.status = status;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_commands() {
        assert!(Command::new(1, CommandKind::Cancel).is_control());
        assert!(Command::new(1, CommandKind::LeaveRoom).is_control());
        assert!(!Command::new(1, CommandKind::Nop).is_control());
        assert!(!Command::new(1, CommandKind::Grow).is_control());
    }

    #[test]
    fn test_bundle_len_counts_all_players() {
        let mut bundle = CommandsBundle::new(7);
        bundle.player_commands.push(PlayerCommands {
            player: 0,
            commands: vec![Command::new(1, CommandKind::Nop)],
        });
        bundle.player_commands.push(PlayerCommands {
            player: 1,
            commands: vec![
                Command::new(2, CommandKind::Grow),
                Command::new(3, CommandKind::Cancel),
            ],
        });
        assert_eq!(bundle.len(), 3);
        assert!(!bundle.is_empty());
    }

    #[test]
    fn test_stamp_status_reaches_every_command() {
        let mut bundle = CommandsBundle::new(0);
        bundle.player_commands.push(PlayerCommands {
            player: 0,
            commands: vec![
                Command::new(1, CommandKind::Nop),
                Command::new(2, CommandKind::Nop),
            ],
        });
        bundle.stamp_status(CommandStatus::HighPing);
        for player in &bundle.player_commands {
            for command in &player.commands {
                assert_eq!(command.status, CommandStatus::HighPing);
            }
        }
    }

    #[test]
    fn test_bundle_roundtrip() {
        let mut bundle = CommandsBundle::new(42);
        bundle.player_commands.push(PlayerCommands {
            player: 0,
            commands: vec![Command::new(
                9,
                CommandKind::Move {
                    path: vec![crate::coord::Coordinate::new(1, 1, 0, 0)],
                },
            )],
        });
        let bytes = bincode::serialize(&bundle).unwrap();
        let restored: CommandsBundle = bincode::deserialize(&bytes).unwrap();
        assert_eq!(bundle, restored);
    }
}
