//! The per-unit command state machine.
//!
//! A [`UnitController`] turns one accepted [`Command`] into a sequence of
//! primitive per-tick actions and reports every semantic state transition
//! as an explicit `StateChanged` command, so all observers - including
//! remote replicas - see identical transitions.
//!
//! Controller variants (actor, bomb, spawner) are not a class hierarchy:
//! one state-machine engine is parameterized by a small [`Capabilities`]
//! table.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::command::{Command, CommandKind, CommandStatus};
use crate::coord::{Coordinate, Direction};
use crate::pathfinder::{PathFinder, SearchResult};
use crate::world::{PlayerId, VisionEvent, VoxelId, VoxelKind, VoxelRecord, WorldOracle};

/// Consecutive blocked step attempts tolerated before a move hard-fails.
/// Transient occupancy by another unit usually clears within a tick or
/// two; waiting is cheaper than replanning.
pub const MOVE_RETRY_LIMIT: u32 = 3;

/// Minimum health required to issue a two-way split.
pub const SPLIT_MIN_HEALTH: u32 = 64;

/// Minimum health required to issue a four-way split.
pub const SPLIT4_MIN_HEALTH: u32 = 4;

/// Damage dealt to each adjacent voxel by an explosion.
pub const EXPLODE_DAMAGE: u32 = 32;

/// Lifecycle state of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum UnitState {
    /// Accepting commands.
    #[default]
    Idle,
    /// Draining a queue of rotate/step primitives.
    Moving,
    /// Executing a fixed-duration action (grow, convert, split, ...).
    Busy,
    /// A path request is outstanding.
    SearchingPath,
    /// The unit is destroyed or left the match.
    Terminated,
}

/// What a controller variant is allowed to do.
///
/// This table replaces the actor/bomb/spawner controller hierarchy: the
/// same state machine runs every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// May execute move/rotate commands.
    pub can_move: bool,
    /// May split (two-way and four-way).
    pub can_split: bool,
    /// May grow and diminish between weight levels.
    pub can_grow: bool,
    /// May convert other voxels.
    pub can_convert: bool,
    /// May explode.
    pub can_explode: bool,
}

impl Capabilities {
    /// A standard actor: moves, splits, grows, converts.
    #[must_use]
    pub const fn actor() -> Self {
        Self {
            can_move: true,
            can_split: true,
            can_grow: true,
            can_convert: true,
            can_explode: false,
        }
    }

    /// A bomb: moves and explodes, nothing else.
    #[must_use]
    pub const fn bomb() -> Self {
        Self {
            can_move: true,
            can_split: false,
            can_grow: false,
            can_convert: false,
            can_explode: true,
        }
    }

    /// A spawner emplacement: splits in place but never moves.
    #[must_use]
    pub const fn spawner() -> Self {
        Self {
            can_move: false,
            can_split: true,
            can_grow: true,
            can_convert: false,
            can_explode: false,
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::actor()
    }
}

/// An ownership transfer the match engine must apply: rebuild the
/// controller for `voxel` under `new_owner` (or drop it for `None`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlChange {
    /// The voxel whose classification changed.
    pub voxel: VoxelId,
    /// The new owning player, or `None` for an ownerless asset.
    pub new_owner: Option<PlayerId>,
}

/// One queued primitive action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum Primitive {
    /// Step onto an adjacent cell.
    Step(Coordinate),
    /// Turn a quarter turn.
    Rotate {
        clockwise: bool,
    },
}

/// A fixed-duration action resolving when the cooldown expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum BusyAction {
    Split,
    Split4,
    Grow,
    Diminish,
    Convert(VoxelId),
    SetHealth(u32),
    Explode,
}

/// Everything a controller produced during one tick, drained by the
/// owning player controller. The buffers are cleared at the start of each
/// tick's processing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickOutput {
    /// Commands to include in this tick's delta (completions and
    /// state transitions).
    pub commands: Vec<Command>,
    /// Voxels created this tick (spawned siblings, walls, ...).
    pub created: Vec<VoxelRecord>,
    /// Voxels eaten or destroyed this tick.
    pub consumed: Vec<VoxelId>,
    /// Fog-of-war bookkeeping: matched ignore/observe pairs.
    pub vision: Vec<VisionEvent>,
    /// Ownership transfers for the engine to apply.
    pub control_changes: Vec<ControlChange>,
}

impl TickOutput {
    /// Whether the tick produced nothing at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
            && self.created.is_empty()
            && self.consumed.is_empty()
            && self.vision.is_empty()
            && self.control_changes.is_empty()
    }
}

/// The state machine driving one unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitController {
    id: VoxelId,
    player: PlayerId,
    caps: Capabilities,
    state: UnitState,
    facing: Direction,
    primitives: VecDeque<Primitive>,
    /// Ticks before the next primitive or busy resolution.
    cooldown: u32,
    /// Ticks per step for the active move.
    step_duration: u32,
    /// Consecutive blocked step attempts on the active move.
    retries: u32,
    busy: Option<BusyAction>,
    /// The command currently executing. Emitted once, with its terminal
    /// status, when it resolves.
    active: Option<Command>,
    /// The caller-supplied path awaiting a search result to splice onto.
    pending_path: Option<Vec<Coordinate>>,
    /// Output buffers for the in-progress tick.
    #[serde(skip)]
    output: TickOutput,
}

impl UnitController {
    /// Create a controller for a unit voxel.
    #[must_use]
    pub fn new(id: VoxelId, player: PlayerId, caps: Capabilities) -> Self {
        Self {
            id,
            player,
            caps,
            state: UnitState::Idle,
            facing: Direction::North,
            primitives: VecDeque::new(),
            cooldown: 0,
            step_duration: 0,
            retries: 0,
            busy: None,
            active: None,
            pending_path: None,
            output: TickOutput::default(),
        }
    }

    /// The controlled voxel.
    #[must_use]
    pub const fn id(&self) -> VoxelId {
        self.id
    }

    /// The owning player.
    #[must_use]
    pub const fn player(&self) -> PlayerId {
        self.player
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> UnitState {
        self.state
    }

    /// Current facing.
    #[must_use]
    pub const fn facing(&self) -> Direction {
        self.facing
    }

    /// Whether the controller reached its terminal state.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.state == UnitState::Terminated
    }

    /// Accept a command.
    ///
    /// Rejected with [`CommandStatus::InvalidOperation`] unless the unit
    /// is idle; `Cancel` and `LeaveRoom` are accepted from any state.
    /// Accepting flushes any residual primitive queue and leaves the idle
    /// state within this call.
    pub fn set_command<W: WorldOracle>(
        &mut self,
        world: &mut W,
        pathfinder: &mut PathFinder,
        command: Command,
    ) -> CommandStatus {
        if self.state == UnitState::Terminated {
            return CommandStatus::NoUnit;
        }
        if command.is_control() {
            return self.accept_control(pathfinder, command);
        }
        if self.state != UnitState::Idle {
            return CommandStatus::InvalidOperation;
        }

        self.primitives.clear();
        self.retries = 0;

        let status = match command.kind.clone() {
            CommandKind::Move { path } => self.accept_move(world, pathfinder, &command, path),
            CommandKind::RotateLeft => self.accept_rotate(&command, false),
            CommandKind::RotateRight => self.accept_rotate(&command, true),
            CommandKind::Split => self.accept_busy(world, &command, BusyAction::Split),
            CommandKind::Split4 => self.accept_busy(world, &command, BusyAction::Split4),
            CommandKind::Grow => self.accept_busy(world, &command, BusyAction::Grow),
            CommandKind::Diminish => self.accept_busy(world, &command, BusyAction::Diminish),
            CommandKind::Convert { target } => {
                self.accept_busy(world, &command, BusyAction::Convert(target))
            }
            CommandKind::SetHealth { health } => {
                self.accept_busy(world, &command, BusyAction::SetHealth(health))
            }
            CommandKind::Explode => self.accept_busy(world, &command, BusyAction::Explode),
            CommandKind::Nop => {
                let mut done = command.clone();
                done.status = CommandStatus::Success;
                self.output.commands.push(done);
                CommandStatus::Success
            }
            // Synthesized outputs are never valid inputs.
            CommandKind::StateChanged { .. } | CommandKind::Composite { .. } => {
                CommandStatus::InvalidArguments
            }
            CommandKind::Cancel | CommandKind::LeaveRoom => unreachable!("handled above"),
        };
        if status.is_failure() {
            let mut failed = command;
            failed.status = status;
            self.output.commands.push(failed);
        }
        status
    }

    /// Advance the unit one tick.
    ///
    /// Honors the cooldown counter, executes at most one primitive, and
    /// detects externally forced transitions (death by another unit's
    /// explosion, collapse of the cell under it).
    pub fn tick<W: WorldOracle>(&mut self, world: &mut W, pathfinder: &mut PathFinder) -> TickOutput {
        // External death check: the voxel vanished or was drained to zero
        // outside this controller.
        if self.state != UnitState::Terminated {
            let alive = world.record(self.id).is_some_and(|r| r.health > 0);
            if !alive {
                if world.record(self.id).is_some() {
                    world.remove_voxel(self.id);
                    self.output.consumed.push(self.id);
                }
                pathfinder.terminate(self.id);
                self.fail_active(CommandStatus::NoUnit);
                self.transition(UnitState::Terminated);
                return self.take_output();
            }
        }

        if self.cooldown > 0 {
            self.cooldown -= 1;
            return self.take_output();
        }

        match self.state {
            UnitState::Busy => self.resolve_busy(world),
            UnitState::Moving => self.step_move(world),
            UnitState::Idle | UnitState::SearchingPath | UnitState::Terminated => {}
        }

        self.take_output()
    }

    /// Feed a delivered path search result back into the state machine.
    pub fn path_completed<W: WorldOracle>(&mut self, world: &W, result: SearchResult) {
        if self.state != UnitState::SearchingPath {
            // Stale delivery after a cancel; nothing is waiting for it.
            return;
        }
        let requested = self.pending_path.take().unwrap_or_default();
        match result {
            SearchResult::Found { path } | SearchResult::FoundTarget { path, .. } => {
                // Splice the searched prefix onto the caller's suffix by
                // exact coordinate match.
                let splice = requested.first().copied();
                if splice != path.last().copied() {
                    self.fail_active(CommandStatus::NotFound);
                    self.transition(UnitState::Idle);
                    return;
                }
                let merged: Vec<Coordinate> = path
                    .iter()
                    .copied()
                    .chain(requested.into_iter().skip(1))
                    .collect();
                // The first entry is the current cell; steps begin after it.
                for target in merged.into_iter().skip(1) {
                    self.primitives.push_back(Primitive::Step(target));
                }
                if self.primitives.is_empty() {
                    self.complete_active(CommandStatus::Success, UnitState::Idle);
                } else {
                    self.transition(UnitState::Moving);
                }
            }
            SearchResult::Terminated => {
                self.fail_active(CommandStatus::NotFound);
                self.transition(UnitState::Idle);
            }
        }
    }

    /// Drain the output buffers.
    ///
    /// [`tick`](Self::tick) drains implicitly; commands emitted during
    /// [`set_command`](Self::set_command) stay buffered until the next
    /// drain so acceptance transitions travel in the same tick delta.
    pub fn take_output(&mut self) -> TickOutput {
        std::mem::take(&mut self.output)
    }

    // ------------------------------------------------------------------
    // Command acceptance
    // ------------------------------------------------------------------

    fn accept_control(&mut self, pathfinder: &mut PathFinder, command: Command) -> CommandStatus {
        // Cancel and LeaveRoom both abort whatever is in flight.
        pathfinder.terminate(self.id);
        self.primitives.clear();
        self.busy = None;
        self.pending_path = None;
        self.cooldown = 0;
        self.retries = 0;
        self.fail_active(CommandStatus::InvalidOperation);

        match command.kind {
            CommandKind::Cancel => {
                let mut done = command;
                done.status = CommandStatus::Success;
                self.output.commands.push(done);
                if self.state != UnitState::Idle {
                    self.transition(UnitState::Idle);
                }
            }
            CommandKind::LeaveRoom => {
                self.output.control_changes.push(ControlChange {
                    voxel: self.id,
                    new_owner: None,
                });
                let mut done = command;
                done.status = CommandStatus::Success;
                self.emit_composite(done, UnitState::Terminated);
            }
            _ => unreachable!("is_control covers exactly these"),
        }
        CommandStatus::Success
    }

    fn accept_move<W: WorldOracle>(
        &mut self,
        world: &W,
        pathfinder: &mut PathFinder,
        command: &Command,
        path: Vec<Coordinate>,
    ) -> CommandStatus {
        if !self.caps.can_move {
            return CommandStatus::InvalidOperation;
        }
        if path.is_empty() {
            return CommandStatus::InvalidArguments;
        }
        let Some(record) = world.record(self.id) else {
            return CommandStatus::NoUnit;
        };
        let current = record.coord;
        if path.iter().any(|c| c.weight != current.weight) {
            return CommandStatus::InvalidArguments;
        }

        self.step_duration = command.duration;
        self.active = Some(command.clone());

        if let Some(start) = Self::walkable_from(&path, current) {
            for target in path.into_iter().skip(start + 1) {
                self.primitives.push_back(Primitive::Step(target));
            }
            if self.primitives.is_empty() {
                // Already standing on the only cell of the path.
                self.complete_active(CommandStatus::Success, UnitState::Idle);
            } else {
                self.transition(UnitState::Moving);
            }
        } else {
            // The path does not include our cell: search for a prefix
            // reaching its first coordinate, splice on delivery.
            pathfinder.submit(world, self.id, current, path[0]);
            self.pending_path = Some(path);
            self.transition(UnitState::SearchingPath);
        }
        CommandStatus::Success
    }

    /// Index of the unit's current cell within `path`, if the path is a
    /// unit-step-connected sequence from that cell onward.
    fn walkable_from(path: &[Coordinate], current: Coordinate) -> Option<usize> {
        let start = path.iter().position(|c| c.same_cell(current))?;
        let connected = path[start..].windows(2).all(|w| w[0].is_adjacent(w[1]));
        connected.then_some(start)
    }

    fn accept_rotate(&mut self, command: &Command, clockwise: bool) -> CommandStatus {
        if !self.caps.can_move {
            return CommandStatus::InvalidOperation;
        }
        self.active = Some(command.clone());
        self.cooldown = command.duration;
        self.primitives.push_back(Primitive::Rotate { clockwise });
        self.transition(UnitState::Moving);
        CommandStatus::Success
    }

    fn accept_busy<W: WorldOracle>(
        &mut self,
        world: &W,
        command: &Command,
        action: BusyAction,
    ) -> CommandStatus {
        let permitted = match action {
            BusyAction::Split | BusyAction::Split4 => self.caps.can_split,
            BusyAction::Grow | BusyAction::Diminish => self.caps.can_grow,
            BusyAction::Convert(_) => self.caps.can_convert,
            BusyAction::Explode => self.caps.can_explode,
            BusyAction::SetHealth(_) => true,
        };
        if !permitted {
            return CommandStatus::InvalidOperation;
        }
        let Some(record) = world.record(self.id) else {
            return CommandStatus::NoUnit;
        };
        match action {
            BusyAction::Split if record.health < SPLIT_MIN_HEALTH => {
                return CommandStatus::InvalidOperation;
            }
            BusyAction::Split4 if record.health < SPLIT4_MIN_HEALTH => {
                return CommandStatus::InvalidOperation;
            }
            BusyAction::Split4 | BusyAction::Diminish if record.coord.weight == 0 => {
                return CommandStatus::InvalidArguments;
            }
            _ => {}
        }

        self.active = Some(command.clone());
        self.busy = Some(action);
        self.cooldown = command.duration;
        self.transition(UnitState::Busy);
        CommandStatus::Success
    }

    // ------------------------------------------------------------------
    // Primitive execution
    // ------------------------------------------------------------------

    fn step_move<W: WorldOracle>(&mut self, world: &mut W) {
        let Some(primitive) = self.primitives.front().cloned() else {
            self.complete_active(CommandStatus::Success, UnitState::Idle);
            return;
        };
        match primitive {
            Primitive::Rotate { clockwise } => {
                self.primitives.pop_front();
                self.facing = if clockwise {
                    self.facing.rotated_right()
                } else {
                    self.facing.rotated_left()
                };
                if self.primitives.is_empty() {
                    self.complete_active(CommandStatus::Success, UnitState::Idle);
                }
            }
            Primitive::Step(target) => {
                let Some(record) = world.record(self.id) else {
                    return;
                };
                let from = record.coord;
                if !world.can_move(self.id, from, target) {
                    // Transient occupancy: wait a few ticks before giving up.
                    self.retries += 1;
                    if self.retries > MOVE_RETRY_LIMIT {
                        self.primitives.clear();
                        self.fail_active(CommandStatus::InvalidOperation);
                        self.transition(UnitState::Idle);
                    }
                    return;
                }
                self.primitives.pop_front();
                self.retries = 0;
                if let Some(direction) = Direction::between(from, target) {
                    self.facing = direction;
                }
                // Stepping onto a consumable asset eats it.
                if let Some(occupant) = world.voxel_at(target) {
                    if occupant != self.id {
                        world.remove_voxel(occupant);
                        self.output.consumed.push(occupant);
                    }
                }
                world.move_voxel(self.id, target);
                self.output.vision.push(VisionEvent::Ignore(from));
                self.output.vision.push(VisionEvent::Observe(target));
                self.cooldown = self.step_duration;
                if self.primitives.is_empty() {
                    self.complete_active(CommandStatus::Success, UnitState::Idle);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Busy action resolution
    // ------------------------------------------------------------------

    fn resolve_busy<W: WorldOracle>(&mut self, world: &mut W) {
        let Some(action) = self.busy.take() else {
            self.transition(UnitState::Idle);
            return;
        };
        match action {
            BusyAction::Split => self.resolve_split(world),
            BusyAction::Split4 => self.resolve_split4(world),
            BusyAction::Grow => self.resolve_rescale(world, true),
            BusyAction::Diminish => self.resolve_rescale(world, false),
            BusyAction::Convert(target) => self.resolve_convert(world, target),
            BusyAction::SetHealth(health) => self.resolve_set_health(world, health),
            BusyAction::Explode => self.resolve_explode(world),
        }
    }

    fn resolve_split<W: WorldOracle>(&mut self, world: &mut W) {
        let Some(record) = world.record(self.id).copied() else {
            self.fail_active(CommandStatus::NoUnit);
            self.transition(UnitState::Terminated);
            return;
        };
        let neighbor = Direction::SCAN_ORDER
            .iter()
            .map(|&d| record.coord.step(d))
            .find(|&c| world.is_valid_and_empty(self.id, c));
        let Some(neighbor) = neighbor else {
            self.fail_active(CommandStatus::InvalidOperation);
            self.transition(UnitState::Idle);
            return;
        };

        let half = record.health / 2;
        world.remove_voxel(self.id);
        self.output.consumed.push(self.id);
        for coord in [record.coord, neighbor] {
            let mut sibling = VoxelRecord::new(coord, VoxelKind::Unit, half).owned_by(self.player);
            sibling.id = world.create_voxel(sibling);
            self.output.created.push(sibling);
        }
        self.complete_active(CommandStatus::Success, UnitState::Terminated);
    }

    fn resolve_split4<W: WorldOracle>(&mut self, world: &mut W) {
        let Some(record) = world.record(self.id).copied() else {
            self.fail_active(CommandStatus::NoUnit);
            self.transition(UnitState::Terminated);
            return;
        };
        let quarter = record.health / 4;
        let corner = record.coord.to_weight(record.coord.weight - 1);
        world.remove_voxel(self.id);
        self.output.consumed.push(self.id);
        for (dr, dc) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
            let coord = Coordinate {
                row: corner.row + dr,
                col: corner.col + dc,
                ..corner
            };
            let mut child = VoxelRecord::new(coord, VoxelKind::Unit, quarter).owned_by(self.player);
            child.id = world.create_voxel(child);
            self.output.created.push(child);
        }
        self.complete_active(CommandStatus::Success, UnitState::Terminated);
    }

    fn resolve_rescale<W: WorldOracle>(&mut self, world: &mut W, grow: bool) {
        let Some(record) = world.record(self.id).copied() else {
            self.fail_active(CommandStatus::NoUnit);
            self.transition(UnitState::Terminated);
            return;
        };
        let coord = record.coord;
        let target = if grow {
            let (rows, cols) = world.dimensions(coord.weight + 1);
            if rows == 0 || cols == 0 {
                self.fail_active(CommandStatus::InvalidArguments);
                self.transition(UnitState::Idle);
                return;
            }
            coord.to_weight(coord.weight + 1)
        } else {
            coord.to_weight(coord.weight - 1)
        };
        if grow && !world.is_valid_and_empty(self.id, target) {
            self.fail_active(CommandStatus::InvalidOperation);
            self.transition(UnitState::Idle);
            return;
        }
        world.move_voxel(self.id, target);
        self.output.vision.push(VisionEvent::Ignore(coord));
        self.output.vision.push(VisionEvent::Observe(target));
        self.complete_active(CommandStatus::Success, UnitState::Idle);
    }

    fn resolve_convert<W: WorldOracle>(&mut self, world: &mut W, target: VoxelId) {
        if world.record(target).is_none() {
            self.fail_active(CommandStatus::NoUnit);
            self.transition(UnitState::Idle);
            return;
        }
        world.set_owner(target, Some(self.player), VoxelKind::Unit);
        self.output.control_changes.push(ControlChange {
            voxel: target,
            new_owner: Some(self.player),
        });
        self.complete_active(CommandStatus::Success, UnitState::Idle);
    }

    fn resolve_set_health<W: WorldOracle>(&mut self, world: &mut W, health: u32) {
        world.set_health(self.id, health);
        if health == 0 {
            world.remove_voxel(self.id);
            self.output.consumed.push(self.id);
            self.complete_active(CommandStatus::Success, UnitState::Terminated);
        } else {
            self.complete_active(CommandStatus::Success, UnitState::Idle);
        }
    }

    fn resolve_explode<W: WorldOracle>(&mut self, world: &mut W) {
        let Some(record) = world.record(self.id).copied() else {
            self.fail_active(CommandStatus::NoUnit);
            self.transition(UnitState::Terminated);
            return;
        };
        for direction in Direction::SCAN_ORDER {
            let cell = record.coord.step(direction);
            let Some(victim) = world.voxel_at(cell) else {
                continue;
            };
            let health = world.record(victim).map_or(0, |r| r.health);
            let remaining = health.saturating_sub(EXPLODE_DAMAGE);
            if remaining == 0 {
                world.remove_voxel(victim);
                self.output.consumed.push(victim);
            } else {
                world.set_health(victim, remaining);
            }
        }
        world.remove_voxel(self.id);
        self.output.consumed.push(self.id);
        self.complete_active(CommandStatus::Success, UnitState::Terminated);
    }

    // ------------------------------------------------------------------
    // Transition and emission plumbing
    // ------------------------------------------------------------------

    /// Record a state transition and emit it as a `StateChanged` command.
    fn transition(&mut self, state: UnitState) {
        if self.state == state {
            return;
        }
        self.state = state;
        self.output
            .commands
            .push(Command::new(self.id, CommandKind::StateChanged { state }));
    }

    /// Resolve the active command with `status` and transition, emitting
    /// the command and the transition atomically as one `Composite`.
    fn complete_active(&mut self, status: CommandStatus, next: UnitState) {
        if let Some(mut command) = self.active.take() {
            command.status = status;
            self.emit_composite(command, next);
        } else {
            self.transition(next);
        }
    }

    /// Stamp the active command as failed and emit it, without changing
    /// state (callers transition explicitly).
    fn fail_active(&mut self, status: CommandStatus) {
        if let Some(mut command) = self.active.take() {
            command.status = status;
            self.output.commands.push(command);
        }
        self.pending_path = None;
        self.busy = None;
    }

    /// Emit `command` and the transition to `next` wrapped in a single
    /// `Composite`, so the transition replicates atomically with its cause.
    fn emit_composite(&mut self, command: Command, next: UnitState) {
        let changed = self.state != next;
        self.state = next;
        let mut parts = vec![command];
        if changed {
            let mut state_changed =
                Command::new(self.id, CommandKind::StateChanged { state: next });
            state_changed.status = CommandStatus::Success;
            parts.push(state_changed);
        }
        if parts.len() == 1 {
            self.output.commands.push(parts.pop().expect("one part"));
        } else {
            let mut composite = Command::new(self.id, CommandKind::Composite { commands: parts });
            composite.status = CommandStatus::Success;
            self.output.commands.push(composite);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vox_test_utils::fixtures::{spawn_blocker, spawn_unit, GridWorld};

    fn coord(row: i32, col: i32) -> Coordinate {
        Coordinate::new(row, col, 0, 0)
    }

    fn setup() -> (GridWorld, PathFinder, VoxelId, UnitController) {
        let mut world = GridWorld::new(16, 16);
        let id = spawn_unit(&mut world, 0, coord(8, 8), 100);
        let controller = UnitController::new(id, 0, Capabilities::actor());
        (world, PathFinder::default(), id, controller)
    }

    fn move_command(unit: VoxelId, path: Vec<Coordinate>) -> Command {
        Command::new(unit, CommandKind::Move { path })
    }

    /// Collect the state transitions a tick output carries, unwrapping
    /// composites.
    fn transitions(output: &TickOutput) -> Vec<UnitState> {
        fn walk(command: &Command, out: &mut Vec<UnitState>) {
            match &command.kind {
                CommandKind::StateChanged { state } => out.push(*state),
                CommandKind::Composite { commands } => {
                    for c in commands {
                        walk(c, out);
                    }
                }
                _ => {}
            }
        }
        let mut out = Vec::new();
        for command in &output.commands {
            walk(command, &mut out);
        }
        out
    }

    #[test]
    fn test_reject_command_while_not_idle() {
        let (mut world, mut finder, id, mut controller) = setup();
        let path = vec![coord(8, 8), coord(8, 9), coord(8, 10)];
        assert_eq!(
            controller.set_command(&mut world, &mut finder, move_command(id, path)),
            CommandStatus::Success
        );
        assert_eq!(controller.state(), UnitState::Moving);

        // A second command while moving is rejected.
        assert_eq!(
            controller.set_command(&mut world, &mut finder, Command::new(id, CommandKind::Grow)),
            CommandStatus::InvalidOperation
        );
        assert_eq!(controller.state(), UnitState::Moving);
    }

    #[test]
    fn test_cancel_is_valid_from_any_state() {
        let (mut world, mut finder, id, mut controller) = setup();
        let path = vec![coord(8, 8), coord(8, 9), coord(8, 10)];
        controller.set_command(&mut world, &mut finder, move_command(id, path));
        assert_eq!(controller.state(), UnitState::Moving);

        assert_eq!(
            controller.set_command(&mut world, &mut finder, Command::new(id, CommandKind::Cancel)),
            CommandStatus::Success
        );
        assert_eq!(controller.state(), UnitState::Idle);
        // The cancellation itself was acknowledged...
        let output = controller.take_output();
        assert!(output
            .commands
            .iter()
            .any(|c| matches!(c.kind, CommandKind::Cancel)
                && c.status == CommandStatus::Success));

        // ...and the unit stays put afterwards: primitives were discarded.
        let output = controller.tick(&mut world, &mut finder);
        assert!(output.commands.is_empty());
        assert_eq!(world.record(id).unwrap().coord, coord(8, 8));
    }

    #[test]
    fn test_move_walks_path_and_completes() {
        let (mut world, mut finder, id, mut controller) = setup();
        let path = vec![coord(8, 8), coord(8, 9), coord(8, 10)];
        controller.set_command(&mut world, &mut finder, move_command(id, path));

        let output = controller.tick(&mut world, &mut finder);
        assert_eq!(world.record(id).unwrap().coord, coord(8, 9));
        // Matched ignore/observe pair per step.
        assert_eq!(
            output.vision,
            vec![
                VisionEvent::Ignore(coord(8, 8)),
                VisionEvent::Observe(coord(8, 9))
            ]
        );

        let output = controller.tick(&mut world, &mut finder);
        assert_eq!(world.record(id).unwrap().coord, coord(8, 10));
        assert_eq!(controller.state(), UnitState::Idle);
        assert_eq!(transitions(&output), vec![UnitState::Idle]);
    }

    #[test]
    fn test_move_respects_step_duration() {
        let (mut world, mut finder, id, mut controller) = setup();
        let path = vec![coord(8, 8), coord(8, 9), coord(8, 10)];
        controller.set_command(&mut world, &mut finder, move_command(id, path).with_duration(2));

        controller.tick(&mut world, &mut finder); // step 1
        assert_eq!(world.record(id).unwrap().coord, coord(8, 9));
        controller.tick(&mut world, &mut finder); // cooldown
        controller.tick(&mut world, &mut finder); // cooldown
        assert_eq!(world.record(id).unwrap().coord, coord(8, 9));
        controller.tick(&mut world, &mut finder); // step 2
        assert_eq!(world.record(id).unwrap().coord, coord(8, 10));
    }

    #[test]
    fn test_blocked_move_retries_then_fails() {
        let (mut world, mut finder, id, mut controller) = setup();
        spawn_blocker(&mut world, coord(8, 9));
        let path = vec![coord(8, 8), coord(8, 9)];
        controller.set_command(&mut world, &mut finder, move_command(id, path));
        controller.take_output(); // discard the acceptance transition

        // Three consecutive blocked ticks are tolerated silently.
        for _ in 0..3 {
            let output = controller.tick(&mut world, &mut finder);
            assert!(output.commands.is_empty());
            assert_eq!(controller.state(), UnitState::Moving);
        }
        // The fourth fails the move.
        let output = controller.tick(&mut world, &mut finder);
        assert_eq!(controller.state(), UnitState::Idle);
        let failed = output
            .commands
            .iter()
            .find(|c| matches!(c.kind, CommandKind::Move { .. }))
            .expect("failed move emitted");
        assert_eq!(failed.status, CommandStatus::InvalidOperation);
    }

    #[test]
    fn test_blocked_move_recovers_when_cell_frees_up() {
        let (mut world, mut finder, id, mut controller) = setup();
        let blocker = spawn_blocker(&mut world, coord(8, 9));
        let path = vec![coord(8, 8), coord(8, 9)];
        controller.set_command(&mut world, &mut finder, move_command(id, path));

        controller.tick(&mut world, &mut finder);
        controller.tick(&mut world, &mut finder);
        world.remove_voxel(blocker);
        controller.tick(&mut world, &mut finder);
        assert_eq!(world.record(id).unwrap().coord, coord(8, 9));
        assert_eq!(controller.state(), UnitState::Idle);
    }

    #[test]
    fn test_disconnected_path_triggers_search_and_splice() {
        let (mut world, mut finder, id, mut controller) = setup();
        // Path starting away from the unit: (8,11) -> (8,12).
        let path = vec![coord(8, 11), coord(8, 12)];
        controller.set_command(&mut world, &mut finder, move_command(id, path));
        assert_eq!(controller.state(), UnitState::SearchingPath);

        // Drive the search to completion and deliver it.
        for _ in 0..8 {
            finder.update(&world);
        }
        for completion in finder.tick() {
            assert_eq!(completion.unit, id);
            controller.path_completed(&world, completion.result);
        }
        assert_eq!(controller.state(), UnitState::Moving);

        // Walk it out: 3 searched steps + 1 suffix step.
        for _ in 0..8 {
            controller.tick(&mut world, &mut finder);
        }
        assert_eq!(world.record(id).unwrap().coord, coord(8, 12));
        assert_eq!(controller.state(), UnitState::Idle);
    }

    #[test]
    fn test_unreachable_splice_fails_not_found() {
        let (mut world, mut finder, id, mut controller) = setup();
        // Box the target cell in so the search falls back short of it.
        for c in [coord(2, 1), coord(1, 2), coord(3, 2), coord(2, 3)] {
            spawn_blocker(&mut world, c);
        }
        let path = vec![coord(2, 2), coord(2, 3)];
        controller.set_command(&mut world, &mut finder, move_command(id, path));
        assert_eq!(controller.state(), UnitState::SearchingPath);

        for _ in 0..64 {
            finder.update(&world);
        }
        let mut delivered = false;
        for completion in finder.tick() {
            controller.path_completed(&world, completion.result);
            delivered = true;
        }
        assert!(delivered);
        assert_eq!(controller.state(), UnitState::Idle);
    }

    #[test]
    fn test_split_produces_two_adjacent_siblings() {
        let mut world = GridWorld::new(16, 16);
        let id = spawn_unit(&mut world, 0, Coordinate::new(3, 3, 0, 2), 100);
        let mut finder = PathFinder::default();
        let mut controller = UnitController::new(id, 0, Capabilities::actor());

        assert_eq!(
            controller.set_command(&mut world, &mut finder, Command::new(id, CommandKind::Split)),
            CommandStatus::Success
        );
        assert_eq!(controller.state(), UnitState::Busy);

        let output = controller.tick(&mut world, &mut finder);
        assert_eq!(output.created.len(), 2);
        let a = output.created[0];
        let b = output.created[1];
        assert_eq!(a.coord.weight, 2);
        assert_eq!(b.coord.weight, 2);
        assert_eq!(a.coord.distance_squared(b.coord), 1);
        assert_eq!(a.health, 50);
        // The original is gone, the same tick.
        assert!(world.record(id).is_none());
        assert!(output.consumed.contains(&id));
        assert!(controller.is_terminated());
    }

    #[test]
    fn test_split_requires_minimum_health() {
        let (mut world, mut finder, id, mut controller) = setup();
        world.set_health(id, SPLIT_MIN_HEALTH - 1);
        assert_eq!(
            controller.set_command(&mut world, &mut finder, Command::new(id, CommandKind::Split)),
            CommandStatus::InvalidOperation
        );
        assert_eq!(controller.state(), UnitState::Idle);
    }

    #[test]
    fn test_split4_quarters_into_finer_cells() {
        let mut world = GridWorld::new(16, 16);
        let id = spawn_unit(&mut world, 0, Coordinate::new(2, 2, 0, 1), 80);
        let mut finder = PathFinder::default();
        let mut controller = UnitController::new(id, 0, Capabilities::actor());

        controller.set_command(&mut world, &mut finder, Command::new(id, CommandKind::Split4));
        let output = controller.tick(&mut world, &mut finder);
        assert_eq!(output.created.len(), 4);
        for child in &output.created {
            assert_eq!(child.coord.weight, 0);
            assert_eq!(child.health, 20);
            assert!(child.coord.same_cell(Coordinate::new(2, 2, 0, 1)));
        }
        assert!(world.record(id).is_none());
    }

    #[test]
    fn test_grow_requires_free_coarse_cell() {
        let mut world = GridWorld::new(16, 16);
        let id = spawn_unit(&mut world, 0, coord(4, 4), 100);
        // A sibling inside the same weight-1 cell blocks growth.
        spawn_blocker(&mut world, coord(4, 5));
        let mut finder = PathFinder::default();
        let mut controller = UnitController::new(id, 0, Capabilities::actor());

        controller.set_command(&mut world, &mut finder, Command::new(id, CommandKind::Grow));
        let output = controller.tick(&mut world, &mut finder);
        let grow = output
            .commands
            .iter()
            .find(|c| matches!(c.kind, CommandKind::Grow))
            .expect("grow command emitted");
        assert_eq!(grow.status, CommandStatus::InvalidOperation);
        assert_eq!(world.record(id).unwrap().coord.weight, 0);
    }

    #[test]
    fn test_grow_then_diminish_roundtrip() {
        let mut world = GridWorld::new(16, 16);
        let id = spawn_unit(&mut world, 0, coord(4, 4), 100);
        let mut finder = PathFinder::default();
        let mut controller = UnitController::new(id, 0, Capabilities::actor());

        controller.set_command(&mut world, &mut finder, Command::new(id, CommandKind::Grow));
        controller.tick(&mut world, &mut finder);
        assert_eq!(world.record(id).unwrap().coord, Coordinate::new(2, 2, 0, 1));

        controller.set_command(&mut world, &mut finder, Command::new(id, CommandKind::Diminish));
        controller.tick(&mut world, &mut finder);
        assert_eq!(world.record(id).unwrap().coord, coord(4, 4));
    }

    #[test]
    fn test_busy_duration_delays_resolution() {
        let (mut world, mut finder, id, mut controller) = setup();
        controller.set_command(
            &mut world,
            &mut finder,
            Command::new(id, CommandKind::Grow).with_duration(3),
        );
        controller.take_output(); // discard the acceptance transition
        for _ in 0..3 {
            let output = controller.tick(&mut world, &mut finder);
            assert!(output.commands.is_empty());
            assert_eq!(controller.state(), UnitState::Busy);
        }
        controller.tick(&mut world, &mut finder);
        assert_eq!(controller.state(), UnitState::Idle);
        assert_eq!(world.record(id).unwrap().coord.weight, 1);
    }

    #[test]
    fn test_explode_damages_neighbors() {
        let mut world = GridWorld::new(16, 16);
        let bomb = spawn_unit(&mut world, 0, coord(8, 8), 10);
        let weak = spawn_unit(&mut world, 1, coord(7, 8), EXPLODE_DAMAGE / 2);
        let tough = spawn_unit(&mut world, 1, coord(9, 8), 100);
        let mut finder = PathFinder::default();
        let mut controller = UnitController::new(bomb, 0, Capabilities::bomb());

        controller.set_command(&mut world, &mut finder, Command::new(bomb, CommandKind::Explode));
        let output = controller.tick(&mut world, &mut finder);

        assert!(world.record(bomb).is_none());
        assert!(world.record(weak).is_none());
        assert_eq!(world.record(tough).unwrap().health, 100 - EXPLODE_DAMAGE);
        assert!(output.consumed.contains(&bomb));
        assert!(output.consumed.contains(&weak));
        assert!(controller.is_terminated());
    }

    #[test]
    fn test_capability_table_gates_commands() {
        let (mut world, mut finder, id, _) = setup();
        let mut bomb = UnitController::new(id, 0, Capabilities::bomb());
        assert_eq!(
            bomb.set_command(&mut world, &mut finder, Command::new(id, CommandKind::Split)),
            CommandStatus::InvalidOperation
        );
        let mut spawner = UnitController::new(id, 0, Capabilities::spawner());
        assert_eq!(
            spawner.set_command(
                &mut world,
                &mut finder,
                move_command(id, vec![coord(8, 8), coord(8, 9)])
            ),
            CommandStatus::InvalidOperation
        );
    }

    #[test]
    fn test_external_death_reports_terminated() {
        let (mut world, mut finder, id, mut controller) = setup();
        world.set_health(id, 0);
        let output = controller.tick(&mut world, &mut finder);
        assert!(controller.is_terminated());
        assert_eq!(transitions(&output), vec![UnitState::Terminated]);
        // Terminal: further commands are rejected.
        assert_eq!(
            controller.set_command(&mut world, &mut finder, Command::new(id, CommandKind::Grow)),
            CommandStatus::NoUnit
        );
    }

    #[test]
    fn test_leave_room_releases_control() {
        let (mut world, mut finder, id, mut controller) = setup();
        let status = controller.set_command(
            &mut world,
            &mut finder,
            Command::new(id, CommandKind::LeaveRoom),
        );
        assert_eq!(status, CommandStatus::Success);
        assert!(controller.is_terminated());
        // The voxel itself survives as an ownerless asset.
        assert!(world.record(id).is_some());
        let output = controller.tick(&mut world, &mut finder);
        let _ = output;
    }

    #[test]
    fn test_eating_an_asset_on_the_path() {
        let mut world = GridWorld::new(16, 16);
        let id = spawn_unit(&mut world, 0, coord(8, 8), 100);
        let food = vox_test_utils::fixtures::spawn_asset(&mut world, coord(8, 9), 5);
        let mut finder = PathFinder::default();
        let mut controller = UnitController::new(id, 0, Capabilities::actor());

        controller.set_command(
            &mut world,
            &mut finder,
            move_command(id, vec![coord(8, 8), coord(8, 9)]),
        );
        let output = controller.tick(&mut world, &mut finder);
        assert_eq!(world.record(id).unwrap().coord, coord(8, 9));
        assert!(world.record(food).is_none());
        assert!(output.consumed.contains(&food));
    }
}
