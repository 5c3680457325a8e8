//! The match engine tick loop.
//!
//! Owns every player controller, the pathfinder and the task engine, and
//! advances them in a fixed order each tick, collecting all per-player
//! command deltas into a single [`CommandsBundle`].
//!
//! # Determinism
//!
//! All operations here are fully deterministic:
//! - Integer arithmetic only
//! - No system randomness
//! - Players advance in player-index order, units in registration order
//! - Same inputs always produce same outputs
//!
//! Cross-player side effects (voxel creation and removal) generated
//! during a player's tick are propagated to every controller before the
//! tick ends, so no player observes a world older or newer than "after
//! this tick's commands".

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::command::{
    Command, CommandKind, CommandStatus, CommandsBundle, PlayerCommands, Tick,
};
use crate::coord::Coordinate;
use crate::error::{Result, SimError};
use crate::expr::{Fetch, QueryContext};
use crate::pathfinder::PathFinder;
use crate::player::PlayerController;
use crate::task::{ClientRequest, ClientResponse, TaskEngine, TaskEvent, TaskId, TaskInfo, TaskState};
use crate::unit::{Capabilities, UnitController};
use crate::world::{PlayerId, VisionEvent, VoxelId, VoxelKind, VoxelRecord, WorldOracle};

/// Answers expression queries from the locally authoritative world.
/// Every fact resolves synchronously here; `Pending` only arises on
/// replicas with partial caches.
struct WorldFacts<'a, W: WorldOracle>(&'a W);

impl<W: WorldOracle> QueryContext for WorldFacts<'_, W> {
    fn unit_coord(&self, unit: VoxelId) -> Fetch<Option<Coordinate>> {
        Fetch::Ready(self.0.record(unit).map(|r| r.coord))
    }

    fn unit_health(&self, unit: VoxelId) -> Fetch<Option<u32>> {
        Fetch::Ready(self.0.record(unit).map(|r| r.health))
    }
}

/// The authoritative match simulation.
///
/// Generic over the world oracle: the engine owns the oracle value but
/// never the grid storage semantics behind it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(serialize = "W: Serialize", deserialize = "W: DeserializeOwned"))]
pub struct MatchEngine<W: WorldOracle> {
    world: W,
    /// Player controllers, indexed by player id. Advancement order.
    players: Vec<PlayerController>,
    pathfinder: PathFinder,
    tasks: TaskEngine,
    tick: Tick,
    game_completed: bool,
    /// Fog-of-war bookkeeping accumulated this tick, drained by the
    /// embedder's visibility layer.
    vision: Vec<VisionEvent>,
    /// Preprocessing requests surfaced to the client side.
    client_requests: Vec<ClientRequest>,
}

impl<W: WorldOracle> MatchEngine<W> {
    /// Create an engine over `world` with `player_count` player slots.
    #[must_use]
    pub fn new(world: W, player_count: u8) -> Self {
        Self {
            world,
            players: (0..player_count).map(PlayerController::new).collect(),
            pathfinder: PathFinder::default(),
            tasks: TaskEngine::new(),
            tick: 0,
            game_completed: false,
            vision: Vec::new(),
            client_requests: Vec::new(),
        }
    }

    /// Current tick number.
    #[must_use]
    pub const fn tick_count(&self) -> Tick {
        self.tick
    }

    /// The world oracle.
    #[must_use]
    pub const fn world(&self) -> &W {
        &self.world
    }

    /// A player controller.
    #[must_use]
    pub fn player(&self, index: PlayerId) -> Option<&PlayerController> {
        self.players.get(index as usize)
    }

    /// Spawn a unit voxel with a controller owned by `player`.
    pub fn spawn_unit(
        &mut self,
        player: PlayerId,
        coord: Coordinate,
        health: u32,
        caps: Capabilities,
    ) -> Result<VoxelId> {
        if usize::from(player) >= self.players.len() {
            return Err(SimError::InvalidPlayer(player));
        }
        if !self.world.is_valid_and_empty(0, coord) {
            return Err(SimError::InvalidState(format!(
                "cell {coord:?} is not free"
            )));
        }
        let record = VoxelRecord::new(coord, VoxelKind::Unit, health).owned_by(player);
        let id = self.world.create_voxel(record);
        self.players[player as usize].register_unit(UnitController::new(id, player, caps));
        Ok(id)
    }

    /// Spawn a passive asset voxel.
    pub fn spawn_asset(&mut self, coord: Coordinate, health: u32) -> Result<VoxelId> {
        if !self.world.is_valid_and_empty(0, coord) {
            return Err(SimError::InvalidState(format!(
                "cell {coord:?} is not free"
            )));
        }
        Ok(self
            .world
            .create_voxel(VoxelRecord::new(coord, VoxelKind::Asset, health)))
    }

    /// Submit a command on behalf of a player.
    ///
    /// Returns the acceptance status; the terminal status arrives later
    /// in a tick bundle.
    pub fn submit_command(&mut self, player: PlayerId, command: Command) -> Result<CommandStatus> {
        let Some(controller) = self.players.get_mut(player as usize) else {
            return Err(SimError::InvalidPlayer(player));
        };
        Ok(controller.set_command(&mut self.world, &mut self.pathfinder, command))
    }

    /// Submit a task tree.
    pub fn submit_task(&mut self, info: TaskInfo) -> Result<TaskId> {
        self.tasks.submit_task(info)
    }

    /// Answer an outstanding client preprocessing request.
    pub fn submit_task_response(&mut self, response: ClientResponse) -> Result<()> {
        self.tasks.submit_response(response)
    }

    /// Externally override a task's state.
    pub fn set_task_state(&mut self, task: TaskId, state: TaskState) -> Result<()> {
        self.tasks.set_task_state(task, state)
    }

    /// Current state of a live task.
    #[must_use]
    pub fn task_state(&self, task: TaskId) -> Option<TaskState> {
        self.tasks.task_state(task)
    }

    /// The task engine, for inspection.
    #[must_use]
    pub const fn tasks(&self) -> &TaskEngine {
        &self.tasks
    }

    /// Mark the match finished; the next bundle carries the flag.
    pub fn complete_game(&mut self) {
        self.game_completed = true;
    }

    /// Drain accumulated fog-of-war events.
    pub fn take_vision_events(&mut self) -> Vec<VisionEvent> {
        std::mem::take(&mut self.vision)
    }

    /// Drain surfaced preprocessing requests.
    pub fn take_client_requests(&mut self) -> Vec<ClientRequest> {
        std::mem::take(&mut self.client_requests)
    }

    /// Advance the match one tick and return the tick's bundle.
    ///
    /// Order within the tick: pathfinder budget slice, path completions,
    /// task programs, then each player's units in index order, then
    /// cross-player propagation.
    pub fn tick(&mut self) -> CommandsBundle {
        let now = self.tick;

        // 1. Pathfinder budget slice and completion delivery.
        self.pathfinder.update(&self.world);
        for completion in self.pathfinder.tick() {
            let owner = self
                .players
                .iter()
                .position(|p| p.owns_unit(completion.unit));
            if let Some(owner) = owner {
                self.players[owner].path_completed(&self.world, completion.unit, completion.result);
            }
        }

        // 2. Task programs, then hand their commands to the units.
        self.tasks.tick(now, &WorldFacts(&self.world));
        for command in self.tasks.drain_submissions() {
            let owner = self
                .players
                .iter()
                .position(|p| p.owns_unit(command.unit));
            match owner {
                Some(owner) => {
                    let unit = command.unit;
                    let accepted = self.players[owner].set_command(
                        &mut self.world,
                        &mut self.pathfinder,
                        command,
                    );
                    // Acceptance failures resolve the task immediately;
                    // successes resolve later via the completion signal.
                    if accepted.is_failure() {
                        self.tasks.notify_command_complete(unit, accepted);
                    }
                }
                None => {
                    self.tasks
                        .notify_command_complete(command.unit, CommandStatus::NoUnit);
                }
            }
        }

        // 3. Advance every player in index order.
        let mut bundle = CommandsBundle::new(now);
        let mut created = Vec::new();
        let mut consumed = Vec::new();
        let mut control_changes = Vec::new();
        for index in 0..self.players.len() {
            let delta = self.players[index].advance(&mut self.world, &mut self.pathfinder);
            for command in &delta.commands {
                Self::notify_resolved(&mut self.tasks, command);
            }
            bundle.player_commands.push(PlayerCommands {
                player: index as PlayerId,
                commands: delta.commands,
            });
            created.extend(delta.created);
            consumed.extend(delta.consumed);
            control_changes.extend(delta.control_changes);
            self.vision.extend(delta.vision);
        }

        // 4. Rebuild controllers for ownership transfers.
        for change in control_changes {
            for player in &mut self.players {
                player.remove_unit(change.voxel);
            }
            match change.new_owner {
                Some(owner) => {
                    self.world
                        .set_owner(change.voxel, Some(owner), VoxelKind::Unit);
                    if let Some(player) = self.players.get_mut(owner as usize) {
                        player.register_unit(UnitController::new(
                            change.voxel,
                            owner,
                            Capabilities::actor(),
                        ));
                    }
                }
                None => {
                    self.world.set_owner(change.voxel, None, VoxelKind::Asset);
                }
            }
        }

        // 5. Controllers for freshly created units (split siblings).
        for record in &created {
            if record.kind == VoxelKind::Unit {
                if let Some(owner) = record.owner {
                    if let Some(player) = self.players.get_mut(owner as usize) {
                        player.register_unit(UnitController::new(
                            record.id,
                            owner,
                            Capabilities::actor(),
                        ));
                    }
                }
            }
        }

        // 6. Cross-player propagation before the tick ends.
        for player in &mut self.players {
            player.observe_external(&created, &consumed);
        }

        // 7. Surface task lifecycle events.
        for event in self.tasks.drain_events() {
            match event {
                TaskEvent::StateChanged(change) => bundle.task_changes.push(change),
                TaskEvent::ClientRequest(request) => self.client_requests.push(request),
            }
        }

        bundle.game_completed = self.game_completed;
        self.tick += 1;

        #[cfg(debug_assertions)]
        {
            let hash = self.state_hash();
            tracing::debug!(tick = self.tick, state_hash = hash, "match state hash");
        }

        bundle
    }

    /// Route resolved unit commands into the task engine's completion
    /// signals, unwrapping composites and skipping pure transitions.
    fn notify_resolved(tasks: &mut TaskEngine, command: &Command) {
        match &command.kind {
            CommandKind::Composite { commands } => {
                for inner in commands {
                    Self::notify_resolved(tasks, inner);
                }
            }
            CommandKind::StateChanged { .. } => {}
            _ => {
                if command.status != CommandStatus::Pending {
                    tasks.notify_command_complete(command.unit, command.status);
                }
            }
        }
    }

    /// Calculate a hash of the current match state.
    ///
    /// Used for desync detection and replay verification. Two engines
    /// with identical state produce identical hashes.
    #[must_use]
    pub fn state_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.tick.hash(&mut hasher);
        self.world.world_hash().hash(&mut hasher);
        for player in &self.players {
            player.index().hash(&mut hasher);
            for id in player.unit_ids() {
                id.hash(&mut hasher);
                if let Some(unit) = player.unit(id) {
                    unit.state().hash(&mut hasher);
                }
            }
            player.known_voxels().hash(&mut hasher);
        }
        self.game_completed.hash(&mut hasher);
        hasher.finish()
    }

    /// Verify this engine against a remote replica's hash.
    pub fn check_sync(&self, remote_hash: u64) -> Result<()> {
        let local_hash = self.state_hash();
        if local_hash == remote_hash {
            Ok(())
        } else {
            Err(SimError::DesyncDetected {
                tick: self.tick,
                local_hash,
                remote_hash,
            })
        }
    }
}

impl<W: WorldOracle + Serialize> MatchEngine<W> {
    /// Serialize the full match state for snapshots and rejoin.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| SimError::InvalidState(format!("failed to serialize match: {e}")))
    }
}

impl<W: WorldOracle + DeserializeOwned> MatchEngine<W> {
    /// Restore a match from a snapshot.
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data)
            .map_err(|e| SimError::InvalidState(format!("failed to deserialize match: {e}")))
    }
}
