//! Per-player controller ownership.
//!
//! A [`PlayerController`] exclusively owns the unit controllers it was
//! assigned at spawn. Units are advanced in registration order; the
//! resulting per-tick command delta feeds the tick's
//! [`CommandsBundle`](crate::command::CommandsBundle).
//!
//! Cross-player side effects (voxel creation and removal) are pushed into
//! every other player's controller before the tick ends, so no player
//! ever observes a world older or newer than "after this tick's commands".

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::command::{Command, CommandStatus};
use crate::pathfinder::{PathFinder, SearchResult};
use crate::unit::{TickOutput, UnitController};
use crate::world::{PlayerId, VoxelId, VoxelRecord, WorldOracle};

/// Owns and advances one player's unit controllers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerController {
    index: PlayerId,
    /// Unit controllers in registration order. Order is part of the
    /// deterministic contract.
    units: Vec<UnitController>,
    /// Passive voxels assigned to this player.
    assets: BTreeSet<VoxelId>,
    /// Every voxel this player currently knows about, kept in sync by
    /// cross-player propagation.
    known: BTreeSet<VoxelId>,
}

impl PlayerController {
    /// Create an empty controller for a player slot.
    #[must_use]
    pub fn new(index: PlayerId) -> Self {
        Self {
            index,
            units: Vec::new(),
            assets: BTreeSet::new(),
            known: BTreeSet::new(),
        }
    }

    /// The player slot this controller belongs to.
    #[must_use]
    pub const fn index(&self) -> PlayerId {
        self.index
    }

    /// Register a unit controller. Registration order is preserved and
    /// determines per-tick advancement order.
    pub fn register_unit(&mut self, controller: UnitController) {
        self.known.insert(controller.id());
        self.units.push(controller);
    }

    /// Register a passive asset.
    pub fn register_asset(&mut self, id: VoxelId) {
        self.known.insert(id);
        self.assets.insert(id);
    }

    /// Remove and return the controller for `id`, if this player owns it.
    pub fn remove_unit(&mut self, id: VoxelId) -> Option<UnitController> {
        let position = self.units.iter().position(|u| u.id() == id)?;
        Some(self.units.remove(position))
    }

    /// Whether this player owns a controller for `id`.
    #[must_use]
    pub fn owns_unit(&self, id: VoxelId) -> bool {
        self.units.iter().any(|u| u.id() == id)
    }

    /// The controller for `id`, if owned.
    #[must_use]
    pub fn unit(&self, id: VoxelId) -> Option<&UnitController> {
        self.units.iter().find(|u| u.id() == id)
    }

    /// Unit ids in registration order.
    #[must_use]
    pub fn unit_ids(&self) -> Vec<VoxelId> {
        self.units.iter().map(UnitController::id).collect()
    }

    /// The set of voxels this player currently knows about.
    #[must_use]
    pub const fn known_voxels(&self) -> &BTreeSet<VoxelId> {
        &self.known
    }

    /// Dispatch a command to the owned target unit.
    pub fn set_command<W: WorldOracle>(
        &mut self,
        world: &mut W,
        pathfinder: &mut PathFinder,
        command: Command,
    ) -> CommandStatus {
        let Some(unit) = self.units.iter_mut().find(|u| u.id() == command.unit) else {
            return CommandStatus::NoUnit;
        };
        unit.set_command(world, pathfinder, command)
    }

    /// Deliver a finished path search to the owning unit.
    pub fn path_completed<W: WorldOracle>(
        &mut self,
        world: &W,
        unit: VoxelId,
        result: SearchResult,
    ) {
        if let Some(controller) = self.units.iter_mut().find(|u| u.id() == unit) {
            controller.path_completed(world, result);
        }
    }

    /// Advance every owned unit one tick, in registration order, and
    /// aggregate their outputs into one delta. Controllers that reached
    /// their terminal state are dropped the same tick.
    pub fn advance<W: WorldOracle>(
        &mut self,
        world: &mut W,
        pathfinder: &mut PathFinder,
    ) -> TickOutput {
        let mut delta = TickOutput::default();
        for unit in &mut self.units {
            let output = unit.tick(world, pathfinder);
            delta.commands.extend(output.commands);
            delta.created.extend(output.created);
            delta.consumed.extend(output.consumed);
            delta.vision.extend(output.vision);
            delta.control_changes.extend(output.control_changes);
        }
        self.units.retain(|u| !u.is_terminated());
        delta
    }

    /// Absorb another player's create/remove side effects. Called for
    /// every player before the tick ends.
    pub fn observe_external(&mut self, created: &[VoxelRecord], removed: &[VoxelId]) {
        for record in created {
            self.known.insert(record.id);
        }
        for id in removed {
            self.known.remove(id);
            self.assets.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandKind;
    use crate::coord::Coordinate;
    use crate::unit::Capabilities;
    use vox_test_utils::fixtures::{spawn_unit, GridWorld};

    fn coord(row: i32, col: i32) -> Coordinate {
        Coordinate::new(row, col, 0, 0)
    }

    #[test]
    fn test_command_to_unowned_unit_is_no_unit() {
        let mut world = GridWorld::new(8, 8);
        let mut finder = PathFinder::default();
        let mut player = PlayerController::new(0);
        let status = player.set_command(
            &mut world,
            &mut finder,
            Command::new(99, CommandKind::Nop),
        );
        assert_eq!(status, CommandStatus::NoUnit);
    }

    #[test]
    fn test_units_advance_in_registration_order() {
        let mut world = GridWorld::new(8, 8);
        let mut finder = PathFinder::default();
        let mut player = PlayerController::new(0);

        let first = spawn_unit(&mut world, 0, coord(1, 1), 100);
        let second = spawn_unit(&mut world, 0, coord(5, 5), 100);
        player.register_unit(UnitController::new(first, 0, Capabilities::actor()));
        player.register_unit(UnitController::new(second, 0, Capabilities::actor()));

        for id in [first, second] {
            player.set_command(
                &mut world,
                &mut finder,
                Command::new(id, CommandKind::Nop),
            );
        }
        let delta = player.advance(&mut world, &mut finder);
        let order: Vec<VoxelId> = delta
            .commands
            .iter()
            .filter(|c| matches!(c.kind, CommandKind::Nop))
            .map(|c| c.unit)
            .collect();
        assert_eq!(order, vec![first, second]);
    }

    #[test]
    fn test_terminated_controllers_are_pruned_same_tick() {
        let mut world = GridWorld::new(8, 8);
        let mut finder = PathFinder::default();
        let mut player = PlayerController::new(0);
        let id = spawn_unit(&mut world, 0, coord(1, 1), 100);
        player.register_unit(UnitController::new(id, 0, Capabilities::actor()));

        world.set_health(id, 0);
        player.advance(&mut world, &mut finder);
        assert!(!player.owns_unit(id));
    }

    #[test]
    fn test_external_observation_updates_known_set() {
        let mut player = PlayerController::new(1);
        let record = VoxelRecord::new(coord(2, 2), crate::world::VoxelKind::Asset, 5);
        let mut stamped = record;
        stamped.id = 7;
        player.observe_external(&[stamped], &[]);
        assert!(player.known_voxels().contains(&7));
        player.observe_external(&[], &[7]);
        assert!(!player.known_voxels().contains(&7));
    }
}
