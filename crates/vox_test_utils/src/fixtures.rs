//! Test fixtures and world helpers.
//!
//! [`GridWorld`] is the reference [`WorldOracle`] implementation used by
//! every test in the workspace: a finite multi-scale grid backed by an
//! arena of voxel records. Scale-aware occupancy is resolved by
//! projecting coordinates to the higher common weight, exactly the
//! contract [`Coordinate::same_cell`] documents.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use vox_core::coord::Coordinate;
use vox_core::world::{PlayerId, VoxelId, VoxelKind, VoxelRecord, WorldOracle};

/// A finite multi-scale grid world.
///
/// Occupancy rules:
/// - A cell is free iff no live voxel's footprint overlaps it at any
///   weight level.
/// - A unit may step into an adjacent free cell, or into a cell holding
///   a consumable (non-solid) asset - the simulation eats it.
/// - Solid voxels (walls) are never movable-into.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridWorld {
    rows: u32,
    cols: u32,
    records: BTreeMap<VoxelId, VoxelRecord>,
    /// Ids of voxels that block movement outright.
    solid: BTreeSet<VoxelId>,
    next_id: VoxelId,
}

impl GridWorld {
    /// Create a world with the given weight-0 dimensions, all cells free.
    #[must_use]
    pub fn new(rows: u32, cols: u32) -> Self {
        Self {
            rows,
            cols,
            records: BTreeMap::new(),
            solid: BTreeSet::new(),
            next_id: 1,
        }
    }

    /// Mark a voxel as solid (a wall): never movable-into, never eaten.
    pub fn set_solid(&mut self, id: VoxelId) {
        if self.records.contains_key(&id) {
            self.solid.insert(id);
        }
    }

    /// Number of live voxels.
    #[must_use]
    pub fn voxel_count(&self) -> usize {
        self.records.len()
    }

    /// Iterate all live records in id order.
    pub fn records(&self) -> impl Iterator<Item = &VoxelRecord> {
        self.records.values()
    }
}

impl WorldOracle for GridWorld {
    fn dimensions(&self, weight: u8) -> (u32, u32) {
        (self.rows >> weight, self.cols >> weight)
    }

    fn voxel_at(&self, coord: Coordinate) -> Option<VoxelId> {
        self.records
            .values()
            .find(|record| record.coord.same_cell(coord))
            .map(|record| record.id)
    }

    fn record(&self, id: VoxelId) -> Option<&VoxelRecord> {
        self.records.get(&id)
    }

    fn is_valid_and_empty(&self, id: VoxelId, coord: Coordinate) -> bool {
        self.in_bounds(coord)
            && !self
                .records
                .values()
                .any(|record| record.id != id && record.coord.same_cell(coord))
    }

    fn can_move(&self, id: VoxelId, from: Coordinate, to: Coordinate) -> bool {
        if !from.is_adjacent(to) || !self.in_bounds(to) {
            return false;
        }
        match self.voxel_at(to) {
            None => true,
            Some(occupant) if occupant == id => true,
            Some(occupant) => {
                // Consumable assets are movable-into; everything else
                // blocks.
                !self.solid.contains(&occupant)
                    && self
                        .records
                        .get(&occupant)
                        .is_some_and(|r| r.kind == VoxelKind::Asset)
            }
        }
    }

    fn create_voxel(&mut self, mut record: VoxelRecord) -> VoxelId {
        let id = self.next_id;
        self.next_id += 1;
        record.id = id;
        self.records.insert(id, record);
        id
    }

    fn remove_voxel(&mut self, id: VoxelId) -> Option<VoxelRecord> {
        self.solid.remove(&id);
        self.records.remove(&id)
    }

    fn move_voxel(&mut self, id: VoxelId, to: Coordinate) -> bool {
        if !self.is_valid_and_empty(id, to) {
            return false;
        }
        match self.records.get_mut(&id) {
            Some(record) => {
                record.coord = to;
                true
            }
            None => false,
        }
    }

    fn set_health(&mut self, id: VoxelId, health: u32) -> bool {
        match self.records.get_mut(&id) {
            Some(record) => {
                record.health = health;
                true
            }
            None => false,
        }
    }

    fn set_owner(&mut self, id: VoxelId, owner: Option<PlayerId>, kind: VoxelKind) -> bool {
        match self.records.get_mut(&id) {
            Some(record) => {
                record.owner = owner;
                record.kind = kind;
                true
            }
            None => false,
        }
    }

    fn world_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.rows.hash(&mut hasher);
        self.cols.hash(&mut hasher);
        for record in self.records.values() {
            record.hash(&mut hasher);
        }
        self.solid.hash(&mut hasher);
        hasher.finish()
    }
}

/// Spawn a unit voxel owned by `player`.
pub fn spawn_unit(world: &mut GridWorld, player: PlayerId, coord: Coordinate, health: u32) -> VoxelId {
    world.create_voxel(VoxelRecord::new(coord, VoxelKind::Unit, health).owned_by(player))
}

/// Spawn a consumable asset voxel (food, debris).
pub fn spawn_asset(world: &mut GridWorld, coord: Coordinate, health: u32) -> VoxelId {
    world.create_voxel(VoxelRecord::new(coord, VoxelKind::Asset, health))
}

/// Spawn a solid wall voxel: blocks movement and pathfinding.
pub fn spawn_blocker(world: &mut GridWorld, coord: Coordinate) -> VoxelId {
    let id = world.create_voxel(VoxelRecord::new(coord, VoxelKind::Asset, 1));
    world.set_solid(id);
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coord(row: i32, col: i32, weight: u8) -> Coordinate {
        Coordinate::new(row, col, 0, weight)
    }

    #[test]
    fn test_dimensions_halve_per_weight() {
        let world = GridWorld::new(16, 8);
        assert_eq!(world.dimensions(0), (16, 8));
        assert_eq!(world.dimensions(1), (8, 4));
        assert_eq!(world.dimensions(2), (4, 2));
    }

    #[test]
    fn test_scale_aware_occupancy() {
        let mut world = GridWorld::new(16, 16);
        // A weight-1 voxel at (2, 2) covers weight-0 cells (4..6, 4..6).
        let big = world.create_voxel(VoxelRecord::new(coord(2, 2, 1), VoxelKind::Unit, 10));
        assert_eq!(world.voxel_at(coord(4, 4, 0)), Some(big));
        assert_eq!(world.voxel_at(coord(5, 5, 0)), Some(big));
        assert_eq!(world.voxel_at(coord(6, 6, 0)), None);
        assert!(!world.is_valid_and_empty(0, coord(4, 5, 0)));
        assert!(world.is_valid_and_empty(big, coord(4, 5, 0)));
    }

    #[test]
    fn test_can_move_rules() {
        let mut world = GridWorld::new(8, 8);
        let unit = spawn_unit(&mut world, 0, coord(1, 1, 0), 10);
        let food = spawn_asset(&mut world, coord(1, 2, 0), 1);
        let wall = spawn_blocker(&mut world, coord(2, 1, 0));
        let _ = (food, wall);

        // Into a consumable asset: allowed.
        assert!(world.can_move(unit, coord(1, 1, 0), coord(1, 2, 0)));
        // Into a wall: blocked.
        assert!(!world.can_move(unit, coord(1, 1, 0), coord(2, 1, 0)));
        // Into a free cell: allowed.
        assert!(world.can_move(unit, coord(1, 1, 0), coord(0, 1, 0)));
        // Non-adjacent: never.
        assert!(!world.can_move(unit, coord(1, 1, 0), coord(3, 3, 0)));
        // Out of bounds: never.
        assert!(!world.can_move(unit, coord(1, 1, 0), coord(1, 0, 0).step(vox_core::coord::Direction::West)));
    }

    #[test]
    fn test_move_voxel_rejects_occupied_cell() {
        let mut world = GridWorld::new(8, 8);
        let a = spawn_unit(&mut world, 0, coord(1, 1, 0), 10);
        let _b = spawn_unit(&mut world, 0, coord(1, 2, 0), 10);
        assert!(!world.move_voxel(a, coord(1, 2, 0)));
        assert!(world.move_voxel(a, coord(2, 1, 0)));
        assert_eq!(world.record(a).unwrap().coord, coord(2, 1, 0));
    }

    #[test]
    fn test_world_hash_tracks_mutations() {
        let mut world = GridWorld::new(8, 8);
        let before = world.world_hash();
        let id = spawn_unit(&mut world, 0, coord(1, 1, 0), 10);
        let with_unit = world.world_hash();
        assert_ne!(before, with_unit);
        world.remove_voxel(id);
        assert_eq!(world.world_hash(), before);
    }
}
