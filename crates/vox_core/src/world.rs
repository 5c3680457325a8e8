//! The world oracle interface.
//!
//! The core never owns grid storage. All world queries and mutations go
//! through [`WorldOracle`], implemented by the embedding application (and
//! by the test fixtures). Voxel records are addressed by index-like ids
//! with an optional visual binding rather than live object references, so
//! a unit destroyed mid-tick can never leave a dangling pointer behind.

use serde::{Deserialize, Serialize};

use crate::coord::Coordinate;

/// Unique identifier for voxel records (units and assets alike).
pub type VoxelId = u64;

/// Player index within a match. Players are always advanced in index order.
pub type PlayerId = u8;

/// Whether a voxel is controllable or passive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VoxelKind {
    /// A controllable voxel. Has a controller and a command queue.
    Unit,
    /// A passive voxel. Selectable and targetable, but never commanded.
    Asset,
}

/// One voxel record in the world arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VoxelRecord {
    /// Arena id. Assigned by the world on creation.
    pub id: VoxelId,
    /// Current world address.
    pub coord: Coordinate,
    /// Unit or asset.
    pub kind: VoxelKind,
    /// Current health points.
    pub health: u32,
    /// Owning player, if any. Assets spawned by the map have no owner.
    pub owner: Option<PlayerId>,
    /// Optional binding to a visual representation, opaque to the core.
    pub visual: Option<u32>,
}

impl VoxelRecord {
    /// Create an unowned record with no id. The world assigns the id.
    #[must_use]
    pub const fn new(coord: Coordinate, kind: VoxelKind, health: u32) -> Self {
        Self {
            id: 0,
            coord,
            kind,
            health,
            owner: None,
            visual: None,
        }
    }

    /// Builder-style owner assignment.
    #[must_use]
    pub const fn owned_by(mut self, player: PlayerId) -> Self {
        self.owner = Some(player);
        self
    }
}

/// Visibility bookkeeping record.
///
/// Every coordinate or weight change of a unit emits a matched
/// ignore/observe pair; the fog-of-war layer consumes these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VisionEvent {
    /// A unit's vision footprint now covers this cell.
    Observe(Coordinate),
    /// A unit's vision footprint no longer covers this cell.
    Ignore(Coordinate),
}

/// The queryable, mutable world the simulation runs against.
///
/// Implementations must answer queries deterministically: given the same
/// sequence of mutations, every replica's oracle must return identical
/// results, including [`world_hash`](Self::world_hash).
pub trait WorldOracle {
    /// Grid dimensions (rows, cols) at the given weight level.
    fn dimensions(&self, weight: u8) -> (u32, u32);

    /// The voxel occupying this cell, if any. Occupancy is scale-aware:
    /// a voxel at a coarser weight occupies all finer cells it covers.
    fn voxel_at(&self, coord: Coordinate) -> Option<VoxelId>;

    /// Look up a voxel record by id.
    fn record(&self, id: VoxelId) -> Option<&VoxelRecord>;

    /// Whether the cell is in bounds and free for `id` to occupy
    /// (the voxel's own current footprint does not count as occupied).
    fn is_valid_and_empty(&self, id: VoxelId, coord: Coordinate) -> bool;

    /// Whether `id` may step from `from` to `to` this tick. Uses the same
    /// occupancy rules as [`is_valid_and_empty`](Self::is_valid_and_empty),
    /// except that a cell holding a consumable asset is movable-into.
    fn can_move(&self, id: VoxelId, from: Coordinate, to: Coordinate) -> bool;

    /// Create a voxel. Returns the assigned id (the `id` field of the
    /// passed record is ignored).
    fn create_voxel(&mut self, record: VoxelRecord) -> VoxelId;

    /// Remove a voxel, returning its final record.
    fn remove_voxel(&mut self, id: VoxelId) -> Option<VoxelRecord>;

    /// Move (or rescale - the coordinate carries the weight) a voxel.
    /// Returns false if the voxel does not exist or the cell is taken.
    fn move_voxel(&mut self, id: VoxelId, to: Coordinate) -> bool;

    /// Set a voxel's health. Returns false if the voxel does not exist.
    fn set_health(&mut self, id: VoxelId, health: u32) -> bool;

    /// Reclassify a voxel under a new owner. Used by conversion, split
    /// and room-leave; the match engine rebuilds controllers to match.
    fn set_owner(&mut self, id: VoxelId, owner: Option<PlayerId>, kind: VoxelKind) -> bool;

    /// Deterministic hash over the full world state.
    fn world_hash(&self) -> u64;

    /// Whether the coordinate lies inside the grid at its weight.
    fn in_bounds(&self, coord: Coordinate) -> bool {
        let (rows, cols) = self.dimensions(coord.weight);
        coord.row >= 0
            && coord.col >= 0
            && (coord.row as u32) < rows
            && (coord.col as u32) < cols
    }
}
