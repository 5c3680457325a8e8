//! Scale-aware grid coordinates.
//!
//! The world is a hierarchy of square grids. The `weight` of a coordinate
//! selects the grid scale: weight 0 is the finest grid, and every weight
//! step up doubles the cell edge, so one cell at weight `w` covers a
//! 2x2 block of cells at weight `w - 1`. `row` and `col` are relative to
//! the grid of the coordinate's own weight.
//!
//! Two coordinates address the same physical cell iff their projections
//! to the higher of the two weights match. [`Coordinate::to_weight`] is
//! that projection and is used everywhere occupancy is compared across
//! scales.

use serde::{Deserialize, Serialize};

/// A world address: grid cell plus altitude slot plus scale.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Coordinate {
    /// Row in the grid of this coordinate's weight.
    pub row: i32,
    /// Column in the grid of this coordinate's weight.
    pub col: i32,
    /// Altitude slot. Each cell holds at most one voxel per slot.
    pub altitude: i32,
    /// Grid scale. Lower weight = finer granularity.
    pub weight: u8,
}

impl Coordinate {
    /// Create a new coordinate.
    #[must_use]
    pub const fn new(row: i32, col: i32, altitude: i32, weight: u8) -> Self {
        Self {
            row,
            col,
            altitude,
            weight,
        }
    }

    /// Project this coordinate onto another weight level.
    ///
    /// Projecting to a coarser grid maps to the covering cell. Projecting
    /// to a finer grid maps to the north-west corner of the covered block;
    /// callers that need a specific sub-cell offset from there.
    #[must_use]
    pub fn to_weight(self, weight: u8) -> Self {
        let shift = i32::from(self.weight.abs_diff(weight));
        let (row, col) = if weight >= self.weight {
            (self.row >> shift, self.col >> shift)
        } else {
            (self.row << shift, self.col << shift)
        };
        Self {
            row,
            col,
            altitude: self.altitude,
            weight,
        }
    }

    /// Whether two coordinates denote the same physical cell.
    ///
    /// True iff the projections onto the higher common weight match.
    #[must_use]
    pub fn same_cell(self, other: Self) -> bool {
        let weight = self.weight.max(other.weight);
        self.to_weight(weight) == other.to_weight(weight)
    }

    /// Whether `other` is one unit step away (same weight, same altitude,
    /// Manhattan distance exactly 1).
    #[must_use]
    pub fn is_adjacent(self, other: Self) -> bool {
        self.weight == other.weight
            && self.altitude == other.altitude
            && self.row.abs_diff(other.row) + self.col.abs_diff(other.col) == 1
    }

    /// The neighboring coordinate one step in `direction`.
    #[must_use]
    pub const fn step(self, direction: Direction) -> Self {
        let (dr, dc) = direction.delta();
        Self {
            row: self.row + dr,
            col: self.col + dc,
            altitude: self.altitude,
            weight: self.weight,
        }
    }

    /// Squared map distance to `other`, measured on the higher common
    /// weight so mixed-scale comparisons are meaningful.
    #[must_use]
    pub fn distance_squared(self, other: Self) -> i64 {
        let weight = self.weight.max(other.weight);
        let a = self.to_weight(weight);
        let b = other.to_weight(weight);
        let dr = i64::from(a.row - b.row);
        let dc = i64::from(a.col - b.col);
        dr * dr + dc * dc
    }
}

/// The four cardinal directions, in the fixed scan order used by every
/// neighbor loop in the simulation.
///
/// The scan order is part of the deterministic contract: path
/// reconstruction takes the *first* valid predecessor, so replicas must
/// agree on what "first" means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Row - 1.
    North,
    /// Col + 1.
    East,
    /// Row + 1.
    South,
    /// Col - 1.
    West,
}

impl Direction {
    /// All directions in the pinned scan order.
    pub const SCAN_ORDER: [Self; 4] = [Self::North, Self::East, Self::South, Self::West];

    /// The (row, col) delta for one step in this direction.
    #[must_use]
    pub const fn delta(self) -> (i32, i32) {
        match self {
            Self::North => (-1, 0),
            Self::East => (0, 1),
            Self::South => (1, 0),
            Self::West => (0, -1),
        }
    }

    /// The direction after one counter-clockwise quarter turn.
    #[must_use]
    pub const fn rotated_left(self) -> Self {
        match self {
            Self::North => Self::West,
            Self::West => Self::South,
            Self::South => Self::East,
            Self::East => Self::North,
        }
    }

    /// The direction after one clockwise quarter turn.
    #[must_use]
    pub const fn rotated_right(self) -> Self {
        match self {
            Self::North => Self::East,
            Self::East => Self::South,
            Self::South => Self::West,
            Self::West => Self::North,
        }
    }

    /// The direction of a single unit step from `from` to `to`, if the
    /// two coordinates are exactly one step apart.
    #[must_use]
    pub fn between(from: Coordinate, to: Coordinate) -> Option<Self> {
        if !from.is_adjacent(to) {
            return None;
        }
        match (to.row - from.row, to.col - from.col) {
            (-1, 0) => Some(Self::North),
            (0, 1) => Some(Self::East),
            (1, 0) => Some(Self::South),
            (0, -1) => Some(Self::West),
            _ => None,
        }
    }
}

impl Default for Direction {
    fn default() -> Self {
        Self::North
    }
}
