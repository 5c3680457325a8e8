//! # Vox Core
//!
//! Deterministic match simulation core for Voxel Skirmish.
//!
//! This crate contains **only** deterministic logic:
//! - No rendering
//! - No IO
//! - No system randomness
//! - Integer arithmetic throughout (the grid is integral)
//!
//! This separation enables:
//! - Lockstep multiplayer (identical simulation across clients)
//! - Headless server builds
//! - Replay systems
//! - Determinism testing
//!
//! ## Crate Structure
//!
//! - [`coord`] - Scale-aware grid coordinates
//! - [`command`] - Commands and per-tick command bundles
//! - [`world`] - The world oracle interface the core queries and mutates
//! - [`scheduler`] - Client tick scheduler and bundle reconciliation
//! - [`unit`] - The per-unit command state machine
//! - [`pathfinder`] - Budgeted incremental breadth-first pathfinder
//! - [`task`] - Composable multi-tick task programs
//! - [`engine`] - The match engine tick loop
//! - [`replay`] - Command-log recording and playback

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod command;
pub mod coord;
pub mod engine;
pub mod error;
pub mod expr;
pub mod pathfinder;
pub mod player;
pub mod replay;
pub mod scheduler;
pub mod task;
pub mod unit;
pub mod world;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::command::{
        Command, CommandKind, CommandStatus, CommandsBundle, PlayerCommands, Tick,
    };
    pub use crate::coord::{Coordinate, Direction};
    pub use crate::engine::MatchEngine;
    pub use crate::error::{Result, SimError};
    pub use crate::expr::{Expr, Value};
    pub use crate::pathfinder::{PathFinder, SearchResult};
    pub use crate::scheduler::{Advance, SchedulerConfig, TickScheduler};
    pub use crate::task::{TaskEngine, TaskId, TaskInfo, TaskKind, TaskState};
    pub use crate::unit::{Capabilities, UnitController, UnitState};
    pub use crate::world::{PlayerId, VoxelId, VoxelKind, VoxelRecord, WorldOracle};
}
