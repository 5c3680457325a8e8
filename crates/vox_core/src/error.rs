//! Error types for the match simulation.

use thiserror::Error;

use crate::world::{PlayerId, VoxelId};

/// Result type alias using [`SimError`].
pub type Result<T> = std::result::Result<T, SimError>;

/// Top-level error type for all match simulation errors.
///
/// These are API-level failures. In-band command outcomes (a move that
/// could not complete, a task that timed out) are reported through
/// [`CommandStatus`](crate::command::CommandStatus) instead and never
/// cross subsystem boundaries as errors.
#[derive(Debug, Error)]
pub enum SimError {
    /// Referenced voxel does not exist.
    #[error("Voxel not found: {0}")]
    VoxelNotFound(VoxelId),

    /// Referenced voxel has no controller (passive asset, or destroyed).
    #[error("Voxel {0} has no controller")]
    NoController(VoxelId),

    /// Unknown player index.
    #[error("Invalid player index: {0}")]
    InvalidPlayer(PlayerId),

    /// Malformed or out-of-order bundle.
    #[error("Invalid bundle for tick {tick}: {message}")]
    InvalidBundle {
        /// Tick the bundle claimed.
        tick: u64,
        /// What was wrong with it.
        message: String,
    },

    /// Invalid simulation state.
    #[error("Invalid match state: {0}")]
    InvalidState(String),

    /// Desync detected between replicas.
    #[error("Desync detected at tick {tick}: local hash {local_hash}, remote hash {remote_hash}")]
    DesyncDetected {
        /// Tick where the desync occurred.
        tick: u64,
        /// Local simulation hash.
        local_hash: u64,
        /// Remote simulation hash.
        remote_hash: u64,
    },
}
