//! # Vox Headless
//!
//! Headless match runner for CI verification and batch testing.
//!
//! Loads a RON scenario, runs the deterministic simulation for a fixed
//! number of ticks without any rendering, and reports the final state
//! hash. Replays recorded here can be re-verified bit-exactly on any
//! machine.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod runner;
pub mod scenario;

use thiserror::Error;

/// Headless runner errors.
#[derive(Debug, Error)]
pub enum HeadlessError {
    /// Scenario file could not be read.
    #[error("cannot read scenario '{path}': {message}")]
    ScenarioRead {
        /// Path to the file.
        path: String,
        /// Underlying error.
        message: String,
    },

    /// Scenario file could not be parsed.
    #[error("cannot parse scenario '{path}': {message}")]
    ScenarioParse {
        /// Path to the file.
        path: String,
        /// Underlying error.
        message: String,
    },

    /// Simulation-level failure.
    #[error(transparent)]
    Sim(#[from] vox_core::error::SimError),
}
